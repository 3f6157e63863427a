//! Network configuration.
//!
//! Everything chain-specific the merge needs (prefixes, target addresses,
//! conversion constants, exemption lists, tolerances) is carried by one
//! [`NetworkConfig`] value passed into the pipeline. It is loaded from JSON,
//! optionally checked against an expected SHA-256, and fully validated by
//! [`NetworkConfig::verify`] before any balance is touched.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::error::{ConfigError, ConfigResult};
use crate::manifest::Cw2Version;
use crate::models::{Coins, Dec, OrderedMap};
use crate::utils::{amount_string, option_amount_string};

/// Default tolerance for leftovers on the staking pools.
pub const DEFAULT_MAX_REMAINING_STAKING_BALANCE: u128 = 100_000_000;

/// Default tolerance for leftovers on the distribution module.
pub const DEFAULT_MAX_REMAINING_DISTRIBUTION_BALANCE: u128 = 1_000_000_000_000_000_000;

/// Default tolerance between converted supply and minted amount.
pub const DEFAULT_MAX_SUPPLY_DIFFERENCE: u128 = 10_000_000_000;

/// Default tolerance for unallocated authorized supply.
pub const DEFAULT_MAX_REMAINING_MINT_BALANCE: u128 = 100_000_000;

/// Suffix of validator operator prefixes.
pub const VALOPER_SUFFIX: &str = "valoper";

fn default_staking_tolerance() -> u128 {
    DEFAULT_MAX_REMAINING_STAKING_BALANCE
}

fn default_distribution_tolerance() -> u128 {
    DEFAULT_MAX_REMAINING_DISTRIBUTION_BALANCE
}

fn default_supply_difference() -> u128 {
    DEFAULT_MAX_SUPPLY_DIFFERENCE
}

fn default_mint_tolerance() -> u128 {
    DEFAULT_MAX_REMAINING_MINT_BALANCE
}

// =============================================================================
// Configuration Types
// =============================================================================

/// Top-level network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub merge_source_chain_id: String,
    pub destination_chain_id: String,
    /// Account prefix of the source chain (e.g. `cudos`).
    pub source_address_prefix: String,
    /// Account prefix of the destination chain (e.g. `fetch`).
    pub destination_address_prefix: String,
    /// Denom every converted balance is minted in.
    pub destination_denom: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_info: Option<ReconciliationInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contracts: Option<ContractSet>,
    #[serde(alias = "cudos_merge")]
    pub merge: MergeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationInfo {
    pub target_address: String,
}

/// Contracts mutated on the destination ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_bridge: Option<TokenBridgeContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub almanac: Option<ProdDevContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a_name: Option<ProdDevContract>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationContract {
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_admin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_contract_version: Option<ContractVersion>,
}

/// Requested contract version change. `cw_2_version = None` deletes the
/// version record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cw_2_version: Option<Cw2Version>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBridgeContract {
    pub addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_admin: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProdDevContract {
    #[serde(default)]
    pub prod_addr: String,
    #[serde(default)]
    pub dev_addr: String,
}

impl ProdDevContract {
    /// Configured (non-empty) addresses, prod first.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        [self.prod_addr.as_str(), self.dev_addr.as_str()]
            .into_iter()
            .filter(|a| !a.is_empty())
    }
}

/// Explicit account-to-account movement of bond-denom balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovedAccount {
    pub from: String,
    pub to: String,
    /// Amount to move; the whole bond-denom balance when absent.
    #[serde(default, with = "option_amount_string", skip_serializing_if = "Option::is_none")]
    pub amount: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

/// Fixed destination supply for the merge.
///
/// Exactly `total_supply_to_mint` is created. Whatever the converted
/// source supply does not account for is commission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupplyAuthorization {
    /// Source supply the mint is priced against, in the bond denom.
    #[serde(with = "amount_string")]
    pub total_source_supply: u128,
    #[serde(with = "amount_string")]
    pub total_supply_to_mint: u128,
    /// Destination address receiving the commission.
    pub commission_addr: String,
    /// Source address credited with supply no account holds.
    pub extra_supply_addr: String,
    #[serde(
        default = "default_mint_tolerance",
        with = "amount_string",
        rename = "max_remaining_mint_module_balance"
    )]
    pub max_remaining_mint_balance: u128,
}

/// Merge-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    // Source-chain addresses
    pub ibc_target_addr: String,
    pub remaining_staking_balance_addr: String,
    pub remaining_gravity_balance_addr: String,
    pub remaining_distribution_balance_addr: String,
    pub generic_module_remaining_balance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_destination_fallback_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_pool_balance_dest_addr: Option<String>,

    // Destination-chain addresses
    pub vesting_collision_dest_addr: String,

    /// Length of the vesting schedule in seconds.
    pub vesting_period: i64,

    /// `[[denom, constant], ...]`; destination = floor(source / constant).
    pub balance_conversion_constants: Vec<(String, Dec)>,

    #[serde(default)]
    pub not_vested_accounts: Vec<String>,
    #[serde(default)]
    pub not_delegated_accounts: Vec<String>,
    #[serde(default)]
    pub moved_accounts: Vec<MovedAccount>,

    /// `[[source_valoper, destination_valoper], ...]`.
    #[serde(default)]
    pub validators_map: Vec<(String, String)>,
    #[serde(default)]
    pub backup_validators: Vec<String>,

    #[serde(
        default = "default_distribution_tolerance",
        with = "amount_string",
        rename = "max_remaining_distribution_module_balance"
    )]
    pub max_remaining_distribution_balance: u128,
    #[serde(
        default = "default_staking_tolerance",
        with = "amount_string",
        rename = "max_remaining_staking_module_balance"
    )]
    pub max_remaining_staking_balance: u128,
    #[serde(default = "default_supply_difference", with = "amount_string")]
    pub max_supply_difference: u128,
    #[serde(default)]
    pub fail_on_supply_mismatch: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_supply: Option<SupplyAuthorization>,
}

impl MergeConfig {
    pub fn is_vesting_exempt(&self, address: &str) -> bool {
        self.not_vested_accounts.iter().any(|a| a == address)
    }

    pub fn is_delegation_exempt(&self, address: &str) -> bool {
        self.not_delegated_accounts.iter().any(|a| a == address)
    }

    /// Destination validator mapped to a source operator address.
    pub fn mapped_validator(&self, source_operator: &str) -> Option<&str> {
        self.validators_map
            .iter()
            .find(|(src, _)| src == source_operator)
            .map(|(_, dst)| dst.as_str())
    }
}

// =============================================================================
// Conversion
// =============================================================================

/// Result of converting one balance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversion {
    pub converted: Coins,
    /// Source denoms with no conversion constant.
    pub dropped: Vec<String>,
}

/// Per-denom conversion table into the destination denom.
#[derive(Debug, Clone)]
pub struct ConversionTable {
    constants: OrderedMap<String, Dec>,
    output_denom: String,
}

impl ConversionTable {
    pub fn new(constants: &[(String, Dec)], output_denom: impl Into<String>) -> Self {
        Self {
            constants: constants.iter().cloned().collect(),
            output_denom: output_denom.into(),
        }
    }

    pub fn output_denom(&self) -> &str {
        &self.output_denom
    }

    pub fn is_convertible(&self, denom: &str) -> bool {
        self.constants.contains_key(denom)
    }

    /// True if any denom of `coins` has a constant.
    pub fn converts_any(&self, coins: &Coins) -> bool {
        coins.iter().any(|(denom, _)| self.is_convertible(denom))
    }

    /// `floor(amount / constant)` for a single source denom.
    ///
    /// Returns `None` for unknown denoms or on overflow.
    pub fn convert_amount(&self, denom: &str, amount: u128) -> Option<u128> {
        self.constants.get(denom)?.divide_floor(amount)
    }

    /// Convert every denom that has a constant into the output denom.
    ///
    /// Returns `None` only on overflow.
    pub fn convert(&self, balance: &Coins) -> Option<Conversion> {
        let mut total: u128 = 0;
        let mut dropped = Vec::new();
        for (denom, amount) in balance.iter() {
            match self.constants.get(denom) {
                Some(constant) => total = total.checked_add(constant.divide_floor(amount)?)?,
                None => dropped.push(denom.to_string()),
            }
        }
        Some(Conversion {
            converted: Coins::single(self.output_denom.clone(), total),
            dropped,
        })
    }
}

// =============================================================================
// Loading & Verification
// =============================================================================

impl NetworkConfig {
    /// Parse the JSON form.
    pub fn from_json(bytes: &[u8]) -> ConfigResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn conversion_table(&self) -> ConversionTable {
        ConversionTable::new(&self.merge.balance_conversion_constants, &self.destination_denom)
    }

    pub fn source_valoper_prefix(&self) -> String {
        format!("{}{VALOPER_SUFFIX}", self.source_address_prefix)
    }

    pub fn destination_valoper_prefix(&self) -> String {
        format!("{}{VALOPER_SUFFIX}", self.destination_address_prefix)
    }

    /// Validate every address and constraint. Run before the merge starts.
    pub fn verify(&self) -> ConfigResult<()> {
        let src = self.source_address_prefix.as_str();
        let dst = self.destination_address_prefix.as_str();
        let src_valoper = self.source_valoper_prefix();
        let dst_valoper = self.destination_valoper_prefix();
        let m = &self.merge;

        if src.is_empty() || dst.is_empty() {
            return Err(ConfigError::Invalid("address prefixes must be set".into()));
        }
        if self.destination_denom.is_empty() {
            return Err(ConfigError::Invalid("destination_denom must be set".into()));
        }

        check_address("ibc_target_addr", &m.ibc_target_addr, src)?;
        check_address("remaining_staking_balance_addr", &m.remaining_staking_balance_addr, src)?;
        check_address("remaining_gravity_balance_addr", &m.remaining_gravity_balance_addr, src)?;
        check_address(
            "remaining_distribution_balance_addr",
            &m.remaining_distribution_balance_addr,
            src,
        )?;
        check_address(
            "generic_module_remaining_balance",
            &m.generic_module_remaining_balance,
            src,
        )?;
        if let Some(addr) = &m.contract_destination_fallback_addr {
            check_address("contract_destination_fallback_addr", addr, src)?;
        }
        if let Some(addr) = &m.community_pool_balance_dest_addr {
            check_address("community_pool_balance_dest_addr", addr, src)?;
        }
        check_address("vesting_collision_dest_addr", &m.vesting_collision_dest_addr, dst)?;

        for addr in &m.not_vested_accounts {
            check_address("not_vested_accounts", addr, src)?;
        }
        for addr in &m.not_delegated_accounts {
            check_address("not_delegated_accounts", addr, src)?;
        }
        for movement in &m.moved_accounts {
            check_address("moved_accounts.from", &movement.from, src)?;
            check_address("moved_accounts.to", &movement.to, src)?;
            if movement.from == movement.to {
                return Err(ConfigError::Invalid(format!(
                    "movement from {} to itself",
                    movement.from
                )));
            }
        }
        for (source_validator, dest_validator) in &m.validators_map {
            check_address("validators_map source", source_validator, &src_valoper)?;
            check_address("validators_map destination", dest_validator, &dst_valoper)?;
        }

        if m.backup_validators.is_empty() {
            return Err(ConfigError::Invalid("backup_validators must not be empty".into()));
        }
        for validator in &m.backup_validators {
            check_address("backup_validators", validator, &dst_valoper)?;
        }

        if m.balance_conversion_constants.is_empty() {
            return Err(ConfigError::Invalid(
                "balance_conversion_constants must not be empty".into(),
            ));
        }
        for (denom, constant) in &m.balance_conversion_constants {
            if constant.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "conversion constant for {denom} must be positive"
                )));
            }
        }
        if m.vesting_period < 0 {
            return Err(ConfigError::Invalid("vesting_period must not be negative".into()));
        }
        if let Some(supply) = &m.authorized_supply {
            check_address("authorized_supply.commission_addr", &supply.commission_addr, dst)?;
            check_address("authorized_supply.extra_supply_addr", &supply.extra_supply_addr, src)?;
            if supply.total_supply_to_mint == 0 {
                return Err(ConfigError::Invalid(
                    "authorized_supply.total_supply_to_mint must be positive".into(),
                ));
            }
        }

        if let Some(info) = &self.reconciliation_info {
            check_address("reconciliation_info.target_address", &info.target_address, dst)?;
        }
        if let Some(contracts) = &self.contracts {
            if let Some(c) = &contracts.reconciliation {
                check_address("contracts.reconciliation.addr", &c.addr, dst)?;
                if let Some(admin) = &c.new_admin {
                    check_address("contracts.reconciliation.new_admin", admin, dst)?;
                }
            }
            if let Some(c) = &contracts.token_bridge {
                check_address("contracts.token_bridge.addr", &c.addr, dst)?;
                if let Some(admin) = &c.new_admin {
                    check_address("contracts.token_bridge.new_admin", admin, dst)?;
                }
            }
            for c in [&contracts.almanac, &contracts.a_name].into_iter().flatten() {
                for addr in c.addresses() {
                    check_address("contracts prod/dev addr", addr, dst)?;
                }
            }
        }
        Ok(())
    }
}

fn check_address(field: &str, address: &str, prefix: &str) -> ConfigResult<()> {
    codec::decode(address, prefix)
        .map(|_| ())
        .map_err(|source| ConfigError::InvalidAddress {
            field: field.to_string(),
            source,
        })
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check `data` against an expected hex digest.
///
/// A missing expectation counts as verified. Returns the actual digest.
pub fn verify_sha256(file: &str, data: &[u8], expected: Option<&str>) -> ConfigResult<String> {
    let actual = sha256_hex(data);
    let Some(expected) = expected else {
        return Ok(actual);
    };
    let expected_bytes =
        hex::decode(expected).map_err(|_| ConfigError::InvalidHash(expected.to_string()))?;
    if hex::encode(expected_bytes) != actual {
        return Err(ConfigError::HashMismatch {
            file: file.to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;
    use crate::fixtures::{config_json, dst_addr, dst_valoper, src_addr};

    #[test]
    fn test_sample_config_verifies() {
        let config: NetworkConfig = serde_json::from_value(config_json()).unwrap();
        config.verify().unwrap();
        assert_eq!(
            config.merge.max_remaining_staking_balance,
            DEFAULT_MAX_REMAINING_STAKING_BALANCE
        );
        assert!(!config.merge.fail_on_supply_mismatch);
    }

    #[test]
    fn test_accepts_legacy_section_name() {
        let mut value = config_json();
        let merge = value.as_object_mut().unwrap().remove("merge").unwrap();
        value["cudos_merge"] = merge;
        let config: NetworkConfig = serde_json::from_value(value).unwrap();
        assert_eq!(config.merge.vesting_period, 3600);
    }

    #[test]
    fn test_authorized_supply_parsed_and_checked() {
        let mut value = config_json();
        value["merge"]["authorized_supply"] = serde_json::json!({
            "total_source_supply": "1000",
            "total_supply_to_mint": "120",
            "commission_addr": dst_addr(0xD1),
            "extra_supply_addr": src_addr(0xD2)
        });
        let config: NetworkConfig = serde_json::from_value(value.clone()).unwrap();
        config.verify().unwrap();
        let supply = config.merge.authorized_supply.unwrap();
        assert_eq!(supply.total_supply_to_mint, 120);
        assert_eq!(supply.max_remaining_mint_balance, DEFAULT_MAX_REMAINING_MINT_BALANCE);

        value["merge"]["authorized_supply"]["commission_addr"] = serde_json::json!(src_addr(0xD1));
        let config: NetworkConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(
            config.verify().unwrap_err(),
            ConfigError::InvalidAddress { field, .. } if field == "authorized_supply.commission_addr"
        ));
    }

    // Fail fast: a destination address where a source one is expected
    #[test]
    fn test_rejects_wrong_prefix() {
        let mut value = config_json();
        value["merge"]["ibc_target_addr"] = serde_json::json!(dst_valoper(1));
        let config: NetworkConfig = serde_json::from_value(value).unwrap();
        match config.verify().unwrap_err() {
            ConfigError::InvalidAddress { field, source } => {
                assert_eq!(field, "ibc_target_addr");
                assert!(matches!(source, CodecError::PrefixMismatch { .. }));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_rejects_self_movement_and_empty_lists() {
        let mut value = config_json();
        value["merge"]["moved_accounts"] =
            serde_json::json!([{"from": src_addr(1), "to": src_addr(1)}]);
        let config: NetworkConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(config.verify(), Err(ConfigError::Invalid(_))));

        let mut value = config_json();
        value["merge"]["backup_validators"] = serde_json::json!([]);
        let config: NetworkConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(config.verify(), Err(ConfigError::Invalid(_))));

        let mut value = config_json();
        value["merge"]["balance_conversion_constants"] = serde_json::json!([["acudos", "0"]]);
        let config: NetworkConfig = serde_json::from_value(value).unwrap();
        assert!(matches!(config.verify(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_conversion_drops_unlisted_denoms() {
        let table = ConversionTable::new(&[("acudos".to_string(), "10".parse().unwrap())], "afet");
        let balance: Coins = [("acudos".to_string(), 100), ("ibc/ABC".to_string(), 5)]
            .into_iter()
            .collect();
        let conversion = table.convert(&balance).unwrap();
        assert_eq!(conversion.converted, Coins::single("afet", 10));
        assert_eq!(conversion.dropped, vec!["ibc/ABC".to_string()]);
    }

    #[test]
    fn test_conversion_of_dust_is_empty() {
        let table = ConversionTable::new(&[("acudos".to_string(), "10".parse().unwrap())], "afet");
        let conversion = table.convert(&Coins::single("acudos", 9)).unwrap();
        assert!(conversion.converted.is_empty());
    }

    #[test]
    fn test_verify_sha256() {
        let data = b"{}";
        let actual = sha256_hex(data);
        assert_eq!(verify_sha256("c.json", data, None).unwrap(), actual);
        assert_eq!(verify_sha256("c.json", data, Some(&actual.to_uppercase())).unwrap(), actual);
        assert!(matches!(
            verify_sha256("c.json", data, Some(&"00".repeat(32))),
            Err(ConfigError::HashMismatch { .. })
        ));
        assert!(matches!(
            verify_sha256("c.json", data, Some("zz")),
            Err(ConfigError::InvalidHash(_))
        ));
    }
}
