//! Domain models for the merge engine.
//!
//! These are the typed forms of the source snapshot. They are built once
//! by the [`crate::services::SnapshotIndexer`] and afterwards only the
//! `balance` and `status` fields of [`Account`] ever change.

mod decimal;
mod distribution;
mod ordered_map;
mod pubkey;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{SnapshotError, SnapshotResult};
use crate::utils::{malformed, parse_amount, require_str};

pub use decimal::{Dec, PRECISION, ParseDecError};
pub use distribution::{
    DecCoins, DelegatorStartingInfo, DistributionState, PerDelegation, ValidatorCurrentRewards,
    ValidatorSlashEvent,
};
pub use ordered_map::OrderedMap;
pub use pubkey::{ED25519_TYPE, MAX_KEY_DEPTH, MULTISIG_TYPE, PubKey, SECP256K1_TYPE};

// =============================================================================
// Raw Address
// =============================================================================

/// Chain-agnostic address identity (the bytes behind a bech32 string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawAddress(pub Vec<u8>);

impl RawAddress {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for RawAddress {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RawAddress {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for RawAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RawAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map(Self).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Coins
// =============================================================================

/// Denom-sorted multiset of token amounts. Zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Coins(BTreeMap<String, u128>);

impl Coins {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single coin, or empty coins when `amount` is zero.
    pub fn single(denom: impl Into<String>, amount: u128) -> Self {
        let mut coins = Self::new();
        if amount > 0 {
            coins.0.insert(denom.into(), amount);
        }
        coins
    }

    pub fn amount_of(&self, denom: &str) -> u128 {
        self.0.get(denom).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u128)> {
        self.0.iter().map(|(d, a)| (d.as_str(), *a))
    }

    /// Sum of both multisets, `None` on overflow.
    pub fn checked_add(&self, other: &Coins) -> Option<Coins> {
        let mut out = self.clone();
        for (denom, amount) in other.iter() {
            let entry = out.0.entry(denom.to_string()).or_insert(0);
            *entry = entry.checked_add(amount)?;
        }
        Some(out)
    }

    /// Difference, `None` if any denom would go below zero.
    pub fn checked_sub(&self, other: &Coins) -> Option<Coins> {
        let mut out = self.clone();
        for (denom, amount) in other.iter() {
            let current = out.amount_of(denom);
            let rest = current.checked_sub(amount)?;
            if rest == 0 {
                out.0.remove(denom);
            } else {
                out.0.insert(denom.to_string(), rest);
            }
        }
        Some(out)
    }

    /// Difference clamped at zero per denom.
    pub fn saturating_sub(&self, other: &Coins) -> Coins {
        self.iter()
            .map(|(d, a)| (d.to_string(), a.saturating_sub(other.amount_of(d))))
            .collect()
    }

    /// True if every denom is at most `limit`.
    pub fn all_within(&self, limit: u128) -> bool {
        self.0.values().all(|a| *a <= limit)
    }

    /// Parse the snapshot form `[{"denom": ..., "amount": ...}]`.
    pub fn from_json(value: &Value, path: &str) -> SnapshotResult<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| malformed(path, "expected a coin array"))?;
        let mut coins = Self::new();
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{path}[{i}]");
            let denom = require_str(item, &item_path, "denom")?;
            let amount = item
                .get("amount")
                .and_then(parse_amount)
                .ok_or_else(|| malformed(&format!("{item_path}.amount"), "expected an unsigned integer"))?;
            if coins.0.contains_key(denom) {
                return Err(SnapshotError::DuplicateEntry {
                    section: path.to_string(),
                    key: denom.to_string(),
                });
            }
            if amount > 0 {
                coins.0.insert(denom.to_string(), amount);
            }
        }
        Ok(coins)
    }
}

impl FromIterator<(String, u128)> for Coins {
    fn from_iter<I: IntoIterator<Item = (String, u128)>>(iter: I) -> Self {
        let mut coins = Self::new();
        for (denom, amount) in iter {
            if amount > 0 {
                let entry = coins.0.entry(denom).or_insert(0);
                *entry = entry.saturating_add(amount);
            }
        }
        coins
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(d, a)| format!("{a}{d}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Serialize, Deserialize)]
struct CoinRepr {
    denom: String,
    amount: String,
}

impl Serialize for Coins {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|(denom, amount)| CoinRepr {
            denom: denom.to_string(),
            amount: amount.to_string(),
        }))
    }
}

impl<'de> Deserialize<'de> for Coins {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = Vec::<CoinRepr>::deserialize(deserializer)?;
        let mut coins = Coins::new();
        for item in items {
            let amount: u128 = item.amount.parse().map_err(serde::de::Error::custom)?;
            if coins.0.contains_key(&item.denom) {
                return Err(serde::de::Error::custom(format!("duplicate denom {}", item.denom)));
            }
            if amount > 0 {
                coins.0.insert(item.denom, amount);
            }
        }
        Ok(coins)
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// How an account is routed through the pipeline. Fixed at indexing time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountClassification {
    Base,
    Module { name: String },
    Contract,
    IbcEscrow { channel_id: String, port_id: String },
}

impl AccountClassification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Module { .. } => "module",
            Self::Contract => "contract",
            Self::IbcEscrow { .. } => "ibc_escrow",
        }
    }
}

/// Source vesting account flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VestingKind {
    Delayed,
    Continuous,
    PermanentLocked,
    Periodic,
}

impl VestingKind {
    /// Map an account `@type` to its vesting flavour.
    pub fn from_type_url(type_url: &str) -> Option<Self> {
        match type_url {
            "/cosmos.vesting.v1beta1.DelayedVestingAccount" => Some(Self::Delayed),
            "/cosmos.vesting.v1beta1.ContinuousVestingAccount" => Some(Self::Continuous),
            "/cosmos.vesting.v1beta1.PermanentLockedAccount" => Some(Self::PermanentLocked),
            "/cosmos.vesting.v1beta1.PeriodicVestingAccount" => Some(Self::Periodic),
            _ => None,
        }
    }
}

/// Vesting data carried by a source vesting account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingSchedule {
    pub kind: VestingKind,
    pub original_vesting: Coins,
    pub start_time: Option<i64>,
    pub end_time: i64,
}

/// Migration status. Moves forward exactly once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    #[default]
    Unmigrated,
    Migrated,
}

/// Indexed source account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Source chain address string (index key).
    pub address: String,
    pub raw: RawAddress,
    pub pub_key: Option<PubKey>,
    pub account_number: u64,
    pub sequence: u64,
    pub balance: Coins,
    pub classification: AccountClassification,
    /// Set for the vesting account types.
    pub vesting: Option<VestingSchedule>,
    pub status: MigrationStatus,
}

impl Account {
    /// Plain base account with an empty balance.
    pub fn new_base(address: impl Into<String>, raw: RawAddress) -> Self {
        Self {
            address: address.into(),
            raw,
            pub_key: None,
            account_number: 0,
            sequence: 0,
            balance: Coins::new(),
            classification: AccountClassification::Base,
            vesting: None,
            status: MigrationStatus::Unmigrated,
        }
    }

    pub fn is_migrated(&self) -> bool {
        self.status == MigrationStatus::Migrated
    }

    pub fn module_name(&self) -> Option<&str> {
        match &self.classification {
            AccountClassification::Module { name } => Some(name),
            _ => None,
        }
    }
}

// =============================================================================
// Staking
// =============================================================================

/// Validator bonding status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BondStatus {
    Bonded,
    Unbonding,
    Unbonded,
    Other(String),
}

impl BondStatus {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "BOND_STATUS_BONDED" => Self::Bonded,
            "BOND_STATUS_UNBONDING" => Self::Unbonding,
            "BOND_STATUS_UNBONDED" => Self::Unbonded,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_bonded(&self) -> bool {
        matches!(self, Self::Bonded)
    }
}

/// Indexed validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorInfo {
    pub operator_address: String,
    pub consensus_pubkey: PubKey,
    /// Total delegated stake.
    pub tokens: u128,
    /// Total issued shares.
    pub delegator_shares: Dec,
    pub status: BondStatus,
}

impl ValidatorInfo {
    /// `floor(shares * tokens / delegator_shares)`.
    pub fn tokens_from_shares(&self, shares: &Dec) -> Option<u128> {
        shares.mul_div_floor(self.tokens, &self.delegator_shares)
    }
}

/// Delegation with its shares already converted to tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delegation {
    pub delegator: String,
    pub validator_id: String,
    pub validator_operator: String,
    pub tokens: u128,
}

/// One outstanding entry of an unbonding delegation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbondingEntry {
    pub delegator: String,
    pub validator_operator: String,
    pub balance: u128,
    pub initial_balance: u128,
    pub creation_height: u64,
    pub completion_time: String,
}

// =============================================================================
// Contracts & IBC
// =============================================================================

/// Admin/creator pair of a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractInfo {
    pub admin: Option<String>,
    pub creator: Option<String>,
}

/// Channel whose transfer escrow lives at a derived address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IbcEscrow {
    pub port_id: String,
    pub channel_id: String,
}

impl IbcEscrow {
    /// `"<port>/<channel>"`.
    pub fn path(&self) -> String {
        format!("{}/{}", self.port_id, self.channel_id)
    }
}

// =============================================================================
// Movements
// =============================================================================

/// Atomic transfer between two indexed accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMovement {
    pub from: String,
    pub to: String,
    pub amount: Coins,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn coins(pairs: &[(&str, u128)]) -> Coins {
        pairs.iter().map(|(d, a)| (d.to_string(), *a)).collect()
    }

    #[test]
    fn test_coins_drop_zero_entries() {
        let c = coins(&[("acudos", 0), ("token", 5)]);
        assert_eq!(c.len(), 1);
        assert!(Coins::single("acudos", 0).is_empty());
    }

    #[test]
    fn test_coins_checked_sub() {
        let a = coins(&[("acudos", 100), ("token", 5)]);
        let b = coins(&[("token", 5)]);
        assert_eq!(a.checked_sub(&b), Some(coins(&[("acudos", 100)])));
        assert_eq!(b.checked_sub(&a), None);
    }

    #[test]
    fn test_coins_saturating_sub_and_tolerance() {
        let a = coins(&[("acudos", 100), ("token", 5)]);
        let b = coins(&[("acudos", 150)]);
        let rest = a.saturating_sub(&b);
        assert_eq!(rest, coins(&[("token", 5)]));
        assert!(rest.all_within(5));
        assert!(!rest.all_within(4));
    }

    #[test]
    fn test_coins_json_sorted_by_denom() {
        let c = coins(&[("zeta", 1), ("acudos", 2)]);
        let value = serde_json::to_value(&c).unwrap();
        assert_eq!(
            value,
            json!([{"denom": "acudos", "amount": "2"}, {"denom": "zeta", "amount": "1"}])
        );
        assert_eq!(serde_json::from_value::<Coins>(value).unwrap(), c);
    }

    #[test]
    fn test_coins_from_snapshot_rejects_duplicates() {
        let value = json!([{"denom": "a", "amount": "1"}, {"denom": "a", "amount": 2}]);
        assert!(matches!(
            Coins::from_json(&value, "bank.balances[0].coins"),
            Err(SnapshotError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_bond_status_parse() {
        assert!(BondStatus::parse("BOND_STATUS_BONDED").is_bonded());
        assert_eq!(BondStatus::parse("BOND_STATUS_UNBONDED"), BondStatus::Unbonded);
        assert_eq!(BondStatus::parse("JAILED"), BondStatus::Other("JAILED".into()));
    }

    #[test]
    fn test_validator_exchange_rate() {
        let validator = ValidatorInfo {
            operator_address: "cudosvaloper1".into(),
            consensus_pubkey: PubKey::Ed25519(vec![1; 32]),
            tokens: 1000,
            delegator_shares: "1000.0".parse().unwrap(),
            status: BondStatus::Bonded,
        };
        assert_eq!(validator.tokens_from_shares(&"250.0".parse().unwrap()), Some(250));
        assert_eq!(validator.tokens_from_shares(&"333.33".parse().unwrap()), Some(333));
    }

    #[test]
    fn test_ibc_escrow_path() {
        let escrow = IbcEscrow {
            port_id: "transfer".into(),
            channel_id: "channel-0".into(),
        };
        assert_eq!(escrow.path(), "transfer/channel-0");
    }
}
