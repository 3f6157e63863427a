//! Upgrade manifest.
//!
//! Append-only audit record of every balance movement, mint, account
//! creation, delegation plan entry and contract mutation performed by a
//! merge run. Each section keeps running aggregates next to its detail
//! list; [`UpgradeManifest::verify`] re-derives them and fails with
//! [`MergeError::ManifestMismatch`] on any disagreement.
//!
//! # Layout
//!
//! ```text
//! UpgradeManifest
//! ├── header (hashes, chain ids, source height)
//! ├── initial_balances     per-account holdings before any movement
//! ├── ibc                  transfer[]      + aggregated_transferred_amount
//! ├── move_genesis_balance movements[]     + aggregated_moved_amount
//! ├── moved_balances       holdings of every touched account after movements
//! ├── migration            migration[]     + aggregated_migrated_amount
//! ├── created_accounts     accounts[]      + number_of_creations
//! ├── vesting_collision    collisions[]    + number_of_collisions
//! ├── delegate             delegation[]    + aggregated_delegated_amount
//! ├── contracts            state/admin/label/version updates
//! ├── reconciliation       transfers + contract_state
//! └── supply_check
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MergeError, MergeResult, SignatureError};
use crate::models::Coins;
use crate::ports::SignatureScheme;
use crate::utils::amount_string;

/// Base file name of a persisted manifest.
pub const MANIFEST_FILE_NAME: &str = "upgrade_manifest.json";

// =============================================================================
// Sections
// =============================================================================

/// One escrow withdrawal, recorded even when the channel held nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbcTransfer {
    pub from: String,
    /// `"<port>/<channel>"`.
    pub channel_id: String,
    pub amount: Coins,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IbcTransfers {
    pub to: String,
    #[serde(rename = "transfer")]
    pub transfers: Vec<IbcTransfer>,
    pub aggregated_transferred_amount: Coins,
    pub number_of_transfers: usize,
}

/// Balance movement or mint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub source_balance: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub dest_balance: Coins,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movements {
    pub movements: Vec<BalanceRecord>,
    pub aggregated_moved_amount: Coins,
    pub number_of_movements: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migrations {
    #[serde(rename = "migration")]
    pub migrations: Vec<BalanceRecord>,
    pub aggregated_migrated_amount: Coins,
    pub number_of_migrations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCreation {
    pub address: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedAccounts {
    pub accounts: Vec<AccountCreation>,
    pub number_of_creations: usize,
}

/// Account whose converted funds could not get a vesting schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingCollision {
    pub original_account: String,
    pub original_account_funds: Coins,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_account: Option<String>,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub target_account_funds: Coins,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VestingCollisions {
    pub collisions: Vec<VestingCollision>,
    pub number_of_collisions: usize,
}

/// Planned re-delegation on the destination chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedDelegation {
    pub original_validator: String,
    pub new_validator: String,
    pub new_delegator: String,
    #[serde(with = "amount_string")]
    pub original_tokens: u128,
    #[serde(with = "amount_string")]
    pub new_tokens: u128,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationPlan {
    #[serde(rename = "delegation")]
    pub delegations: Vec<PlannedDelegation>,
    #[serde(with = "amount_string")]
    pub aggregated_delegated_amount: u128,
    pub number_of_delegations: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractValueUpdate {
    pub address: String,
    pub from: String,
    pub to: String,
}

/// CW2 `contract_info` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cw2Version {
    pub contract: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractVersionUpdate {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Cw2Version>,
    pub to: Option<Cw2Version>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMutations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts_state_cleaned: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts_admin_updated: Vec<ContractValueUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts_label_updated: Vec<ContractValueUpdate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contracts_version_updated: Vec<ContractVersionUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationTransfer {
    pub from: String,
    pub eth_addr: String,
    pub amount: Coins,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationTransfers {
    pub transfers: Vec<ReconciliationTransfer>,
    pub to: String,
    pub aggregated_transferred_amount: Coins,
    pub number_of_transfers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationBalance {
    pub eth_addr: String,
    pub balances: Coins,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationContractState {
    pub balances: Vec<ReconciliationBalance>,
    pub aggregated_balances_amount: Coins,
    pub number_of_balance_records: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfers: Option<ReconciliationTransfers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_state: Option<ReconciliationContractState>,
}

/// Amount held through one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorBalance {
    pub validator: String,
    pub balance: Coins,
}

/// Everything one source account holds, directly or through staking and
/// distribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalances {
    pub address: String,
    pub bank_balance: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub vested_balance: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub bonded_staking_balances_aggr: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub unbonded_staking_balances_aggr: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub unbonding_staking_balances_aggr: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub delegator_rewards_aggr: Coins,
    #[serde(default, skip_serializing_if = "Coins::is_empty")]
    pub validator_rewards: Coins,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bonded_staking_balances: Vec<ValidatorBalance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unbonded_staking_balances: Vec<ValidatorBalance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unbonding_staking_balances: Vec<ValidatorBalance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delegator_rewards: Vec<ValidatorBalance>,
}

/// Converted source supply against what was actually minted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyCheck {
    pub denom: String,
    #[serde(with = "amount_string")]
    pub expected: u128,
    #[serde(with = "amount_string")]
    pub minted: u128,
    #[serde(with = "amount_string")]
    pub difference: u128,
    #[serde(with = "amount_string")]
    pub max_difference: u128,
    pub within_tolerance: bool,
}

// =============================================================================
// Manifest
// =============================================================================

/// Audit record of one merge run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeManifest {
    // Hashes are always written, even when unverified.
    #[serde(default)]
    pub genesis_file_sha256: String,
    #[serde(default)]
    pub network_config_file_sha256: String,
    #[serde(default)]
    pub merge_source_chain_id: String,
    #[serde(default)]
    pub destination_chain_id: String,
    #[serde(default)]
    pub source_chain_block_height: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_balances: Option<Vec<AccountBalances>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ibc: Option<IbcTransfers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_genesis_balance: Option<Movements>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_balances: Option<Vec<AccountBalances>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<Migrations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_accounts: Option<CreatedAccounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vesting_collision: Option<VestingCollisions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<DelegationPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contracts: Option<ContractMutations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<Reconciliation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply_check: Option<SupplyCheck>,
}

fn add_coins(total: &Coins, amount: &Coins, section: &str) -> MergeResult<Coins> {
    total
        .checked_add(amount)
        .ok_or_else(|| MergeError::Overflow(format!("{section} aggregate")))
}

impl UpgradeManifest {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Start the IBC section. Called once, before any escrow is withdrawn.
    pub fn begin_ibc(&mut self, to: &str) {
        self.ibc.get_or_insert_with(|| IbcTransfers {
            to: to.to_string(),
            ..Default::default()
        });
    }

    pub fn record_ibc_transfer(&mut self, from: &str, channel_path: String, amount: Coins) -> MergeResult<()> {
        let section = self.ibc.get_or_insert_with(IbcTransfers::default);
        section.aggregated_transferred_amount =
            add_coins(&section.aggregated_transferred_amount, &amount, "ibc")?;
        section.transfers.push(IbcTransfer {
            from: from.to_string(),
            channel_id: channel_path,
            amount,
        });
        section.number_of_transfers = section.transfers.len();
        Ok(())
    }

    pub fn record_movement(
        &mut self,
        from: &str,
        to: &str,
        amount: Coins,
        memo: Option<String>,
    ) -> MergeResult<()> {
        let section = self.move_genesis_balance.get_or_insert_with(Movements::default);
        section.aggregated_moved_amount =
            add_coins(&section.aggregated_moved_amount, &amount, "move_genesis_balance")?;
        section.movements.push(BalanceRecord {
            from: from.to_string(),
            to: to.to_string(),
            source_balance: Coins::new(),
            dest_balance: amount,
            memo,
        });
        section.number_of_movements = section.movements.len();
        Ok(())
    }

    pub fn record_migration(&mut self, record: BalanceRecord) -> MergeResult<()> {
        let section = self.migration.get_or_insert_with(Migrations::default);
        section.aggregated_migrated_amount =
            add_coins(&section.aggregated_migrated_amount, &record.dest_balance, "migration")?;
        section.migrations.push(record);
        section.number_of_migrations = section.migrations.len();
        Ok(())
    }

    pub fn record_created_account(&mut self, address: &str, reason: &str) {
        let section = self.created_accounts.get_or_insert_with(CreatedAccounts::default);
        section.accounts.push(AccountCreation {
            address: address.to_string(),
            reason: reason.to_string(),
        });
        section.number_of_creations = section.accounts.len();
    }

    pub fn record_vesting_collision(&mut self, collision: VestingCollision) {
        let section = self.vesting_collision.get_or_insert_with(VestingCollisions::default);
        section.collisions.push(collision);
        section.number_of_collisions = section.collisions.len();
    }

    pub fn record_delegation(&mut self, delegation: PlannedDelegation) -> MergeResult<()> {
        let section = self.delegate.get_or_insert_with(DelegationPlan::default);
        section.aggregated_delegated_amount = section
            .aggregated_delegated_amount
            .checked_add(delegation.new_tokens)
            .ok_or_else(|| MergeError::Overflow("delegate aggregate".into()))?;
        section.delegations.push(delegation);
        section.number_of_delegations = section.delegations.len();
        Ok(())
    }

    pub fn contracts_mut(&mut self) -> &mut ContractMutations {
        self.contracts.get_or_insert_with(ContractMutations::default)
    }

    pub fn record_reconciliation_transfer(
        &mut self,
        to: &str,
        transfer: ReconciliationTransfer,
    ) -> MergeResult<()> {
        let reconciliation = self.reconciliation.get_or_insert_with(Reconciliation::default);
        let section = reconciliation
            .transfers
            .get_or_insert_with(|| ReconciliationTransfers {
                to: to.to_string(),
                ..Default::default()
            });
        section.aggregated_transferred_amount = add_coins(
            &section.aggregated_transferred_amount,
            &transfer.amount,
            "reconciliation.transfers",
        )?;
        section.transfers.push(transfer);
        section.number_of_transfers = section.transfers.len();
        Ok(())
    }

    pub fn record_reconciliation_balance(&mut self, record: ReconciliationBalance) -> MergeResult<()> {
        let reconciliation = self.reconciliation.get_or_insert_with(Reconciliation::default);
        let section = reconciliation
            .contract_state
            .get_or_insert_with(ReconciliationContractState::default);
        section.aggregated_balances_amount = add_coins(
            &section.aggregated_balances_amount,
            &record.balances,
            "reconciliation.contract_state",
        )?;
        section.balances.push(record);
        section.number_of_balance_records = section.balances.len();
        Ok(())
    }

    /// Total minted so far.
    pub fn aggregated_migrated_amount(&self) -> Coins {
        self.migration
            .as_ref()
            .map(|m| m.aggregated_migrated_amount.clone())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check every section's counters and aggregates against its details.
    pub fn verify(&self) -> MergeResult<()> {
        if let Some(ibc) = &self.ibc {
            check_count("ibc", "number_of_transfers", ibc.number_of_transfers, ibc.transfers.len())?;
            check_sum(
                "ibc",
                "aggregated_transferred_amount",
                &ibc.aggregated_transferred_amount,
                ibc.transfers.iter().map(|t| &t.amount),
            )?;
        }
        if let Some(moves) = &self.move_genesis_balance {
            check_count(
                "move_genesis_balance",
                "number_of_movements",
                moves.number_of_movements,
                moves.movements.len(),
            )?;
            check_sum(
                "move_genesis_balance",
                "aggregated_moved_amount",
                &moves.aggregated_moved_amount,
                moves.movements.iter().map(|m| &m.dest_balance),
            )?;
        }
        if let Some(migration) = &self.migration {
            check_count(
                "migration",
                "number_of_migrations",
                migration.number_of_migrations,
                migration.migrations.len(),
            )?;
            check_sum(
                "migration",
                "aggregated_migrated_amount",
                &migration.aggregated_migrated_amount,
                migration.migrations.iter().map(|m| &m.dest_balance),
            )?;
        }
        if let Some(created) = &self.created_accounts {
            check_count(
                "created_accounts",
                "number_of_creations",
                created.number_of_creations,
                created.accounts.len(),
            )?;
        }
        if let Some(collisions) = &self.vesting_collision {
            check_count(
                "vesting_collision",
                "number_of_collisions",
                collisions.number_of_collisions,
                collisions.collisions.len(),
            )?;
        }
        if let Some(plan) = &self.delegate {
            check_count(
                "delegate",
                "number_of_delegations",
                plan.number_of_delegations,
                plan.delegations.len(),
            )?;
            let total = plan
                .delegations
                .iter()
                .try_fold(0u128, |acc, d| acc.checked_add(d.new_tokens))
                .ok_or_else(|| MergeError::Overflow("delegate aggregate".into()))?;
            if total != plan.aggregated_delegated_amount {
                return Err(mismatch(
                    "delegate",
                    format!(
                        "aggregated_delegated_amount is {} but delegations sum to {total}",
                        plan.aggregated_delegated_amount
                    ),
                ));
            }
        }
        if let Some(reconciliation) = &self.reconciliation {
            if let Some(transfers) = &reconciliation.transfers {
                check_count(
                    "reconciliation.transfers",
                    "number_of_transfers",
                    transfers.number_of_transfers,
                    transfers.transfers.len(),
                )?;
                check_sum(
                    "reconciliation.transfers",
                    "aggregated_transferred_amount",
                    &transfers.aggregated_transferred_amount,
                    transfers.transfers.iter().map(|t| &t.amount),
                )?;
            }
            if let Some(state) = &reconciliation.contract_state {
                check_count(
                    "reconciliation.contract_state",
                    "number_of_balance_records",
                    state.number_of_balance_records,
                    state.balances.len(),
                )?;
                check_sum(
                    "reconciliation.contract_state",
                    "aggregated_balances_amount",
                    &state.aggregated_balances_amount,
                    state.balances.iter().map(|b| &b.balances),
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Serialization & attestation
    // -------------------------------------------------------------------------

    /// Tab-indented JSON for human review.
    pub fn to_pretty_json(&self) -> MergeResult<Vec<u8>> {
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        self.serialize(&mut serializer)
            .map_err(|e| MergeError::Serialization(e.to_string()))?;
        Ok(out)
    }

    pub fn from_json(bytes: &[u8]) -> MergeResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| MergeError::Serialization(e.to_string()))
    }

    /// SHA-256 of the compact JSON form.
    pub fn digest(&self) -> MergeResult<[u8; 32]> {
        let compact = serde_json::to_vec(self).map_err(|e| MergeError::Serialization(e.to_string()))?;
        Ok(Sha256::digest(&compact).into())
    }

    /// Sign the digest with every key and aggregate the signatures.
    pub fn attest(
        &self,
        scheme: &dyn SignatureScheme,
        secret_keys: &[Vec<u8>],
    ) -> MergeResult<Attestation> {
        if secret_keys.is_empty() {
            return Err(SignatureError::EmptyAggregate.into());
        }
        let digest = self.digest()?;
        let mut signatures = Vec::with_capacity(secret_keys.len());
        let mut public_keys = Vec::with_capacity(secret_keys.len());
        for key in secret_keys {
            signatures.push(scheme.sign(key, &digest)?);
            public_keys.push(scheme.public_key(key)?);
        }
        let signature = scheme.aggregate_signatures(&signatures)?;
        Ok(Attestation {
            digest: hex::encode(digest),
            public_keys: public_keys.iter().map(hex::encode).collect(),
            signature: hex::encode(signature),
        })
    }

    /// Check an attestation against this manifest's current digest.
    pub fn verify_attestation(
        &self,
        scheme: &dyn SignatureScheme,
        attestation: &Attestation,
    ) -> MergeResult<bool> {
        let digest = self.digest()?;
        if attestation.digest != hex::encode(digest) {
            return Ok(false);
        }
        let decode = |s: &str| {
            hex::decode(s).map_err(|e| SignatureError::InvalidKey(e.to_string()))
        };
        let public_keys = attestation
            .public_keys
            .iter()
            .map(|k| decode(k))
            .collect::<Result<Vec<_>, _>>()?;
        let signature = hex::decode(&attestation.signature)
            .map_err(|e| SignatureError::InvalidSignature(e.to_string()))?;
        let aggregate_key = scheme.aggregate_public_keys(&public_keys)?;
        Ok(scheme.verify(&aggregate_key, &digest, &signature)?)
    }
}

/// Aggregate signature over a manifest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub digest: String,
    pub public_keys: Vec<String>,
    pub signature: String,
}

fn mismatch(section: &str, reason: String) -> MergeError {
    MergeError::ManifestMismatch {
        section: section.to_string(),
        reason,
    }
}

fn check_count(section: &str, field: &str, recorded: usize, actual: usize) -> MergeResult<()> {
    if recorded != actual {
        return Err(mismatch(
            section,
            format!("{field} is {recorded} but {actual} entries are listed"),
        ));
    }
    Ok(())
}

fn check_sum<'a>(
    section: &str,
    field: &str,
    recorded: &Coins,
    amounts: impl Iterator<Item = &'a Coins>,
) -> MergeResult<()> {
    let mut total = Coins::new();
    for amount in amounts {
        total = add_coins(&total, amount, section)?;
    }
    if &total != recorded {
        return Err(mismatch(
            section,
            format!("{field} is [{recorded}] but entries sum to [{total}]"),
        ));
    }
    Ok(())
}
