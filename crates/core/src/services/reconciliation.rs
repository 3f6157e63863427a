//! Reconciliation of externally-listed addresses.
//!
//! # Flow
//!
//! ```text
//! CSV rows ──► filter ──► send full balance ──► reconciliation target
//!                              │
//!                              └──► manifest.reconciliation.transfers
//!                                          │
//!                                          ▼
//!                      ReconciliationContractWriter ──► contract storage
//! ```
//!
//! Rows whose account is missing, empty or already used (nonzero sequence)
//! are skipped. The contract writer then stores one balance record per
//! transfer plus the `total_balance`, `n_outstanding_addresses` and `state`
//! scalars.

use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::config::NetworkConfig;
use crate::error::{ConfigError, LedgerError, MergeError, MergeResult};
use crate::manifest::{ReconciliationBalance, ReconciliationTransfer, UpgradeManifest};
use crate::metrics::{StageTimer, record_skipped_row};
use crate::models::{Coins, RawAddress};
use crate::ports::Ledger;

/// Namespace of per-address balance records.
pub const BALANCES_NAMESPACE: &[u8] = b"balances";

/// Key of the aggregated balance scalar.
pub const TOTAL_BALANCE_KEY: &[u8] = b"total_balance";

/// Key of the outstanding address counter.
pub const N_OUTSTANDING_ADDRESSES_KEY: &[u8] = b"n_outstanding_addresses";

/// Key of the contract state flag.
pub const STATE_KEY: &[u8] = b"state";

const PAUSED_STATE: &[u8] = br#"{"paused":true}"#;

// =============================================================================
// Input rows
// =============================================================================

/// One row of the reconciliation CSV: `[eth_address, _, address, ...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationRow {
    pub eth_address: String,
    /// Destination-prefixed address holding the funds.
    pub address: String,
}

impl ReconciliationRow {
    /// Build a row from raw CSV fields.
    pub fn from_record<S: AsRef<str>>(row: usize, fields: &[S]) -> MergeResult<Self> {
        if fields.len() < 3 {
            return Err(MergeError::InvalidReconciliationRow {
                row,
                reason: format!("expected at least 3 columns, got {}", fields.len()),
            });
        }
        Ok(Self {
            eth_address: fields[0].as_ref().trim().to_string(),
            address: fields[2].as_ref().trim().to_string(),
        })
    }
}

/// Storage key of the balance record for `eth_address`.
///
/// `u16_be(len(namespace)) || namespace || address bytes`. A `0x` or `x`
/// prefix is stripped before hex decoding.
pub fn balance_record_key(eth_address: &str) -> Result<Vec<u8>, String> {
    let stripped = eth_address
        .strip_prefix("0x")
        .or_else(|| eth_address.strip_prefix("0X"))
        .or_else(|| eth_address.strip_prefix('x'))
        .unwrap_or(eth_address);
    let bytes = hex::decode(stripped).map_err(|e| format!("{eth_address}: {e}"))?;

    let mut key = Vec::with_capacity(2 + BALANCES_NAMESPACE.len() + bytes.len());
    key.extend_from_slice(&(BALANCES_NAMESPACE.len() as u16).to_be_bytes());
    key.extend_from_slice(BALANCES_NAMESPACE);
    key.extend_from_slice(&bytes);
    Ok(key)
}

// =============================================================================
// Processor
// =============================================================================

/// Moves listed balances to the reconciliation target and rewrites the
/// reconciliation contract.
pub struct ReconciliationProcessor<'a, L: Ledger> {
    ledger: &'a L,
    config: &'a NetworkConfig,
}

impl<'a, L: Ledger> ReconciliationProcessor<'a, L> {
    pub fn new(ledger: &'a L, config: &'a NetworkConfig) -> Self {
        Self { ledger, config }
    }

    /// Withdraw every eligible row, then write the contract state.
    ///
    /// No rows means nothing to do; the contract is left untouched.
    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn run(&self, rows: &[ReconciliationRow], manifest: &mut UpgradeManifest) -> MergeResult<()> {
        if rows.is_empty() {
            debug!("No reconciliation rows");
            return Ok(());
        }
        let target = self
            .config
            .reconciliation_info
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("reconciliation rows given without reconciliation_info".into()))?;
        let contract = self
            .config
            .contracts
            .as_ref()
            .and_then(|c| c.reconciliation.as_ref())
            .ok_or_else(|| ConfigError::Invalid("reconciliation rows given without a reconciliation contract".into()))?;

        self.withdraw_balances(&target.target_address, rows, manifest).await?;

        let prefix = &self.config.destination_address_prefix;
        ReconciliationContractWriter::new(self.ledger, &contract.addr, prefix)
            .write(manifest)
            .await
    }

    async fn withdraw_balances(
        &self,
        target: &str,
        rows: &[ReconciliationRow],
        manifest: &mut UpgradeManifest,
    ) -> MergeResult<()> {
        let _timer = StageTimer::new("reconciliation_withdraw");
        let prefix = &self.config.destination_address_prefix;

        let target_raw = codec::decode(target, prefix)?;
        if self.ledger.account(&target_raw).await?.is_none() {
            return Err(LedgerError::AccountNotFound(target.to_string()).into());
        }

        for (index, row) in rows.iter().enumerate() {
            let raw = codec::decode(&row.address, prefix).map_err(|e| MergeError::InvalidReconciliationRow {
                row: index,
                reason: e.to_string(),
            })?;
            let Some(balance) = self.eligible_balance(&raw, row).await? else {
                continue;
            };

            self.ledger.send(&raw, &target_raw, &balance).await?;
            debug!(from = %row.address, eth = %row.eth_address, amount = %balance, "Reconciliation transfer");
            manifest.record_reconciliation_transfer(
                target,
                ReconciliationTransfer {
                    from: row.address.clone(),
                    eth_addr: row.eth_address.clone(),
                    amount: balance,
                },
            )?;
        }

        let transferred = manifest
            .reconciliation
            .as_ref()
            .and_then(|r| r.transfers.as_ref())
            .map(|t| t.number_of_transfers)
            .unwrap_or(0);
        info!(
            transferred,
            skipped = rows.len().saturating_sub(transferred),
            to = %target,
            "🔁 Reconciliation balances withdrawn"
        );
        Ok(())
    }

    /// The balance to withdraw, or `None` if the row is skipped.
    async fn eligible_balance(&self, raw: &RawAddress, row: &ReconciliationRow) -> MergeResult<Option<Coins>> {
        let Some(account) = self.ledger.account(raw).await? else {
            debug!(address = %row.address, "Skipping row: no account");
            record_skipped_row("missing_account");
            return Ok(None);
        };
        if account.sequence != 0 {
            debug!(address = %row.address, sequence = account.sequence, "Skipping row: account used");
            record_skipped_row("sequence");
            return Ok(None);
        }
        let balance = self.ledger.balance(raw).await?;
        if balance.is_empty() {
            debug!(address = %row.address, "Skipping row: empty balance");
            record_skipped_row("empty_balance");
            return Ok(None);
        }
        Ok(Some(balance))
    }
}

// =============================================================================
// Contract writer
// =============================================================================

/// Writes balance records and scalars into the reconciliation contract.
pub struct ReconciliationContractWriter<'a, L: Ledger> {
    ledger: &'a L,
    contract: &'a str,
    prefix: &'a str,
}

struct PendingState {
    records: Vec<(Vec<u8>, Vec<u8>, ReconciliationBalance)>,
    total: Coins,
}

impl<'a, L: Ledger> ReconciliationContractWriter<'a, L> {
    pub fn new(ledger: &'a L, contract: &'a str, prefix: &'a str) -> Self {
        Self {
            ledger,
            contract,
            prefix,
        }
    }

    #[instrument(skip_all, fields(contract = %self.contract))]
    pub async fn write(&self, manifest: &mut UpgradeManifest) -> MergeResult<()> {
        let _timer = StageTimer::new("reconciliation_contract");
        let raw = codec::decode(self.contract, self.prefix)?;
        if self.ledger.contract(&raw).await?.is_none() {
            return Err(LedgerError::ContractNotFound(self.contract.to_string()).into());
        }

        let pending = self.prepare(manifest)?;
        self.check(&pending, manifest)?;

        let count = pending.records.len();
        let total_json = serde_json::to_vec(&pending.total).map_err(|e| MergeError::Serialization(e.to_string()))?;
        for (key, value, record) in pending.records {
            self.ledger.contract_storage_set(&raw, &key, value).await?;
            manifest.record_reconciliation_balance(record)?;
        }
        self.ledger
            .contract_storage_set(&raw, TOTAL_BALANCE_KEY, total_json)
            .await?;
        self.ledger
            .contract_storage_set(&raw, N_OUTSTANDING_ADDRESSES_KEY, count.to_string().into_bytes())
            .await?;
        self.ledger
            .contract_storage_set(&raw, STATE_KEY, PAUSED_STATE.to_vec())
            .await?;

        info!(records = count, total = %pending.total, "📒 Reconciliation contract state written");
        Ok(())
    }

    fn prepare(&self, manifest: &UpgradeManifest) -> MergeResult<PendingState> {
        let transfers = manifest
            .reconciliation
            .as_ref()
            .and_then(|r| r.transfers.as_ref())
            .map(|t| t.transfers.as_slice())
            .unwrap_or_default();

        let mut pending = PendingState {
            records: Vec::with_capacity(transfers.len()),
            total: Coins::new(),
        };
        for (index, transfer) in transfers.iter().enumerate() {
            if transfer.amount.is_empty() {
                warn!(eth = %transfer.eth_addr, "Empty reconciliation transfer not recorded");
                continue;
            }
            let key = balance_record_key(&transfer.eth_addr)
                .map_err(|reason| MergeError::InvalidReconciliationRow { row: index, reason })?;
            let value =
                serde_json::to_vec(&transfer.amount).map_err(|e| MergeError::Serialization(e.to_string()))?;
            pending.total = pending
                .total
                .checked_add(&transfer.amount)
                .ok_or_else(|| MergeError::Overflow("reconciliation total".into()))?;
            pending.records.push((
                key,
                value,
                ReconciliationBalance {
                    eth_addr: transfer.eth_addr.clone(),
                    balances: transfer.amount.clone(),
                },
            ));
        }
        Ok(pending)
    }

    /// Scalars must agree with the records and with the transfers section.
    fn check(&self, pending: &PendingState, manifest: &UpgradeManifest) -> MergeResult<()> {
        let mut keys: Vec<&[u8]> = pending.records.iter().map(|(k, _, _)| k.as_slice()).collect();
        keys.sort_unstable();
        keys.dedup();
        if keys.len() != pending.records.len() {
            return Err(MergeError::ReconciliationMismatch(format!(
                "{} records share {} distinct keys",
                pending.records.len(),
                keys.len()
            )));
        }

        let recomputed = pending
            .records
            .iter()
            .try_fold(Coins::new(), |acc, (_, _, r)| acc.checked_add(&r.balances))
            .ok_or_else(|| MergeError::Overflow("reconciliation records".into()))?;
        if recomputed != pending.total {
            return Err(MergeError::ReconciliationMismatch(format!(
                "total_balance {} but records sum to {recomputed}",
                pending.total
            )));
        }

        if let Some(transfers) = manifest.reconciliation.as_ref().and_then(|r| r.transfers.as_ref())
            && transfers.aggregated_transferred_amount != pending.total
        {
            return Err(MergeError::ReconciliationMismatch(format!(
                "transferred {} but contract total is {}",
                transfers.aggregated_transferred_amount, pending.total
            )));
        }
        Ok(())
    }
}
