//! Conservation ledger - the only place balances change.
//!
//! Owns the account index and the manifest together so that no balance can
//! move without a matching manifest entry. Two primitives:
//!
//! - [`ConservationLedger::move_balance`] shifts coins between indexed
//!   accounts; the source-side total never changes.
//! - [`ConservationLedger::mint`] creates destination supply through the
//!   [`Ledger`] port and records it in the `migration` section.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::codec;
use crate::error::{MergeError, MergeResult};
use crate::manifest::{BalanceRecord, UpgradeManifest};
use crate::metrics::{record_account_created, record_account_migrated, record_balance_movement, record_mint};
use crate::models::{Account, Coins, MigrationStatus, OrderedMap, RawAddress};
use crate::ports::Ledger;

/// A single mint into a destination account.
#[derive(Debug, Clone)]
pub struct MintRequest {
    /// Source account the funds originate from.
    pub from: String,
    /// Destination address (bech32).
    pub to: String,
    /// Destination address bytes.
    pub to_raw: RawAddress,
    /// Source-side balance that was converted.
    pub source_balance: Coins,
    /// Converted amount to create.
    pub amount: Coins,
    pub memo: Option<String>,
}

/// Account index plus manifest, mutated only through checked primitives.
pub struct ConservationLedger {
    accounts: OrderedMap<String, Account>,
    manifest: UpgradeManifest,
    prefix: String,
    initial_total: Coins,
    minted: Coins,
    moved: BTreeSet<String>,
}

impl ConservationLedger {
    pub fn new(
        accounts: OrderedMap<String, Account>,
        manifest: UpgradeManifest,
        prefix: impl Into<String>,
    ) -> MergeResult<Self> {
        let initial_total = sum_balances(&accounts)?;
        Ok(Self {
            accounts,
            manifest,
            prefix: prefix.into(),
            initial_total,
            minted: Coins::new(),
            moved: BTreeSet::new(),
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn account(&self, address: &str) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn accounts(&self) -> &OrderedMap<String, Account> {
        &self.accounts
    }

    pub fn balance_of(&self, address: &str) -> Coins {
        self.accounts
            .get(address)
            .map(|a| a.balance.clone())
            .unwrap_or_default()
    }

    pub fn manifest(&self) -> &UpgradeManifest {
        &self.manifest
    }

    /// Manifest sections that carry no balance (delegation plan, contracts).
    pub fn manifest_mut(&mut self) -> &mut UpgradeManifest {
        &mut self.manifest
    }

    /// Accounts on either side of a non-empty movement.
    pub fn moved_accounts(&self) -> &BTreeSet<String> {
        &self.moved
    }

    /// Everything minted so far.
    pub fn minted(&self) -> &Coins {
        &self.minted
    }

    /// Current sum of all indexed balances.
    pub fn total_balance(&self) -> MergeResult<Coins> {
        sum_balances(&self.accounts)
    }

    pub fn into_parts(self) -> (OrderedMap<String, Account>, UpgradeManifest) {
        (self.accounts, self.manifest)
    }

    // -------------------------------------------------------------------------
    // Primitives
    // -------------------------------------------------------------------------

    /// Move `amount` from one indexed account to another and record it in
    /// `move_genesis_balance`.
    ///
    /// Both accounts must be indexed and not yet migrated, even when the
    /// amount is empty. An empty amount then changes nothing.
    pub fn move_balance(
        &mut self,
        from: &str,
        to: &str,
        amount: &Coins,
        memo: Option<&str>,
    ) -> MergeResult<()> {
        self.usable(from)?;
        self.usable(to)?;
        if amount.is_empty() {
            return Ok(());
        }
        self.apply(from, to, amount)?;
        self.manifest
            .record_movement(from, to, amount.clone(), memo.map(str::to_string))?;
        self.moved.insert(from.to_string());
        self.moved.insert(to.to_string());
        Ok(())
    }

    /// Move the whole balance of an escrow account to `to`.
    ///
    /// Always records an `ibc` entry, even for an empty escrow.
    pub fn withdraw_escrow(&mut self, escrow: &str, to: &str, channel_path: String) -> MergeResult<Coins> {
        let balance = self
            .accounts
            .get(escrow)
            .ok_or_else(|| MergeError::UnknownAccount(escrow.to_string()))?
            .balance
            .clone();
        if !balance.is_empty() {
            self.apply(escrow, to, &balance)?;
            self.moved.insert(escrow.to_string());
            self.moved.insert(to.to_string());
        }
        self.manifest.record_ibc_transfer(escrow, channel_path, balance.clone())?;
        Ok(balance)
    }

    /// Credit `to` with supply that no source account holds.
    ///
    /// Recorded as a movement with an empty sender. The source-side total
    /// grows by `amount`, so conservation checks against the raised total.
    pub fn create_balance(&mut self, to: &str, amount: &Coins, memo: &str) -> MergeResult<()> {
        let balance = self.usable(to)?.balance.clone();
        if amount.is_empty() {
            return Ok(());
        }
        let credited = balance
            .checked_add(amount)
            .ok_or_else(|| MergeError::Overflow(format!("balance of {to}")))?;
        let initial_total = self
            .initial_total
            .checked_add(amount)
            .ok_or_else(|| MergeError::Overflow("total balance".into()))?;
        self.manifest
            .record_movement("", to, amount.clone(), Some(memo.to_string()))?;
        if let Some(account) = self.accounts.get_mut(to) {
            account.balance = credited;
        }
        self.initial_total = initial_total;
        self.moved.insert(to.to_string());
        debug!(to = %to, amount = %amount, "Balance created");
        Ok(())
    }

    /// Record a movement that was skipped, with an empty amount.
    pub fn record_skipped_movement(&mut self, from: &str, to: &str, memo: &str) -> MergeResult<()> {
        self.manifest
            .record_movement(from, to, Coins::new(), Some(memo.to_string()))
    }

    /// Add `address` to the index as an empty base account if it is absent.
    ///
    /// Returns `true` if the account was created.
    pub fn ensure_account(&mut self, address: &str, reason: &str) -> MergeResult<bool> {
        if self.accounts.contains_key(address) {
            return Ok(false);
        }
        let raw = codec::decode(address, &self.prefix)?;
        self.accounts
            .insert(address.to_string(), Account::new_base(address, raw));
        self.manifest.record_created_account(address, reason);
        record_account_created(reason);
        debug!(address = %address, reason = %reason, "Account created");
        Ok(true)
    }

    /// Finalize an account. Fails if it was already finalized.
    pub fn mark_migrated(&mut self, address: &str) -> MergeResult<()> {
        let account = self
            .accounts
            .get_mut(address)
            .ok_or_else(|| MergeError::UnknownAccount(address.to_string()))?;
        if account.is_migrated() {
            return Err(MergeError::AlreadyMigrated(address.to_string()));
        }
        account.status = MigrationStatus::Migrated;
        record_account_migrated();
        Ok(())
    }

    /// Create new destination supply. An empty amount is a no-op.
    ///
    /// Returns `true` if anything was minted.
    pub async fn mint(&mut self, ledger: &dyn Ledger, request: MintRequest) -> MergeResult<bool> {
        if request.amount.is_empty() {
            trace!(from = %request.from, "Nothing to mint");
            return Ok(false);
        }
        ledger.mint(&request.to_raw, &request.amount).await?;
        self.minted = self
            .minted
            .checked_add(&request.amount)
            .ok_or_else(|| MergeError::Overflow("minted total".into()))?;
        self.manifest.record_migration(BalanceRecord {
            from: request.from,
            to: request.to,
            source_balance: request.source_balance,
            dest_balance: request.amount,
            memo: request.memo,
        })?;
        record_mint();
        Ok(true)
    }

    /// Check that movements preserved the source total and that mints match
    /// the manifest.
    pub fn check_conservation(&self) -> MergeResult<()> {
        let total = self.total_balance()?;
        if total != self.initial_total {
            return Err(MergeError::ConservationViolated(format!(
                "source balances sum to {total}, started at {}",
                self.initial_total
            )));
        }
        let recorded = self.manifest.aggregated_migrated_amount();
        if recorded != self.minted {
            return Err(MergeError::ConservationViolated(format!(
                "minted {} but manifest records {recorded}",
                self.minted
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Validate then apply a movement. Nothing changes on error.
    fn apply(&mut self, from: &str, to: &str, amount: &Coins) -> MergeResult<()> {
        let source = self.usable(from)?;
        let from_balance = source.balance.clone();
        let to_balance = self.usable(to)?.balance.clone();

        let remaining = from_balance
            .checked_sub(amount)
            .ok_or_else(|| MergeError::NegativeBalance {
                address: from.to_string(),
                amount: amount.to_string(),
                balance: from_balance.to_string(),
            })?;
        let credited = if from == to {
            from_balance
        } else {
            to_balance
                .checked_add(amount)
                .ok_or_else(|| MergeError::Overflow(format!("balance of {to}")))?
        };

        if let Some(account) = self.accounts.get_mut(from) {
            account.balance = remaining;
        }
        if let Some(account) = self.accounts.get_mut(to) {
            account.balance = credited;
        }
        record_balance_movement();
        trace!(from = %from, to = %to, amount = %amount, "Balance moved");
        Ok(())
    }

    fn usable(&self, address: &str) -> MergeResult<&Account> {
        let account = self
            .accounts
            .get(address)
            .ok_or_else(|| MergeError::UnknownAccount(address.to_string()))?;
        if account.is_migrated() {
            return Err(MergeError::AlreadyMigrated(address.to_string()));
        }
        Ok(account)
    }
}

fn sum_balances(accounts: &OrderedMap<String, Account>) -> MergeResult<Coins> {
    accounts
        .values()
        .try_fold(Coins::new(), |acc, a| acc.checked_add(&a.balance))
        .ok_or_else(|| MergeError::Overflow("total balance".into()))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{MockLedger, SRC, raw, src_addr};
    use proptest::prelude::*;

    fn ledger_with(balances: &[(u8, u128)]) -> ConservationLedger {
        let accounts = balances
            .iter()
            .map(|(n, amount)| {
                let mut account = Account::new_base(src_addr(*n), raw(*n));
                account.balance = Coins::single("acudos", *amount);
                (src_addr(*n), account)
            })
            .collect();
        ConservationLedger::new(accounts, UpgradeManifest::new(), SRC).unwrap()
    }

    fn acudos(amount: u128) -> Coins {
        Coins::single("acudos", amount)
    }

    #[test]
    fn test_move_balance_updates_both_sides() {
        let mut ledger = ledger_with(&[(1, 100), (2, 0)]);
        ledger
            .move_balance(&src_addr(1), &src_addr(2), &acudos(40), Some("test"))
            .unwrap();

        assert_eq!(ledger.balance_of(&src_addr(1)), acudos(60));
        assert_eq!(ledger.balance_of(&src_addr(2)), acudos(40));
        let moves = ledger.manifest().move_genesis_balance.as_ref().unwrap();
        assert_eq!(moves.number_of_movements, 1);
        assert_eq!(moves.aggregated_moved_amount, acudos(40));
        assert_eq!(moves.movements[0].memo.as_deref(), Some("test"));
    }

    #[test]
    fn test_empty_movement_is_noop() {
        let mut ledger = ledger_with(&[(1, 100), (2, 0)]);
        ledger
            .move_balance(&src_addr(1), &src_addr(2), &Coins::new(), None)
            .unwrap();
        assert!(ledger.manifest().move_genesis_balance.is_none());
        assert_eq!(ledger.balance_of(&src_addr(1)), acudos(100));
        assert!(ledger.moved_accounts().is_empty());
    }

    // Critical: an empty amount must not hide a bad endpoint
    #[test]
    fn test_empty_movement_still_validates_accounts() {
        let mut ledger = ledger_with(&[(1, 100), (2, 0)]);
        let err = ledger
            .move_balance(&src_addr(1), &src_addr(9), &Coins::new(), None)
            .unwrap_err();
        assert!(matches!(err, MergeError::UnknownAccount(a) if a == src_addr(9)));

        ledger.mark_migrated(&src_addr(2)).unwrap();
        let err = ledger
            .move_balance(&src_addr(2), &src_addr(1), &Coins::new(), None)
            .unwrap_err();
        assert!(matches!(err, MergeError::AlreadyMigrated(a) if a == src_addr(2)));
    }

    #[test]
    fn test_moved_accounts_tracked() {
        let mut ledger = ledger_with(&[(1, 100), (2, 0), (3, 5)]);
        ledger
            .move_balance(&src_addr(1), &src_addr(2), &acudos(40), None)
            .unwrap();
        let moved: Vec<_> = ledger.moved_accounts().iter().cloned().collect();
        assert_eq!(moved.len(), 2);
        assert!(moved.contains(&src_addr(1)));
        assert!(moved.contains(&src_addr(2)));
        assert!(!moved.contains(&src_addr(3)));
    }

    // Critical: created supply must not break conservation
    #[test]
    fn test_create_balance_raises_initial_total() {
        let mut ledger = ledger_with(&[(1, 100), (2, 0)]);
        ledger.create_balance(&src_addr(2), &acudos(25), "extra_supply").unwrap();

        assert_eq!(ledger.balance_of(&src_addr(2)), acudos(25));
        ledger.check_conservation().unwrap();
        let moves = ledger.manifest().move_genesis_balance.as_ref().unwrap();
        assert_eq!(moves.movements[0].from, "");
        assert_eq!(moves.movements[0].memo.as_deref(), Some("extra_supply"));
        assert!(ledger.moved_accounts().contains(&src_addr(2)));

        assert!(matches!(
            ledger.create_balance(&src_addr(9), &acudos(1), "extra_supply"),
            Err(MergeError::UnknownAccount(_))
        ));
    }

    #[test]
    fn test_unknown_account() {
        let mut ledger = ledger_with(&[(1, 100)]);
        let err = ledger
            .move_balance(&src_addr(1), &src_addr(9), &acudos(1), None)
            .unwrap_err();
        assert!(matches!(err, MergeError::UnknownAccount(a) if a == src_addr(9)));
    }

    // Critical: a failed movement must leave balances and manifest untouched
    #[test]
    fn test_negative_balance_rejected_atomically() {
        let mut ledger = ledger_with(&[(1, 10), (2, 0)]);
        let err = ledger
            .move_balance(&src_addr(1), &src_addr(2), &acudos(11), None)
            .unwrap_err();

        assert!(matches!(err, MergeError::NegativeBalance { .. }));
        assert_eq!(ledger.balance_of(&src_addr(1)), acudos(10));
        assert_eq!(ledger.balance_of(&src_addr(2)), Coins::new());
        assert!(ledger.manifest().move_genesis_balance.is_none());
    }

    #[test]
    fn test_migrated_account_cannot_move() {
        let mut ledger = ledger_with(&[(1, 10), (2, 0)]);
        ledger.mark_migrated(&src_addr(2)).unwrap();
        let err = ledger
            .move_balance(&src_addr(1), &src_addr(2), &acudos(1), None)
            .unwrap_err();
        assert!(matches!(err, MergeError::AlreadyMigrated(_)));
    }

    // Critical: finalization happens exactly once
    #[test]
    fn test_double_migration_fails() {
        let mut ledger = ledger_with(&[(1, 10)]);
        ledger.mark_migrated(&src_addr(1)).unwrap();
        assert!(matches!(
            ledger.mark_migrated(&src_addr(1)),
            Err(MergeError::AlreadyMigrated(_))
        ));
    }

    #[test]
    fn test_escrow_withdrawal_recorded_when_empty() {
        let mut ledger = ledger_with(&[(1, 0), (2, 0)]);
        let moved = ledger
            .withdraw_escrow(&src_addr(1), &src_addr(2), "transfer/channel-0".into())
            .unwrap();

        assert!(moved.is_empty());
        let ibc = ledger.manifest().ibc.as_ref().unwrap();
        assert_eq!(ibc.number_of_transfers, 1);
        assert_eq!(ibc.transfers[0].channel_id, "transfer/channel-0");
    }

    #[test]
    fn test_ensure_account() {
        let mut ledger = ledger_with(&[(1, 0)]);
        assert!(!ledger.ensure_account(&src_addr(1), "x").unwrap());
        assert!(ledger.ensure_account(&src_addr(3), "ibc_target").unwrap());
        assert!(ledger.account(&src_addr(3)).is_some());

        let created = ledger.manifest().created_accounts.as_ref().unwrap();
        assert_eq!(created.number_of_creations, 1);
        assert_eq!(created.accounts[0].reason, "ibc_target");
    }

    #[tokio::test]
    async fn test_mint_records_migration() {
        let mut ledger = ledger_with(&[(1, 100)]);
        let dest = MockLedger::new();
        let minted = ledger
            .mint(
                &dest,
                MintRequest {
                    from: src_addr(1),
                    to: "fetch1dest".into(),
                    to_raw: raw(1),
                    source_balance: acudos(100),
                    amount: Coins::single("afet", 10),
                    memo: None,
                },
            )
            .await
            .unwrap();

        assert!(minted);
        assert_eq!(dest.balance_of(&raw(1)), Coins::single("afet", 10));
        assert_eq!(ledger.minted(), &Coins::single("afet", 10));
        assert_eq!(ledger.manifest().aggregated_migrated_amount(), Coins::single("afet", 10));
        ledger.check_conservation().unwrap();
    }

    #[tokio::test]
    async fn test_empty_mint_is_noop() {
        let mut ledger = ledger_with(&[(1, 5)]);
        let dest = MockLedger::new();
        let minted = ledger
            .mint(
                &dest,
                MintRequest {
                    from: src_addr(1),
                    to: "fetch1dest".into(),
                    to_raw: raw(1),
                    source_balance: acudos(5),
                    amount: Coins::new(),
                    memo: None,
                },
            )
            .await
            .unwrap();

        assert!(!minted);
        assert!(ledger.manifest().migration.is_none());
    }

    proptest! {
        // Any sequence of movements, successful or not, preserves the total
        #[test]
        fn prop_movements_conserve_total(
            moves in proptest::collection::vec((0u8..4, 0u8..4, 0u128..200), 0..40)
        ) {
            let mut ledger = ledger_with(&[(0, 100), (1, 50), (2, 0), (3, 25)]);
            for (from, to, amount) in moves {
                let _ = ledger.move_balance(&src_addr(from), &src_addr(to), &acudos(amount), None);
            }
            prop_assert_eq!(ledger.total_balance().unwrap(), acudos(175));
            prop_assert!(ledger.check_conservation().is_ok());
            prop_assert!(ledger.manifest().verify().is_ok());
        }
    }
}
