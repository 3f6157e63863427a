//! Migration pipeline - drives a snapshot through the fixed merge stages.
//!
//! # Stages
//!
//! ```text
//!  1. ibc            escrow balances    -> ibc target
//!  2. contracts      contract balances  -> resolved owner
//!  3. delegations    pool balances      -> delegators (+ re-delegation plan)
//!  4. unbonding      not-bonded pool    -> delegators
//!  5. rewards        distribution       -> withdraw addresses, validators
//!  5a. residuals     module leftovers   -> remainder addresses
//!  5b. movements     configured explicit movements
//!  6. mint           base balances      -> converted destination mints
//!                    (+ commission when the supply is authorized)
//!  7. finalize       mark the rest migrated, nothing may hold a balance
//!  8. supply         minted vs expected supply
//! ```
//!
//! Holdings are captured into the manifest twice: `initial_balances` before
//! stage 1 and `moved_balances` after stage 5b.
//!
//! Later stages assume the earlier ones completed; the order is not
//! configurable. Every balance change goes through [`ConservationLedger`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::codec;
use crate::config::{ConversionTable, NetworkConfig, SupplyAuthorization};
use crate::error::{ConfigError, MergeError, MergeResult, SnapshotError};
use crate::manifest::{PlannedDelegation, SupplyCheck, UpgradeManifest, VestingCollision};
use crate::metrics::{StageTimer, record_dropped_denom};
use crate::models::{Account, AccountClassification, Coins, DistributionState, OrderedMap};
use crate::ports::{Ledger, LedgerAccount, LedgerAccountKind};
use crate::services::balances::{Redelegations, initial_balances, moved_balances};
use crate::services::conservation::{ConservationLedger, MintRequest};
use crate::services::indexer::{DISTRIBUTION_MODULE, Snapshot};
use crate::services::resolver::ContractOwnershipResolver;

const NON_EXISTING_FROM_MEMO: &str = "non_existing_from_account_skipping";
const NO_SOURCE_BALANCE_MEMO: &str = "no_source_balance_to_move_skipping";
const VESTING_COLLISION_MEMO: &str = "vesting_collision";
const DELEGATION_REWARD_MEMO: &str = "delegation_reward";
const OUTSTANDING_REWARDS_MEMO: &str = "outstanding_rewards";
const COMMISSION_MEMO: &str = "total_commission";
const EXTRA_SUPPLY_MEMO: &str = "extra_supply";
const REMAINING_MINT_MEMO: &str = "remaining_mint_module_balance";
/// Sender recorded for supply minted without a source account.
const MINT_MODULE: &str = "mint_module";

// =============================================================================
// Options & Outcome
// =============================================================================

/// Run inputs that the network config does not carry.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Start of every vesting schedule created by the run (unix seconds).
    pub vesting_start: i64,
    pub genesis_sha256: Option<String>,
    pub config_sha256: Option<String>,
}

/// Result of a successful run.
#[derive(Debug)]
pub struct MergeOutcome {
    pub manifest: UpgradeManifest,
    /// Final account index; every entry is migrated.
    pub accounts: OrderedMap<String, Account>,
}

// =============================================================================
// MigrationPipeline
// =============================================================================

/// Runs the merge against a destination [`Ledger`].
///
/// # Flow
///
/// 1. Check the snapshot belongs to the configured source chain
/// 2. Hand the account index to a [`ConservationLedger`]
/// 3. Run stages 1-8 in order, capturing holdings before and after the
///    movement stages
/// 4. Check conservation and verify the manifest
pub struct MigrationPipeline<L: Ledger> {
    config: NetworkConfig,
    ledger: Arc<L>,
    options: MergeOptions,
    conversion: ConversionTable,
}

impl<L: Ledger> MigrationPipeline<L> {
    pub fn new(config: NetworkConfig, ledger: Arc<L>, options: MergeOptions) -> Self {
        let conversion = config.conversion_table();
        Self {
            config,
            ledger,
            options,
            conversion,
        }
    }

    /// Run every stage. Any error aborts the whole merge.
    #[instrument(skip_all, fields(source = %self.config.merge_source_chain_id, destination = %self.config.destination_chain_id))]
    pub async fn run(&self, mut snapshot: Snapshot) -> MergeResult<MergeOutcome> {
        info!("🔀 Starting merge");

        if snapshot.chain_id != self.config.merge_source_chain_id {
            error!(snapshot = %snapshot.chain_id, "❌ Snapshot chain id does not match config");
            return Err(ConfigError::Invalid(format!(
                "snapshot chain id {} does not match merge_source_chain_id {}",
                snapshot.chain_id, self.config.merge_source_chain_id
            ))
            .into());
        }

        let mut manifest = UpgradeManifest::new();
        manifest.genesis_file_sha256 = self.options.genesis_sha256.clone().unwrap_or_default();
        manifest.network_config_file_sha256 = self.options.config_sha256.clone().unwrap_or_default();
        manifest.merge_source_chain_id = self.config.merge_source_chain_id.clone();
        manifest.destination_chain_id = self.config.destination_chain_id.clone();
        manifest.source_chain_block_height = snapshot.initial_height;
        for (address, reason) in &snapshot.created_accounts {
            manifest.record_created_account(address, reason);
        }
        manifest.initial_balances = Some(initial_balances(&snapshot, &self.config.source_valoper_prefix())?);

        let mut distribution = std::mem::take(&mut snapshot.distribution);
        let accounts = std::mem::take(&mut snapshot.accounts);
        let mut state = ConservationLedger::new(accounts, manifest, snapshot.prefix.clone())?;
        let resolver = ContractOwnershipResolver::new(&snapshot.contracts)
            .with_fallback(self.config.merge.contract_destination_fallback_addr.clone());

        self.withdraw_ibc(&mut state, &snapshot)?;
        self.withdraw_contracts(&mut state, &snapshot, &resolver)?;
        let redelegations = self.return_delegations(&mut state, &snapshot, &resolver).await?;
        self.return_unbonding(&mut state, &snapshot, &resolver)?;
        let community_pool = self.withdraw_rewards(&mut state, &mut distribution, &snapshot, &resolver)?;
        self.sweep_residuals(&mut state, &snapshot, &community_pool)?;
        self.apply_movements(&mut state, &snapshot)?;
        let moved = moved_balances(&state, &redelegations, &snapshot.bond_denom)?;
        state.manifest_mut().moved_balances = Some(moved);
        self.mint_balances(&mut state, &snapshot).await?;
        self.finalize(&mut state)?;
        self.check_supply(&mut state, &snapshot)?;

        state.check_conservation()?;
        state.manifest().verify()?;

        let (accounts, manifest) = state.into_parts();
        info!(
            migrated = accounts.len(),
            minted = %manifest.aggregated_migrated_amount(),
            "✅ Merge complete"
        );
        Ok(MergeOutcome { manifest, accounts })
    }

    // -------------------------------------------------------------------------
    // Stage 1: IBC escrows
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn withdraw_ibc(&self, state: &mut ConservationLedger, snapshot: &Snapshot) -> MergeResult<()> {
        let _timer = StageTimer::new("ibc");
        let target = &self.config.merge.ibc_target_addr;
        state.ensure_account(target, "ibc_target")?;
        state.manifest_mut().begin_ibc(target);

        let mut total = Coins::new();
        for (address, escrow) in snapshot.ibc_escrows.iter() {
            let moved = state.withdraw_escrow(address, target, escrow.path())?;
            total = total
                .checked_add(&moved)
                .ok_or_else(|| MergeError::Overflow("ibc total".into()))?;
        }
        info!(stage = "ibc", channels = snapshot.ibc_escrows.len(), total = %total, "🌉 Escrows withdrawn");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 2: contract balances
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn withdraw_contracts(
        &self,
        state: &mut ConservationLedger,
        snapshot: &Snapshot,
        resolver: &ContractOwnershipResolver<'_>,
    ) -> MergeResult<()> {
        let _timer = StageTimer::new("contracts");
        let mut withdrawn = 0usize;

        for address in snapshot.contracts.keys() {
            let balance = state.balance_of(address);
            if balance.is_empty() {
                continue;
            }
            let owner = resolver.resolve(address)?;
            state.ensure_account(&owner, "contract_owner")?;
            state.move_balance(address, &owner, &balance, Some("contract_balance"))?;

            let left = state.balance_of(address);
            if !left.is_empty() {
                return Err(MergeError::UnresolvedBalance {
                    address: address.clone(),
                    kind: AccountClassification::Contract.name().into(),
                    balance: left.to_string(),
                });
            }
            debug!(contract = %address, owner = %owner, amount = %balance, "Contract balance withdrawn");
            withdrawn += 1;
        }
        info!(stage = "contracts", withdrawn, "📜 Contract balances withdrawn");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 3: delegations
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    async fn return_delegations(
        &self,
        state: &mut ConservationLedger,
        snapshot: &Snapshot,
        resolver: &ContractOwnershipResolver<'_>,
    ) -> MergeResult<Redelegations> {
        let _timer = StageTimer::new("delegations");
        let mut validator_cache: HashMap<String, String> = HashMap::new();
        let mut redelegations = Redelegations::new();

        for delegation in &snapshot.delegations {
            let validator = snapshot.validators.get(&delegation.validator_id).ok_or_else(|| {
                MergeError::UnknownAccount(format!("validator {}", delegation.validator_operator))
            })?;
            let bonded = validator.status.is_bonded();
            let pool = if bonded {
                &snapshot.bonded_pool
            } else {
                &snapshot.not_bonded_pool
            };

            let delegator = resolver.resolve(&delegation.delegator)?;
            state.ensure_account(&delegator, "delegator")?;
            let amount = Coins::single(snapshot.bond_denom.clone(), delegation.tokens);
            state.move_balance(pool, &delegator, &amount, Some("delegation"))?;

            if bonded && !self.config.merge.is_delegation_exempt(&delegation.delegator) {
                let staked = redelegations
                    .get_or_insert_with(delegator.clone(), OrderedMap::new)
                    .get_or_insert_with(delegation.validator_operator.clone(), || 0);
                *staked = staked
                    .checked_add(delegation.tokens)
                    .ok_or_else(|| MergeError::Overflow(format!("stake of {delegator}")))?;
                self.plan_delegation(
                    state,
                    snapshot,
                    &delegator,
                    delegation.tokens,
                    &delegation.validator_operator,
                    &mut validator_cache,
                )
                .await?;
            }
        }

        info!(stage = "delegations", count = snapshot.delegations.len(), "🥩 Delegations returned");
        Ok(redelegations)
    }

    async fn plan_delegation(
        &self,
        state: &mut ConservationLedger,
        snapshot: &Snapshot,
        delegator: &str,
        tokens: u128,
        source_operator: &str,
        cache: &mut HashMap<String, String>,
    ) -> MergeResult<()> {
        if !self.conversion.is_convertible(&snapshot.bond_denom) {
            return Ok(());
        }
        let new_tokens = self
            .conversion
            .convert_amount(&snapshot.bond_denom, tokens)
            .ok_or_else(|| MergeError::Overflow(format!("delegation of {delegator}")))?;
        if new_tokens == 0 {
            return Ok(());
        }

        let new_validator = match cache.get(source_operator) {
            Some(v) => v.clone(),
            None => {
                let v = self.destination_validator(source_operator).await?;
                cache.insert(source_operator.to_string(), v.clone());
                v
            }
        };
        let new_delegator = codec::convert(
            delegator,
            &self.config.source_address_prefix,
            &self.config.destination_address_prefix,
        )?;

        state.manifest_mut().record_delegation(PlannedDelegation {
            original_validator: source_operator.to_string(),
            new_validator,
            new_delegator,
            original_tokens: tokens,
            new_tokens,
        })
    }

    /// First usable destination validator: the mapped one, then the backups.
    async fn destination_validator(&self, source_operator: &str) -> MergeResult<String> {
        let merge = &self.config.merge;
        let candidates = merge
            .mapped_validator(source_operator)
            .into_iter()
            .chain(merge.backup_validators.iter().map(String::as_str));

        for candidate in candidates {
            match self.ledger.validator(candidate).await? {
                Some(v) if !v.jailed => return Ok(candidate.to_string()),
                Some(_) => warn!(validator = %candidate, "⚠️  Destination validator jailed, trying next"),
                None => warn!(validator = %candidate, "⚠️  Destination validator missing, trying next"),
            }
        }
        Err(MergeError::ValidatorUnavailable(source_operator.to_string()))
    }

    // -------------------------------------------------------------------------
    // Stage 4: unbonding delegations
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn return_unbonding(
        &self,
        state: &mut ConservationLedger,
        snapshot: &Snapshot,
        resolver: &ContractOwnershipResolver<'_>,
    ) -> MergeResult<()> {
        let _timer = StageTimer::new("unbonding");
        for entry in &snapshot.unbonding {
            let delegator = resolver.resolve(&entry.delegator)?;
            state.ensure_account(&delegator, "delegator")?;
            let amount = Coins::single(snapshot.bond_denom.clone(), entry.balance);
            state.move_balance(&snapshot.not_bonded_pool, &delegator, &amount, Some("unbonding_delegation"))?;
        }
        info!(stage = "unbonding", count = snapshot.unbonding.len(), "⏳ Unbonding entries returned");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 5: distribution rewards
    // -------------------------------------------------------------------------

    /// Pay unpaid delegation rewards to withdraw addresses, then hand each
    /// validator its outstanding rewards.
    ///
    /// Fractional change from every delegator payout joins the community
    /// pool. Returns the community pool in whole tokens.
    #[instrument(skip_all)]
    fn withdraw_rewards(
        &self,
        state: &mut ConservationLedger,
        distribution: &mut DistributionState,
        snapshot: &Snapshot,
        resolver: &ContractOwnershipResolver<'_>,
    ) -> MergeResult<Coins> {
        let _timer = StageTimer::new("rewards");
        let tolerance = self.config.merge.max_remaining_distribution_balance;
        let mut community_pool = distribution.community_pool.clone();
        let mut paid = 0usize;

        if distribution.has_rewards() {
            let module = snapshot
                .distribution_module
                .as_deref()
                .ok_or_else(|| SnapshotError::MissingModuleAccount(DISTRIBUTION_MODULE.into()))?;

            for (operator, delegators) in distribution.starting_infos.iter() {
                for delegator in delegators.keys() {
                    let owed = distribution.delegator_reward(delegator, operator);
                    let outstanding = distribution
                        .outstanding_rewards
                        .get(operator)
                        .cloned()
                        .unwrap_or_default();
                    let rewards = owed.intersect(&outstanding);
                    if rewards != owed {
                        warn!(
                            delegator = %delegator,
                            validator = %operator,
                            owed = %owed,
                            outstanding = %outstanding,
                            "⚠️  Reward above outstanding, capping"
                        );
                    }
                    let (whole, change) = rewards
                        .truncate()
                        .ok_or_else(|| MergeError::Overflow(format!("reward of {delegator}")))?;
                    if !whole.is_empty() {
                        let withdraw = resolver.resolve(distribution.withdraw_address(delegator))?;
                        state.ensure_account(&withdraw, "reward_withdraw_address")?;
                        state.move_balance(module, &withdraw, &whole, Some(DELEGATION_REWARD_MEMO))?;
                        paid += 1;
                    }
                    let left = outstanding.checked_sub(&rewards).ok_or_else(|| {
                        SnapshotError::InvalidDistribution(format!("rewards of {operator} exceed outstanding"))
                    })?;
                    distribution.outstanding_rewards.insert(operator.clone(), left);
                    community_pool = community_pool.add(&change);
                }
            }

            let valoper_prefix = self.config.source_valoper_prefix();
            for (operator, outstanding) in distribution.outstanding_rewards.iter() {
                let commission = distribution
                    .accumulated_commissions
                    .get(operator)
                    .cloned()
                    .unwrap_or_default();
                let remaining = outstanding.checked_sub(&commission).ok_or_else(|| {
                    SnapshotError::InvalidDistribution(format!("commission of {operator} exceeds outstanding"))
                })?;
                if !remaining.all_within(tolerance) {
                    error!(validator = %operator, remaining = %remaining, "❌ Outstanding rewards above tolerance");
                    return Err(MergeError::ToleranceExceeded {
                        account: operator.clone(),
                        balance: remaining.to_string(),
                        tolerance,
                    });
                }

                let (whole, _) = outstanding
                    .truncate()
                    .ok_or_else(|| MergeError::Overflow(format!("outstanding rewards of {operator}")))?;
                if whole.is_empty() {
                    continue;
                }
                let account = codec::convert(operator, &valoper_prefix, &snapshot.prefix)?;
                state.ensure_account(&account, "validator_operator")?;
                state.move_balance(module, &account, &whole, Some(OUTSTANDING_REWARDS_MEMO))?;
            }
        }

        let (pool, _) = community_pool
            .truncate()
            .ok_or_else(|| MergeError::Overflow("community pool".into()))?;
        info!(stage = "rewards", paid, community_pool = %pool, "🎁 Rewards withdrawn");
        Ok(pool)
    }

    // -------------------------------------------------------------------------
    // Stage 5a: residual module balances
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn sweep_residuals(
        &self,
        state: &mut ConservationLedger,
        snapshot: &Snapshot,
        community_pool: &Coins,
    ) -> MergeResult<()> {
        let _timer = StageTimer::new("residuals");
        let merge = &self.config.merge;

        // Community pool
        if let (Some(dest), Some(distribution)) =
            (&merge.community_pool_balance_dest_addr, &snapshot.distribution_module)
            && !community_pool.is_empty()
        {
            state.ensure_account(dest, "community_pool_destination")?;
            state.move_balance(distribution, dest, community_pool, Some("community_pool"))?;
        }

        // Gravity
        if let Some(gravity) = &snapshot.gravity_module {
            let balance = state.balance_of(gravity);
            if !balance.is_empty() {
                state.ensure_account(&merge.remaining_gravity_balance_addr, "remainder")?;
                state.move_balance(gravity, &merge.remaining_gravity_balance_addr, &balance, Some("gravity_leftover"))?;
            }
        }

        // Staking pools
        for pool in [&snapshot.bonded_pool, &snapshot.not_bonded_pool] {
            let balance = state.balance_of(pool);
            if balance.is_empty() {
                continue;
            }
            if !balance.all_within(merge.max_remaining_staking_balance) {
                error!(pool = %pool, balance = %balance, "❌ Staking pool residual above tolerance");
                return Err(MergeError::ToleranceExceeded {
                    account: pool.clone(),
                    balance: balance.to_string(),
                    tolerance: merge.max_remaining_staking_balance,
                });
            }
            state.ensure_account(&merge.remaining_staking_balance_addr, "remainder")?;
            state.move_balance(pool, &merge.remaining_staking_balance_addr, &balance, Some("staking_leftover"))?;
        }

        // Distribution
        if let Some(distribution) = &snapshot.distribution_module {
            let balance = state.balance_of(distribution);
            if !balance.is_empty() {
                let excess = balance.saturating_sub(community_pool);
                if !excess.all_within(merge.max_remaining_distribution_balance) {
                    error!(balance = %balance, "❌ Distribution residual above tolerance");
                    return Err(MergeError::ToleranceExceeded {
                        account: distribution.clone(),
                        balance: excess.to_string(),
                        tolerance: merge.max_remaining_distribution_balance,
                    });
                }
                state.ensure_account(&merge.remaining_distribution_balance_addr, "remainder")?;
                state.move_balance(
                    distribution,
                    &merge.remaining_distribution_balance_addr,
                    &balance,
                    Some("distribution_leftover"),
                )?;
            }
        }

        // Any other module
        let leftovers: Vec<(String, String, Coins)> = state
            .accounts()
            .values()
            .filter_map(|a| a.module_name().map(|n| (a.address.clone(), n.to_string(), a.balance.clone())))
            .filter(|(_, _, balance)| !balance.is_empty())
            .collect();
        for (address, name, balance) in leftovers {
            state.ensure_account(&merge.generic_module_remaining_balance, "remainder")?;
            let memo = format!("leftover_module_balance_{name}");
            state.move_balance(&address, &merge.generic_module_remaining_balance, &balance, Some(&memo))?;
        }

        if let Some(account) = state
            .accounts()
            .values()
            .find(|a| a.module_name().is_some() && !a.balance.is_empty())
        {
            return Err(MergeError::UnresolvedBalance {
                address: account.address.clone(),
                kind: account.classification.name().into(),
                balance: account.balance.to_string(),
            });
        }

        info!(stage = "residuals", "🧹 Module accounts swept");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 5b: explicit movements
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn apply_movements(&self, state: &mut ConservationLedger, snapshot: &Snapshot) -> MergeResult<()> {
        let _timer = StageTimer::new("movements");
        for movement in &self.config.merge.moved_accounts {
            if state.account(&movement.from).is_none() {
                warn!(from = %movement.from, "⚠️  Movement source does not exist, skipping");
                state.record_skipped_movement(&movement.from, &movement.to, NON_EXISTING_FROM_MEMO)?;
                continue;
            }
            let available = state.balance_of(&movement.from).amount_of(&snapshot.bond_denom);
            if available == 0 {
                warn!(from = %movement.from, "⚠️  Movement source has no balance, skipping");
                state.record_skipped_movement(&movement.from, &movement.to, NO_SOURCE_BALANCE_MEMO)?;
                continue;
            }

            let amount = movement.amount.map_or(available, |a| a.min(available));
            state.ensure_account(&movement.to, "moved_account_destination")?;
            state.move_balance(
                &movement.from,
                &movement.to,
                &Coins::single(snapshot.bond_denom.clone(), amount),
                movement.memo.as_deref(),
            )?;
        }
        info!(stage = "movements", count = self.config.merge.moved_accounts.len(), "↔️  Explicit movements applied");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 6: conversion & minting
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    async fn mint_balances(&self, state: &mut ConservationLedger, snapshot: &Snapshot) -> MergeResult<()> {
        let _timer = StageTimer::new("mint");
        let authorized = self.config.merge.authorized_supply.as_ref();
        if let Some(supply) = authorized {
            self.authorize_supply(state, snapshot, supply).await?;
        }

        let candidates: Vec<String> = state
            .accounts()
            .values()
            .filter(|a| a.classification == AccountClassification::Base && !a.is_migrated())
            .map(|a| a.address.clone())
            .collect();

        let mut minted = 0usize;
        for address in candidates {
            if self.migrate_account(state, &address).await? {
                minted += 1;
            }
            state.mark_migrated(&address)?;
        }

        if let Some(supply) = authorized {
            self.mint_remaining(state, supply).await?;
        }
        info!(stage = "mint", minted, total = %state.minted(), "🪙 Balances converted and minted");
        Ok(())
    }

    /// Mint the commission and create the source supply no account holds.
    ///
    /// The commission is what `total_supply_to_mint` exceeds the converted
    /// `total_source_supply` by. The extra supply is credited to
    /// `extra_supply_addr` so it is converted like any other balance.
    async fn authorize_supply(
        &self,
        state: &mut ConservationLedger,
        snapshot: &Snapshot,
        supply: &SupplyAuthorization,
    ) -> MergeResult<()> {
        let bond_denom = &snapshot.bond_denom;
        let priced = self
            .conversion
            .convert_amount(bond_denom, supply.total_source_supply)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("authorized source supply of {bond_denom} cannot be converted"))
            })?;
        let commission = supply.total_supply_to_mint.checked_sub(priced).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "total_supply_to_mint {} is below the converted source supply {priced}",
                supply.total_supply_to_mint
            ))
        })?;
        self.mint_to_commission(state, supply, commission, COMMISSION_MEMO).await?;

        let held = snapshot.total_supply.amount_of(bond_denom);
        let extra = supply.total_source_supply.checked_sub(held).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "total_source_supply {} is below the snapshot supply {held}",
                supply.total_source_supply
            ))
        })?;
        if extra > 0 {
            state.ensure_account(&supply.extra_supply_addr, "balance_creation_destination")?;
            state.create_balance(
                &supply.extra_supply_addr,
                &Coins::single(bond_denom.clone(), extra),
                EXTRA_SUPPLY_MEMO,
            )?;
        }
        info!(commission = %commission, extra = %extra, "🏦 Authorized supply applied");
        Ok(())
    }

    /// Mint whatever the authorized supply has left to the commission address.
    async fn mint_remaining(&self, state: &mut ConservationLedger, supply: &SupplyAuthorization) -> MergeResult<()> {
        let denom = &self.config.destination_denom;
        let minted = state.minted().amount_of(denom);
        let remaining = supply
            .total_supply_to_mint
            .checked_sub(minted)
            .ok_or_else(|| MergeError::SupplyMismatch {
                expected: format!("{}{denom}", supply.total_supply_to_mint),
                minted: format!("{minted}{denom}"),
            })?;
        if remaining > supply.max_remaining_mint_balance {
            error!(remaining = %remaining, "❌ Unallocated authorized supply above tolerance");
            return Err(MergeError::ToleranceExceeded {
                account: MINT_MODULE.into(),
                balance: format!("{remaining}{denom}"),
                tolerance: supply.max_remaining_mint_balance,
            });
        }
        self.mint_to_commission(state, supply, remaining, REMAINING_MINT_MEMO).await?;
        Ok(())
    }

    async fn mint_to_commission(
        &self,
        state: &mut ConservationLedger,
        supply: &SupplyAuthorization,
        amount: u128,
        memo: &str,
    ) -> MergeResult<bool> {
        let to_raw = codec::decode(&supply.commission_addr, &self.config.destination_address_prefix)?;
        state
            .mint(
                self.ledger.as_ref(),
                MintRequest {
                    from: MINT_MODULE.into(),
                    to: supply.commission_addr.clone(),
                    to_raw,
                    source_balance: Coins::new(),
                    amount: Coins::single(self.config.destination_denom.clone(), amount),
                    memo: Some(memo.into()),
                },
            )
            .await
    }

    /// Convert and mint one base account. Returns `true` if anything was minted.
    ///
    /// A source vesting account, or a destination account that exists and is
    /// not a base account, is a collision: the funds go to the collision
    /// address and the destination account is left alone. Otherwise the
    /// destination account is written even when there is nothing to mint.
    async fn migrate_account(&self, state: &mut ConservationLedger, address: &str) -> MergeResult<bool> {
        let account = state
            .account(address)
            .cloned()
            .ok_or_else(|| MergeError::UnknownAccount(address.to_string()))?;

        let conversion = self
            .conversion
            .convert(&account.balance)
            .ok_or_else(|| MergeError::Overflow(format!("conversion of {address}")))?;
        for denom in &conversion.dropped {
            warn!(address = %address, denom = %denom, "⚠️  No conversion constant, dropping denom");
            record_dropped_denom(denom);
        }

        let merge = &self.config.merge;
        let dst_prefix = &self.config.destination_address_prefix;
        let destination = codec::encode(dst_prefix, account.raw.as_bytes())?;
        let existing = self.ledger.account(&account.raw).await?;
        let collision = account.vesting.is_some() || existing.as_ref().is_some_and(|a| !a.is_base());

        if collision {
            let target_raw = codec::decode(&merge.vesting_collision_dest_addr, dst_prefix)?;
            warn!(address = %address, "⚠️  Vesting collision, minting to collision address");
            state.manifest_mut().record_vesting_collision(VestingCollision {
                original_account: address.to_string(),
                original_account_funds: account.balance.clone(),
                target_account: Some(merge.vesting_collision_dest_addr.clone()),
                target_account_funds: conversion.converted.clone(),
            });
            return state
                .mint(
                    self.ledger.as_ref(),
                    MintRequest {
                        from: address.to_string(),
                        to: merge.vesting_collision_dest_addr.clone(),
                        to_raw: target_raw,
                        source_balance: account.balance,
                        amount: conversion.converted,
                        memo: Some(VESTING_COLLISION_MEMO.into()),
                    },
                )
                .await;
        }

        let mut record = match existing {
            Some(existing) => {
                if let (Some(current), Some(incoming)) = (&existing.pub_key, &account.pub_key)
                    && current != incoming
                {
                    return Err(MergeError::PubKeyCollision(destination));
                }
                LedgerAccount {
                    pub_key: existing.pub_key.clone().or(account.pub_key.clone()),
                    ..existing
                }
            }
            None => LedgerAccount {
                address: account.raw.clone(),
                pub_key: account.pub_key.clone(),
                account_number: self.ledger.next_account_number().await?,
                sequence: account.sequence,
                kind: LedgerAccountKind::Base,
            },
        };
        if !merge.is_vesting_exempt(address) && !conversion.converted.is_empty() {
            let end_time = self
                .options
                .vesting_start
                .checked_add(merge.vesting_period)
                .ok_or_else(|| MergeError::Overflow(format!("vesting end time of {address}")))?;
            record.kind = LedgerAccountKind::ContinuousVesting {
                original_vesting: conversion.converted.clone(),
                start_time: self.options.vesting_start,
                end_time,
            };
        }
        self.ledger.set_account(record).await?;

        state
            .mint(
                self.ledger.as_ref(),
                MintRequest {
                    from: address.to_string(),
                    to: destination,
                    to_raw: account.raw,
                    source_balance: account.balance,
                    amount: conversion.converted,
                    memo: None,
                },
            )
            .await
    }

    // -------------------------------------------------------------------------
    // Stage 7: finalization
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn finalize(&self, state: &mut ConservationLedger) -> MergeResult<()> {
        let _timer = StageTimer::new("finalize");
        let pending: Vec<Account> = state
            .accounts()
            .values()
            .filter(|a| !a.is_migrated())
            .cloned()
            .collect();

        for account in &pending {
            if !account.balance.is_empty() {
                error!(address = %account.address, balance = %account.balance, "❌ Unresolved balance");
                return Err(MergeError::UnresolvedBalance {
                    address: account.address.clone(),
                    kind: account.classification.name().into(),
                    balance: account.balance.to_string(),
                });
            }
            state.mark_migrated(&account.address)?;
        }
        info!(stage = "finalize", finalized = pending.len(), "🏁 Remaining accounts finalized");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Stage 8: supply verification
    // -------------------------------------------------------------------------

    #[instrument(skip_all)]
    fn check_supply(&self, state: &mut ConservationLedger, snapshot: &Snapshot) -> MergeResult<()> {
        let _timer = StageTimer::new("supply");
        let denom = self.config.destination_denom.clone();
        let expected = match &self.config.merge.authorized_supply {
            Some(supply) => supply.total_supply_to_mint,
            None => self
                .conversion
                .convert(&snapshot.total_supply)
                .ok_or_else(|| MergeError::Overflow("converted supply".into()))?
                .converted
                .amount_of(&denom),
        };
        let minted = state.manifest().aggregated_migrated_amount().amount_of(&denom);
        let difference = expected.abs_diff(minted);
        let max_difference = self.config.merge.max_supply_difference;
        let within_tolerance = difference <= max_difference;

        state.manifest_mut().supply_check = Some(SupplyCheck {
            denom: denom.clone(),
            expected,
            minted,
            difference,
            max_difference,
            within_tolerance,
        });

        if within_tolerance {
            info!(stage = "supply", expected = %expected, minted = %minted, "⚖️  Supply verified");
            return Ok(());
        }
        error!(
            expected = %expected,
            minted = %minted,
            difference = %difference,
            max_difference = %max_difference,
            "❌ Minted supply differs from converted source supply"
        );
        if self.config.merge.fail_on_supply_mismatch {
            return Err(MergeError::SupplyMismatch {
                expected: format!("{expected}{denom}"),
                minted: format!("{minted}{denom}"),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
