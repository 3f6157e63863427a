//! Per-account balance sheets for the manifest.
//!
//! `initial_balances` captures what every holder owned in the snapshot:
//! bank balance, stake per validator, unbonding entries and unpaid rewards.
//! `moved_balances` captures every account a movement touched, after the
//! movement stages ran.

use tracing::debug;

use crate::codec;
use crate::error::{MergeError, MergeResult};
use crate::manifest::{AccountBalances, ValidatorBalance};
use crate::models::{Coins, OrderedMap};
use crate::services::conservation::ConservationLedger;
use crate::services::indexer::Snapshot;

/// Resolved delegator to source operator to re-delegated tokens.
pub type Redelegations = OrderedMap<String, OrderedMap<String, u128>>;

#[derive(Debug, Clone, Copy)]
enum Holding {
    Bonded,
    Unbonded,
    Unbonding,
    Reward,
}

/// Balance sheets keyed by account, in first-seen order.
#[derive(Debug, Default)]
struct BalanceSheet {
    entries: OrderedMap<String, AccountBalances>,
}

impl BalanceSheet {
    fn entry(&mut self, address: &str) -> &mut AccountBalances {
        self.entries
            .get_or_insert_with(address.to_string(), || AccountBalances {
                address: address.to_string(),
                ..Default::default()
            })
    }

    fn add(&mut self, address: &str, holding: Holding, validator: &str, amount: &Coins) -> MergeResult<()> {
        if amount.is_empty() {
            return Ok(());
        }
        let entry = self.entry(address);
        let (list, aggr) = match holding {
            Holding::Bonded => (&mut entry.bonded_staking_balances, &mut entry.bonded_staking_balances_aggr),
            Holding::Unbonded => (&mut entry.unbonded_staking_balances, &mut entry.unbonded_staking_balances_aggr),
            Holding::Unbonding => (
                &mut entry.unbonding_staking_balances,
                &mut entry.unbonding_staking_balances_aggr,
            ),
            Holding::Reward => (&mut entry.delegator_rewards, &mut entry.delegator_rewards_aggr),
        };
        *aggr = aggr
            .checked_add(amount)
            .ok_or_else(|| MergeError::Overflow(format!("balance sheet of {address}")))?;
        match list.iter_mut().find(|v| v.validator == validator) {
            Some(existing) => {
                existing.balance = existing
                    .balance
                    .checked_add(amount)
                    .ok_or_else(|| MergeError::Overflow(format!("balance sheet of {address}")))?;
            }
            None => list.push(ValidatorBalance {
                validator: validator.to_string(),
                balance: amount.clone(),
            }),
        }
        Ok(())
    }

    fn into_vec(self) -> Vec<AccountBalances> {
        self.entries.values().filter(|e| !is_blank(e)).cloned().collect()
    }
}

fn is_blank(entry: &AccountBalances) -> bool {
    entry.bank_balance.is_empty()
        && entry.vested_balance.is_empty()
        && entry.bonded_staking_balances_aggr.is_empty()
        && entry.unbonded_staking_balances_aggr.is_empty()
        && entry.unbonding_staking_balances_aggr.is_empty()
        && entry.delegator_rewards_aggr.is_empty()
        && entry.validator_rewards.is_empty()
}

/// Holdings of every account in the snapshot, before any movement.
pub fn initial_balances(snapshot: &Snapshot, valoper_prefix: &str) -> MergeResult<Vec<AccountBalances>> {
    let mut sheet = BalanceSheet::default();

    for account in snapshot.accounts.values() {
        let entry = sheet.entry(&account.address);
        entry.bank_balance = account.balance.clone();
        if let Some(vesting) = &account.vesting {
            entry.vested_balance = vesting.original_vesting.clone();
        }
    }

    for delegation in &snapshot.delegations {
        let bonded = snapshot
            .validators
            .get(&delegation.validator_id)
            .is_some_and(|v| v.status.is_bonded());
        let holding = if bonded { Holding::Bonded } else { Holding::Unbonded };
        let amount = Coins::single(snapshot.bond_denom.clone(), delegation.tokens);
        sheet.add(&delegation.delegator, holding, &delegation.validator_operator, &amount)?;
    }

    for entry in &snapshot.unbonding {
        let amount = Coins::single(snapshot.bond_denom.clone(), entry.balance);
        sheet.add(&entry.delegator, Holding::Unbonding, &entry.validator_operator, &amount)?;
    }

    let distribution = &snapshot.distribution;
    for (delegator, by_validator) in distribution.delegator_rewards.iter() {
        for (operator, reward) in by_validator.iter() {
            let (whole, _) = reward
                .truncate()
                .ok_or_else(|| MergeError::Overflow(format!("reward of {delegator}")))?;
            sheet.add(delegator, Holding::Reward, operator, &whole)?;
        }
    }

    for (operator, reward) in distribution.validator_rewards.iter() {
        let (whole, _) = reward
            .truncate()
            .ok_or_else(|| MergeError::Overflow(format!("rewards of {operator}")))?;
        if whole.is_empty() {
            continue;
        }
        let account = codec::convert(operator, valoper_prefix, &snapshot.prefix)?;
        sheet.entry(&account).validator_rewards = whole;
    }

    let balances = sheet.into_vec();
    debug!(accounts = balances.len(), "Initial balances captured");
    Ok(balances)
}

/// Holdings of every account touched by a movement.
///
/// Stake that will be re-delegated on the destination is reported as bonded
/// and left out of the bank balance.
pub fn moved_balances(
    state: &ConservationLedger,
    redelegations: &Redelegations,
    bond_denom: &str,
) -> MergeResult<Vec<AccountBalances>> {
    let mut sheet = BalanceSheet::default();
    for address in state.moved_accounts() {
        let mut bonded = Coins::new();
        if let Some(by_validator) = redelegations.get(address) {
            for (operator, tokens) in by_validator.iter() {
                let amount = Coins::single(bond_denom.to_string(), *tokens);
                sheet.add(address, Holding::Bonded, operator, &amount)?;
                bonded = bonded
                    .checked_add(&amount)
                    .ok_or_else(|| MergeError::Overflow(format!("stake of {address}")))?;
            }
        }
        sheet.entry(address).bank_balance = state.balance_of(address).saturating_sub(&bonded);
    }
    Ok(sheet.into_vec())
}
