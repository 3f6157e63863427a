//! Delegation reward reconstruction.
//!
//! The snapshot carries reward accounting rather than reward balances: a
//! delegation's unpaid reward has to be recomputed from its starting period,
//! the validator's cumulative reward ratios and every slash in between.
//!
//! # Flow
//!
//! 1. Close each validator's open period into its reward history
//! 2. Walk each delegation from its starting period through slash events
//! 3. Price the remaining stake over the last period range
//! 4. Outstanding rewards no delegator claims stay with the validator

use std::collections::BTreeMap;

use tracing::{debug, instrument};

use crate::error::{SnapshotError, SnapshotResult};
use crate::models::{
    Dec, DecCoins, DelegatorStartingInfo, DistributionState, OrderedMap, PerDelegation,
    ValidatorInfo,
};

/// Height rewards are computed at. No delegation can start there.
const SNAPSHOT_HEIGHT: u64 = u64::MAX;

/// Recomputed stake may exceed current stake by this many 10^-18 units.
const STAKE_ROUNDING_MARGIN: u128 = 3;

fn invalid(reason: String) -> SnapshotError {
    SnapshotError::InvalidDistribution(reason)
}

/// Fills [`DistributionState::delegator_rewards`] and
/// [`DistributionState::validator_rewards`].
pub struct RewardAggregator<'a> {
    validators: &'a OrderedMap<String, ValidatorInfo>,
    operators: &'a OrderedMap<String, String>,
    /// Delegation shares by operator, then delegator.
    shares: &'a PerDelegation<Dec>,
}

impl<'a> RewardAggregator<'a> {
    pub fn new(
        validators: &'a OrderedMap<String, ValidatorInfo>,
        operators: &'a OrderedMap<String, String>,
        shares: &'a PerDelegation<Dec>,
    ) -> Self {
        Self {
            validators,
            operators,
            shares,
        }
    }

    #[instrument(skip_all)]
    pub fn aggregate(&self, state: &mut DistributionState) -> SnapshotResult<()> {
        let operators: Vec<String> = state.starting_infos.keys().cloned().collect();
        let mut priced = 0usize;

        for operator in &operators {
            let validator = self.validator(operator)?;
            let ending_period = close_current_period(state, operator, validator)?;
            let mut outstanding = state
                .outstanding_rewards
                .get(operator)
                .cloned()
                .ok_or_else(|| invalid(format!("validator {operator} has no outstanding rewards")))?;

            let delegations: Vec<(String, DelegatorStartingInfo)> = state
                .starting_infos
                .get(operator)
                .map(|infos| infos.iter().map(|(d, i)| (d.clone(), i.clone())).collect())
                .unwrap_or_default();

            for (delegator, starting) in &delegations {
                let shares = self
                    .shares
                    .get(operator)
                    .and_then(|by_delegator| by_delegator.get(delegator))
                    .ok_or_else(|| {
                        invalid(format!("starting info of {delegator} on {operator} has no delegation"))
                    })?;
                let rewards = delegation_rewards(
                    state,
                    operator,
                    validator,
                    delegator,
                    shares,
                    starting,
                    ending_period,
                )?;

                let claimed = rewards.intersect(&outstanding);
                outstanding = outstanding
                    .checked_sub(&claimed)
                    .ok_or_else(|| invalid(format!("rewards of {delegator} exceed outstanding of {operator}")))?;
                state
                    .delegator_rewards
                    .get_or_insert_with(delegator.clone(), OrderedMap::new)
                    .insert(operator.clone(), rewards);
                priced += 1;
            }

            state.validator_rewards.insert(operator.clone(), outstanding);
        }

        debug!(validators = operators.len(), delegations = priced, "Delegation rewards recomputed");
        Ok(())
    }

    fn validator(&self, operator: &str) -> SnapshotResult<&'a ValidatorInfo> {
        self.operators
            .get(operator)
            .and_then(|id| self.validators.get(id))
            .ok_or_else(|| invalid(format!("rewards recorded for unknown validator {operator}")))
    }
}

/// Fold the open period into the history and return its number.
///
/// A validator without stake cannot carry a reward ratio, so its open
/// rewards go to the community pool instead.
fn close_current_period(
    state: &mut DistributionState,
    operator: &str,
    validator: &ValidatorInfo,
) -> SnapshotResult<u64> {
    let current = state
        .current_rewards
        .get(operator)
        .cloned()
        .ok_or_else(|| invalid(format!("validator {operator} has no current rewards")))?;

    let ratio = if validator.tokens == 0 {
        state.community_pool = state.community_pool.add(&current.rewards);
        let outstanding = state
            .outstanding_rewards
            .get_mut(operator)
            .ok_or_else(|| invalid(format!("validator {operator} has no outstanding rewards")))?;
        *outstanding = outstanding
            .checked_sub(&current.rewards)
            .ok_or_else(|| invalid(format!("current rewards of {operator} exceed its outstanding rewards")))?;
        DecCoins::new()
    } else {
        current
            .rewards
            .quo_dec_truncate(&Dec::from_u128(validator.tokens))
            .unwrap_or_default()
    };

    let history = state
        .historical_rewards
        .get_mut(operator)
        .ok_or_else(|| invalid(format!("validator {operator} has no reward history")))?;
    let previous_period = current
        .period
        .checked_sub(1)
        .ok_or_else(|| invalid(format!("validator {operator} is in period 0")))?;
    let previous = history
        .get(&previous_period)
        .cloned()
        .ok_or_else(|| invalid(format!("validator {operator} has no history for period {previous_period}")))?;
    history.insert(current.period, previous.add(&ratio));
    Ok(current.period)
}

fn delegation_rewards(
    state: &DistributionState,
    operator: &str,
    validator: &ValidatorInfo,
    delegator: &str,
    shares: &Dec,
    starting: &DelegatorStartingInfo,
    ending_period: u64,
) -> SnapshotResult<DecCoins> {
    if starting.height == SNAPSHOT_HEIGHT {
        return Ok(DecCoins::new());
    }

    let history = state
        .historical_rewards
        .get(operator)
        .ok_or_else(|| invalid(format!("validator {operator} has no reward history")))?;
    let mut rewards = DecCoins::new();
    let mut starting_period = starting.previous_period;
    let mut stake = starting.stake.clone();

    // Each slash closes a period; price the stake as it stood before it
    if let Some(events) = state.slash_events.get(operator) {
        for event in events.range(starting.height..).map(|(_, e)| e) {
            if event.validator_period <= starting_period {
                continue;
            }
            let earned = rewards_between(history, operator, starting_period, event.validator_period, &stake)?;
            rewards = rewards.add(&earned);
            let kept = Dec::one()
                .checked_sub(&event.fraction)
                .ok_or_else(|| invalid(format!("slash fraction {} of {operator} is above one", event.fraction)))?;
            stake = stake.mul_truncate(&kept);
            starting_period = event.validator_period;
        }
    }

    let current_stake = shares
        .mul_int(validator.tokens)
        .quo_round(&validator.delegator_shares)
        .ok_or_else(|| invalid(format!("validator {operator} has no delegator shares")))?;
    if stake > current_stake {
        let ceiling = &current_stake + &Dec::smallest().mul_int(STAKE_ROUNDING_MARGIN);
        if stake > ceiling {
            return Err(invalid(format!(
                "recomputed stake {stake} of {delegator} on {operator} exceeds current stake {current_stake}"
            )));
        }
        stake = current_stake;
    }

    let earned = rewards_between(history, operator, starting_period, ending_period, &stake)?;
    Ok(rewards.add(&earned))
}

/// `stake * (ratio[end] - ratio[start])`, truncated.
fn rewards_between(
    history: &BTreeMap<u64, DecCoins>,
    operator: &str,
    start: u64,
    end: u64,
    stake: &Dec,
) -> SnapshotResult<DecCoins> {
    if start > end {
        return Err(invalid(format!("period {start} of {operator} is after period {end}")));
    }
    let ratio_at = |period: u64| {
        history
            .get(&period)
            .ok_or_else(|| invalid(format!("validator {operator} has no history for period {period}")))
    };
    let difference = ratio_at(end)?
        .checked_sub(ratio_at(start)?)
        .ok_or_else(|| invalid(format!("reward ratio of {operator} decreases from period {start} to {end}")))?;
    Ok(difference.mul_dec_truncate(stake))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BondStatus, PubKey, ValidatorCurrentRewards, ValidatorSlashEvent};

    const OPERATOR: &str = "cudosvaloper1op";

    fn dec(s: &str) -> Dec {
        s.parse().unwrap()
    }

    fn acudos(amount: &str) -> DecCoins {
        DecCoins::single("acudos", dec(amount))
    }

    struct Staking {
        validators: OrderedMap<String, ValidatorInfo>,
        operators: OrderedMap<String, String>,
        shares: PerDelegation<Dec>,
    }

    fn staking(tokens: u128, total_shares: &str, delegations: &[(&str, &str)]) -> Staking {
        let mut validators = OrderedMap::new();
        validators.insert(
            "val".to_string(),
            ValidatorInfo {
                operator_address: OPERATOR.into(),
                consensus_pubkey: PubKey::Ed25519(vec![1; 32]),
                tokens,
                delegator_shares: dec(total_shares),
                status: BondStatus::Bonded,
            },
        );
        let mut operators = OrderedMap::new();
        operators.insert(OPERATOR.to_string(), "val".to_string());
        let mut shares = PerDelegation::new();
        let by_delegator = shares.get_or_insert_with(OPERATOR.to_string(), OrderedMap::new);
        for (delegator, amount) in delegations {
            by_delegator.insert(delegator.to_string(), dec(amount));
        }
        Staking {
            validators,
            operators,
            shares,
        }
    }

    fn starting(previous_period: u64, stake: &str) -> DelegatorStartingInfo {
        DelegatorStartingInfo {
            previous_period,
            height: 10,
            stake: dec(stake),
        }
    }

    fn state(
        current: (u64, &str),
        outstanding: &str,
        history: &[(u64, &str)],
        starts: &[(&str, DelegatorStartingInfo)],
    ) -> DistributionState {
        let mut state = DistributionState::default();
        state.current_rewards.insert(
            OPERATOR.into(),
            ValidatorCurrentRewards {
                period: current.0,
                rewards: acudos(current.1),
            },
        );
        state.outstanding_rewards.insert(OPERATOR.into(), acudos(outstanding));
        state.historical_rewards.insert(
            OPERATOR.into(),
            history.iter().map(|(p, r)| (*p, acudos(r))).collect(),
        );
        let infos = state
            .starting_infos
            .get_or_insert_with(OPERATOR.to_string(), OrderedMap::new);
        for (delegator, info) in starts {
            infos.insert(delegator.to_string(), info.clone());
        }
        state
    }

    fn aggregate(staking: &Staking, state: &mut DistributionState) -> SnapshotResult<()> {
        RewardAggregator::new(&staking.validators, &staking.operators, &staking.shares).aggregate(state)
    }

    // Critical: delegators split the open period by stake and the validator
    // keeps only what they do not claim
    #[test]
    fn test_open_period_split_by_stake() {
        let staking = staking(1000, "1000", &[("d1", "400"), ("d2", "600")]);
        let mut state = state(
            (1, "50"),
            "60",
            &[(0, "0")],
            &[("d1", starting(0, "400")), ("d2", starting(0, "600"))],
        );

        aggregate(&staking, &mut state).unwrap();

        assert_eq!(state.delegator_reward("d1", OPERATOR), acudos("20"));
        assert_eq!(state.delegator_reward("d2", OPERATOR), acudos("30"));
        assert_eq!(state.validator_rewards.get(OPERATOR), Some(&acudos("10")));
        assert_eq!(
            state.historical_rewards.get(OPERATOR).unwrap().get(&1),
            Some(&acudos("0.05"))
        );
    }

    #[test]
    fn test_slash_splits_reward_periods() {
        // 400 stake earns 0.02/token before a 50% slash, then 0.05/token on 200
        let staking = staking(200, "400", &[("d1", "400")]);
        let mut state = state(
            (2, "10"),
            "18",
            &[(0, "0"), (1, "0.02")],
            &[("d1", starting(0, "400"))],
        );
        let mut events = BTreeMap::new();
        events.insert(
            20,
            ValidatorSlashEvent {
                validator_period: 1,
                fraction: dec("0.5"),
            },
        );
        state.slash_events.insert(OPERATOR.into(), events);

        aggregate(&staking, &mut state).unwrap();

        assert_eq!(state.delegator_reward("d1", OPERATOR), acudos("18"));
        assert_eq!(state.validator_rewards.get(OPERATOR), Some(&DecCoins::new()));
    }

    #[test]
    fn test_zero_stake_validator_feeds_community_pool() {
        let staking = staking(0, "100", &[("d1", "100")]);
        let mut state = state((1, "5"), "5", &[(0, "0")], &[("d1", starting(0, "0"))]);

        aggregate(&staking, &mut state).unwrap();

        assert_eq!(state.community_pool, acudos("5"));
        assert_eq!(state.delegator_reward("d1", OPERATOR), DecCoins::new());
        assert_eq!(state.outstanding_rewards.get(OPERATOR), Some(&DecCoins::new()));
    }

    #[test]
    fn test_stake_above_current_is_rejected() {
        let staking = staking(1000, "1000", &[("d1", "100")]);
        let mut state = state((1, "0"), "0", &[(0, "0")], &[("d1", starting(0, "150"))]);

        let err = aggregate(&staking, &mut state).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidDistribution(r) if r.contains("exceeds current stake")));
    }

    #[test]
    fn test_stake_within_rounding_margin_is_clamped() {
        let staking = staking(1000, "1000", &[("d1", "100")]);
        let mut state = state(
            (1, "10"),
            "10",
            &[(0, "0")],
            &[("d1", starting(0, "100.000000000000000002"))],
        );

        aggregate(&staking, &mut state).unwrap();
        assert_eq!(state.delegator_reward("d1", OPERATOR), acudos("1"));
    }

    #[test]
    fn test_starting_info_without_delegation() {
        let staking = staking(1000, "1000", &[]);
        let mut state = state((1, "0"), "0", &[(0, "0")], &[("d1", starting(0, "1"))]);

        let err = aggregate(&staking, &mut state).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidDistribution(r) if r.contains("has no delegation")));
    }

    #[test]
    fn test_missing_history_rejected() {
        let staking = staking(1000, "1000", &[("d1", "1")]);
        let mut state = state((3, "0"), "0", &[(0, "0")], &[("d1", starting(0, "1"))]);

        let err = aggregate(&staking, &mut state).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidDistribution(r) if r.contains("period 2")));
    }
}
