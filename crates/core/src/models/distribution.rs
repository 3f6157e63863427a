//! Distribution module state.
//!
//! Reward bookkeeping is kept in decimal coins. Delegator rewards are
//! recomputed from the period history at indexing time and withdrawn by the
//! pipeline as whole tokens; the dust goes back to the community pool.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use super::{Coins, Dec, OrderedMap};
use crate::error::{SnapshotError, SnapshotResult};
use crate::utils::{malformed, require_str};

// =============================================================================
// DecCoins
// =============================================================================

/// Multi-denom decimal amount. Zero entries are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecCoins(BTreeMap<String, Dec>);

impl DecCoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(denom: impl Into<String>, amount: Dec) -> Self {
        let mut coins = Self::new();
        if !amount.is_zero() {
            coins.0.insert(denom.into(), amount);
        }
        coins
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn amount_of(&self, denom: &str) -> Dec {
        self.0.get(denom).cloned().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Dec)> {
        self.0.iter().map(|(d, a)| (d.as_str(), a))
    }

    pub fn add(&self, other: &DecCoins) -> DecCoins {
        let mut sum = self.0.clone();
        for (denom, amount) in &other.0 {
            let entry = sum.entry(denom.clone()).or_default();
            *entry = &*entry + amount;
        }
        Self(sum)
    }

    /// `self - other`, or `None` if any denom would go negative.
    pub fn checked_sub(&self, other: &DecCoins) -> Option<DecCoins> {
        let mut result = self.0.clone();
        for (denom, amount) in &other.0 {
            let current = result.get(denom).cloned().unwrap_or_default();
            let left = current.checked_sub(amount)?;
            if left.is_zero() {
                result.remove(denom);
            } else {
                result.insert(denom.clone(), left);
            }
        }
        Some(Self(result))
    }

    /// Per-denom minimum over the denoms both sides hold.
    pub fn intersect(&self, other: &DecCoins) -> DecCoins {
        self.0
            .iter()
            .filter_map(|(denom, amount)| {
                other
                    .0
                    .get(denom)
                    .map(|theirs| (denom.clone(), amount.min(theirs).clone()))
            })
            .collect()
    }

    pub fn mul_dec_truncate(&self, factor: &Dec) -> DecCoins {
        self.0
            .iter()
            .map(|(denom, amount)| (denom.clone(), amount.mul_truncate(factor)))
            .collect()
    }

    /// `None` when `divisor` is zero.
    pub fn quo_dec_truncate(&self, divisor: &Dec) -> Option<DecCoins> {
        self.0
            .iter()
            .map(|(denom, amount)| amount.quo_truncate(divisor).map(|q| (denom.clone(), q)))
            .collect()
    }

    /// Split into whole tokens and the fractional change.
    ///
    /// Returns `None` if a whole part does not fit in a u128.
    pub fn truncate(&self) -> Option<(Coins, DecCoins)> {
        let mut whole = Vec::with_capacity(self.0.len());
        let mut change = Vec::new();
        for (denom, amount) in &self.0 {
            whole.push((denom.clone(), amount.truncate()?));
            change.push((denom.clone(), amount.fraction()));
        }
        Some((whole.into_iter().collect(), change.into_iter().collect()))
    }

    /// True if every denom truncates to at most `limit`.
    pub fn all_within(&self, limit: u128) -> bool {
        self.0
            .values()
            .all(|a| a.truncate().is_some_and(|whole| whole <= limit))
    }

    /// Parse `[{"denom": ..., "amount": "<decimal>"}]`.
    pub fn from_json(value: &Value, path: &str) -> SnapshotResult<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| malformed(path, "expected a coin array"))?;
        let mut coins = BTreeMap::new();
        for (i, item) in items.iter().enumerate() {
            let item_path = format!("{path}[{i}]");
            let denom = require_str(item, &item_path, "denom")?;
            let amount: Dec = require_str(item, &item_path, "amount")?
                .parse()
                .map_err(|e: super::ParseDecError| malformed(&format!("{item_path}.amount"), e.to_string()))?;
            if coins.contains_key(denom) {
                return Err(SnapshotError::DuplicateEntry {
                    section: path.to_string(),
                    key: denom.to_string(),
                });
            }
            if !amount.is_zero() {
                coins.insert(denom.to_string(), amount);
            }
        }
        Ok(Self(coins))
    }
}

impl FromIterator<(String, Dec)> for DecCoins {
    fn from_iter<I: IntoIterator<Item = (String, Dec)>>(iter: I) -> Self {
        let mut coins = Self::new();
        for (denom, amount) in iter {
            if !amount.is_zero() {
                let entry = coins.0.entry(denom).or_default();
                *entry = &*entry + &amount;
            }
        }
        coins
    }
}

impl fmt::Display for DecCoins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(d, a)| format!("{a}{d}")).collect();
        write!(f, "{}", parts.join(","))
    }
}

// =============================================================================
// Distribution records
// =============================================================================

/// Where a delegation's reward accounting starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatorStartingInfo {
    pub previous_period: u64,
    pub height: u64,
    pub stake: Dec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSlashEvent {
    pub validator_period: u64,
    pub fraction: Dec,
}

/// Rewards accrued in a validator's still-open period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorCurrentRewards {
    pub period: u64,
    pub rewards: DecCoins,
}

/// Operator address to delegator address to a value.
pub type PerDelegation<T> = OrderedMap<String, OrderedMap<String, T>>;

/// Indexed distribution module.
///
/// Validator-keyed maps use the operator address. `delegator_rewards` and
/// `validator_rewards` are derived, everything else is read from the
/// snapshot.
#[derive(Debug, Clone, Default)]
pub struct DistributionState {
    pub community_pool: DecCoins,
    pub outstanding_rewards: OrderedMap<String, DecCoins>,
    pub accumulated_commissions: OrderedMap<String, DecCoins>,
    pub current_rewards: OrderedMap<String, ValidatorCurrentRewards>,
    /// Cumulative reward ratio per period.
    pub historical_rewards: OrderedMap<String, BTreeMap<u64, DecCoins>>,
    pub starting_infos: PerDelegation<DelegatorStartingInfo>,
    /// Keyed by height.
    pub slash_events: OrderedMap<String, BTreeMap<u64, ValidatorSlashEvent>>,
    /// Delegator address to withdraw address.
    pub withdraw_addresses: OrderedMap<String, String>,

    /// Delegator address to operator address to unpaid reward.
    pub delegator_rewards: OrderedMap<String, OrderedMap<String, DecCoins>>,
    /// Outstanding rewards left to each validator after its delegators.
    pub validator_rewards: OrderedMap<String, DecCoins>,
}

impl DistributionState {
    /// Reward destination of `delegator`, defaulting to itself.
    pub fn withdraw_address<'a>(&'a self, delegator: &'a str) -> &'a str {
        self.withdraw_addresses
            .get(delegator)
            .map(String::as_str)
            .unwrap_or(delegator)
    }

    pub fn delegator_reward(&self, delegator: &str, operator: &str) -> DecCoins {
        self.delegator_rewards
            .get(delegator)
            .and_then(|by_validator| by_validator.get(operator))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_rewards(&self) -> bool {
        !self.starting_infos.is_empty() || !self.outstanding_rewards.is_empty()
    }
}
