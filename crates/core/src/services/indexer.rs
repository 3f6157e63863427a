//! Snapshot indexer - turns the untyped source genesis into typed indices.
//!
//! Everything later in the pipeline works on [`Snapshot`]; nothing reads
//! the raw document again. Indexing is all-or-nothing: the first shape
//! defect aborts with a [`SnapshotError`] naming the JSON path.
//!
//! # Flow
//!
//! 1. Contract and IBC escrow indices (classification inputs)
//! 2. Accounts, classified contract > escrow > module > base
//! 3. Balances, attached to the indexed accounts
//! 4. Validators and the operator index
//! 5. Delegations (shares converted to tokens once) and unbonding entries
//! 6. Distribution records, with every unpaid delegation reward recomputed
//! 7. Supply and the module pool addresses

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::config::{ConversionTable, NetworkConfig};
use crate::error::{SnapshotError, SnapshotResult};
use crate::models::{
    Account, AccountClassification, BondStatus, Coins, ContractInfo, Dec, DecCoins, Delegation,
    DelegatorStartingInfo, DistributionState, IbcEscrow, OrderedMap, PerDelegation, PubKey,
    UnbondingEntry, ValidatorCurrentRewards, ValidatorInfo, ValidatorSlashEvent, VestingKind,
    VestingSchedule,
};
use crate::services::rewards::RewardAggregator;
use crate::utils::{
    lookup, malformed, optional_array, optional_str, parse_i64, parse_u64, require, require_amount,
    require_array, require_str,
};

pub const BONDED_POOL: &str = "bonded_tokens_pool";
pub const NOT_BONDED_POOL: &str = "not_bonded_tokens_pool";
pub const DISTRIBUTION_MODULE: &str = "distribution";
pub const GRAVITY_MODULE: &str = "gravity";

/// Reason recorded for accounts materialised from a bare balance row.
pub const BALANCE_WITHOUT_AUTH_REASON: &str = "bank_balance_no_auth_acc";

const BASE_ACCOUNT_TYPE: &str = "/cosmos.auth.v1beta1.BaseAccount";
const MODULE_ACCOUNT_TYPE: &str = "/cosmos.auth.v1beta1.ModuleAccount";

// =============================================================================
// Snapshot
// =============================================================================

/// Typed view of a source genesis snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub chain_id: String,
    pub initial_height: u64,
    /// Account address prefix.
    pub prefix: String,
    pub bond_denom: String,
    pub total_supply: Coins,

    pub accounts: OrderedMap<String, Account>,
    /// Keyed by validator id (see [`PubKey::id`]).
    pub validators: OrderedMap<String, ValidatorInfo>,
    /// Operator address to validator id.
    pub validator_operator_index: OrderedMap<String, String>,
    pub delegations: Vec<Delegation>,
    pub unbonding: Vec<UnbondingEntry>,
    /// Reward accounting, with unpaid delegation rewards already derived.
    pub distribution: DistributionState,
    pub contracts: OrderedMap<String, ContractInfo>,
    pub ibc_escrows: OrderedMap<String, IbcEscrow>,

    pub bonded_pool: String,
    pub not_bonded_pool: String,
    pub distribution_module: Option<String>,
    pub gravity_module: Option<String>,

    /// `(address, reason)` for accounts that had no auth record.
    pub created_accounts: Vec<(String, String)>,
}

impl Snapshot {
    /// Validator serving `operator_address`.
    pub fn validator_by_operator(&self, operator_address: &str) -> Option<&ValidatorInfo> {
        self.validator_operator_index
            .get(operator_address)
            .and_then(|id| self.validators.get(id))
    }

    /// Sum of every indexed account balance.
    pub fn total_balance(&self) -> Option<Coins> {
        self.accounts
            .values()
            .try_fold(Coins::new(), |acc, a| acc.checked_add(&a.balance))
    }
}

// =============================================================================
// SnapshotIndexer
// =============================================================================

/// Builds a [`Snapshot`] from a parsed genesis document.
pub struct SnapshotIndexer {
    prefix: String,
    valoper_prefix: String,
    conversion: ConversionTable,
}

impl SnapshotIndexer {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            prefix: config.source_address_prefix.clone(),
            valoper_prefix: config.source_valoper_prefix(),
            conversion: config.conversion_table(),
        }
    }

    /// Index the whole document.
    #[instrument(skip_all, fields(prefix = %self.prefix))]
    pub fn index(&self, genesis: &Value) -> SnapshotResult<Snapshot> {
        let chain_id = require_str(genesis, "genesis", "chain_id")?.to_string();
        let initial_height = parse_u64(require(genesis, "genesis", "initial_height")?)
            .ok_or_else(|| malformed("genesis.initial_height", "expected an unsigned integer"))?;
        let app_state = require(genesis, "genesis", "app_state")?;

        let bond_denom = lookup(app_state, "staking.params.bond_denom")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| malformed("app_state.staking.params.bond_denom", "missing bond denom"))?
            .to_string();

        let contracts = self.index_contracts(app_state)?;
        let ibc_escrows = self.index_escrows(app_state)?;
        let mut accounts = self.index_accounts(app_state, &contracts, &ibc_escrows)?;
        let created_accounts =
            self.attach_balances(app_state, &mut accounts, &contracts, &ibc_escrows)?;

        // Every channel gets an escrow entry so withdrawal can record it
        for (address, escrow) in ibc_escrows.iter() {
            if !accounts.contains_key(address) {
                let raw = codec::decode(address, &self.prefix)?;
                let mut account = Account::new_base(address.clone(), raw);
                account.classification = AccountClassification::IbcEscrow {
                    channel_id: escrow.channel_id.clone(),
                    port_id: escrow.port_id.clone(),
                };
                accounts.insert(address.clone(), account);
            }
        }

        let (validators, validator_operator_index) = self.index_validators(app_state)?;
        let (delegations, shares) =
            self.index_delegations(app_state, &validators, &validator_operator_index)?;
        let unbonding = self.index_unbonding(app_state)?;
        let mut distribution = self.index_distribution(app_state)?;
        RewardAggregator::new(&validators, &validator_operator_index, &shares).aggregate(&mut distribution)?;

        let bank = require(app_state, "app_state", "bank")?;
        let total_supply = Coins::from_json(require(bank, "app_state.bank", "supply")?, "app_state.bank.supply")?;

        let module_address = |name: &str| {
            accounts
                .values()
                .find(|a| a.module_name() == Some(name))
                .map(|a| a.address.clone())
        };
        let bonded_pool = module_address(BONDED_POOL)
            .ok_or_else(|| SnapshotError::MissingModuleAccount(BONDED_POOL.into()))?;
        let not_bonded_pool = module_address(NOT_BONDED_POOL)
            .ok_or_else(|| SnapshotError::MissingModuleAccount(NOT_BONDED_POOL.into()))?;
        let distribution_module = module_address(DISTRIBUTION_MODULE);
        let gravity_module = module_address(GRAVITY_MODULE);

        info!(
            chain_id = %chain_id,
            height = initial_height,
            accounts = accounts.len(),
            validators = validators.len(),
            delegations = delegations.len(),
            rewarded_delegators = distribution.delegator_rewards.len(),
            contracts = contracts.len(),
            channels = ibc_escrows.len(),
            "📸 Snapshot indexed"
        );

        Ok(Snapshot {
            chain_id,
            initial_height,
            prefix: self.prefix.clone(),
            bond_denom,
            total_supply,
            accounts,
            validators,
            validator_operator_index,
            delegations,
            unbonding,
            distribution,
            contracts,
            ibc_escrows,
            bonded_pool,
            not_bonded_pool,
            distribution_module,
            gravity_module,
            created_accounts,
        })
    }

    // -------------------------------------------------------------------------
    // Contracts & channels
    // -------------------------------------------------------------------------

    fn index_contracts(&self, app_state: &Value) -> SnapshotResult<OrderedMap<String, ContractInfo>> {
        let mut contracts = OrderedMap::new();
        let Some(wasm) = app_state.get("wasm") else {
            return Ok(contracts);
        };
        for (i, entry) in optional_array(wasm, "app_state.wasm", "contracts")?.iter().enumerate() {
            let path = format!("app_state.wasm.contracts[{i}]");
            let address = require_str(entry, &path, "contract_address")?;
            codec::decode(address, &self.prefix)?;
            let info = require(entry, &path, "contract_info")?;
            let contract = ContractInfo {
                admin: optional_str(info, "admin").map(str::to_string),
                creator: optional_str(info, "creator").map(str::to_string),
            };
            if contracts.insert(address.to_string(), contract).is_some() {
                return Err(duplicate("app_state.wasm.contracts", address));
            }
        }
        debug!(count = contracts.len(), "Contracts indexed");
        Ok(contracts)
    }

    fn index_escrows(&self, app_state: &Value) -> SnapshotResult<OrderedMap<String, IbcEscrow>> {
        let mut escrows = OrderedMap::new();
        let Some(channel_genesis) = lookup(app_state, "ibc.channel_genesis") else {
            return Ok(escrows);
        };
        let section = "app_state.ibc.channel_genesis";
        for (i, channel) in optional_array(channel_genesis, section, "channels")?.iter().enumerate() {
            let path = format!("{section}.channels[{i}]");
            let escrow = IbcEscrow {
                port_id: require_str(channel, &path, "port_id")?.to_string(),
                channel_id: require_str(channel, &path, "channel_id")?.to_string(),
            };
            let address = codec::escrow_address(&self.prefix, &escrow.port_id, &escrow.channel_id)?;
            if escrows.insert(address, escrow.clone()).is_some() {
                return Err(duplicate(section, &escrow.path()));
            }
        }
        debug!(count = escrows.len(), "IBC escrows indexed");
        Ok(escrows)
    }

    // -------------------------------------------------------------------------
    // Accounts & balances
    // -------------------------------------------------------------------------

    fn index_accounts(
        &self,
        app_state: &Value,
        contracts: &OrderedMap<String, ContractInfo>,
        escrows: &OrderedMap<String, IbcEscrow>,
    ) -> SnapshotResult<OrderedMap<String, Account>> {
        let auth = require(app_state, "app_state", "auth")?;
        let mut accounts = OrderedMap::new();

        for (i, entry) in require_array(auth, "app_state.auth", "accounts")?.iter().enumerate() {
            let path = format!("app_state.auth.accounts[{i}]");
            let mut account = self.parse_account(entry, &path)?;

            if contracts.contains_key(&account.address) {
                account.classification = AccountClassification::Contract;
            } else if let Some(escrow) = escrows.get(&account.address) {
                account.classification = AccountClassification::IbcEscrow {
                    channel_id: escrow.channel_id.clone(),
                    port_id: escrow.port_id.clone(),
                };
            }

            let address = account.address.clone();
            if accounts.insert(address.clone(), account).is_some() {
                return Err(duplicate("app_state.auth.accounts", &address));
            }
        }
        Ok(accounts)
    }

    fn parse_account(&self, entry: &Value, path: &str) -> SnapshotResult<Account> {
        let type_url = require_str(entry, path, "@type")?;
        match type_url {
            BASE_ACCOUNT_TYPE => self.parse_base(entry, path),
            MODULE_ACCOUNT_TYPE => {
                let base_path = format!("{path}.base_account");
                let mut account = self.parse_base(require(entry, path, "base_account")?, &base_path)?;
                account.classification = AccountClassification::Module {
                    name: require_str(entry, path, "name")?.to_string(),
                };
                Ok(account)
            }
            other => {
                let kind = VestingKind::from_type_url(other)
                    .ok_or_else(|| SnapshotError::UnknownAccountType(other.to_string()))?;
                self.parse_vesting(entry, path, kind)
            }
        }
    }

    fn parse_base(&self, entry: &Value, path: &str) -> SnapshotResult<Account> {
        let address = require_str(entry, path, "address")?;
        let raw = codec::decode(address, &self.prefix)?;
        let pub_key = match entry.get("pub_key") {
            None | Some(Value::Null) => None,
            Some(key) => Some(PubKey::from_json(key)?),
        };
        let number = |key: &str| -> SnapshotResult<u64> {
            match entry.get(key) {
                None | Some(Value::Null) => Ok(0),
                Some(v) => parse_u64(v)
                    .ok_or_else(|| malformed(&format!("{path}.{key}"), "expected an unsigned integer")),
            }
        };

        let mut account = Account::new_base(address, raw);
        account.pub_key = pub_key;
        account.account_number = number("account_number")?;
        account.sequence = number("sequence")?;
        Ok(account)
    }

    fn parse_vesting(&self, entry: &Value, path: &str, kind: VestingKind) -> SnapshotResult<Account> {
        let bva_path = format!("{path}.base_vesting_account");
        let bva = require(entry, path, "base_vesting_account")?;
        let mut account = self.parse_base(
            require(bva, &bva_path, "base_account")?,
            &format!("{bva_path}.base_account"),
        )?;

        let original_vesting = Coins::from_json(
            require(bva, &bva_path, "original_vesting")?,
            &format!("{bva_path}.original_vesting"),
        )?;
        let end_time = parse_i64(require(bva, &bva_path, "end_time")?)
            .ok_or_else(|| malformed(&format!("{bva_path}.end_time"), "expected an integer"))?;
        let start_time = match entry.get("start_time") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                parse_i64(v).ok_or_else(|| malformed(&format!("{path}.start_time"), "expected an integer"))?,
            ),
        };

        account.vesting = Some(VestingSchedule {
            kind,
            original_vesting,
            start_time,
            end_time,
        });
        Ok(account)
    }

    /// Attach bank balances. Returns the accounts materialised on the way.
    fn attach_balances(
        &self,
        app_state: &Value,
        accounts: &mut OrderedMap<String, Account>,
        contracts: &OrderedMap<String, ContractInfo>,
        escrows: &OrderedMap<String, IbcEscrow>,
    ) -> SnapshotResult<Vec<(String, String)>> {
        let bank = require(app_state, "app_state", "bank")?;
        let mut seen = std::collections::HashSet::new();
        let mut created = Vec::new();

        for (i, entry) in require_array(bank, "app_state.bank", "balances")?.iter().enumerate() {
            let path = format!("app_state.bank.balances[{i}]");
            let address = require_str(entry, &path, "address")?;
            let coins = Coins::from_json(require(entry, &path, "coins")?, &format!("{path}.coins"))?;
            if !seen.insert(address.to_string()) {
                return Err(duplicate("app_state.bank.balances", address));
            }

            if let Some(account) = accounts.get_mut(address) {
                account.balance = coins;
                continue;
            }

            let classification = if contracts.contains_key(address) {
                AccountClassification::Contract
            } else if let Some(escrow) = escrows.get(address) {
                AccountClassification::IbcEscrow {
                    channel_id: escrow.channel_id.clone(),
                    port_id: escrow.port_id.clone(),
                }
            } else if self.conversion.converts_any(&coins) {
                return Err(SnapshotError::OrphanBalance(address.to_string()));
            } else {
                warn!(address = %address, balance = %coins, "⚠️  Balance without account record, skipping");
                continue;
            };

            let raw = codec::decode(address, &self.prefix)?;
            let mut account = Account::new_base(address, raw);
            account.classification = classification;
            account.balance = coins;
            debug!(address = %address, kind = account.classification.name(), "Materialised account from balance");
            created.push((address.to_string(), BALANCE_WITHOUT_AUTH_REASON.to_string()));
            accounts.insert(address.to_string(), account);
        }
        Ok(created)
    }

    // -------------------------------------------------------------------------
    // Staking
    // -------------------------------------------------------------------------

    #[allow(clippy::type_complexity)]
    fn index_validators(
        &self,
        app_state: &Value,
    ) -> SnapshotResult<(OrderedMap<String, ValidatorInfo>, OrderedMap<String, String>)> {
        let staking = require(app_state, "app_state", "staking")?;
        let mut validators = OrderedMap::new();
        let mut operators = OrderedMap::new();

        for (i, entry) in optional_array(staking, "app_state.staking", "validators")?.iter().enumerate() {
            let path = format!("app_state.staking.validators[{i}]");
            let operator_address = require_str(entry, &path, "operator_address")?.to_string();
            codec::decode(&operator_address, &self.valoper_prefix)?;
            let consensus_pubkey = PubKey::from_json(require(entry, &path, "consensus_pubkey")?)?;
            let tokens = require_amount(entry, &path, "tokens")?;
            let delegator_shares = parse_dec(entry, &path, "delegator_shares")?;
            let status = BondStatus::parse(require_str(entry, &path, "status")?);

            let id = consensus_pubkey.id();
            let info = ValidatorInfo {
                operator_address: operator_address.clone(),
                consensus_pubkey,
                tokens,
                delegator_shares,
                status,
            };
            if validators.insert(id.clone(), info).is_some() {
                return Err(duplicate("app_state.staking.validators", &id));
            }
            if operators.insert(operator_address.clone(), id).is_some() {
                return Err(duplicate("app_state.staking.validators", &operator_address));
            }
        }
        Ok((validators, operators))
    }

    /// Delegations worth at least one token, plus the shares of every
    /// delegation for reward accounting.
    fn index_delegations(
        &self,
        app_state: &Value,
        validators: &OrderedMap<String, ValidatorInfo>,
        operators: &OrderedMap<String, String>,
    ) -> SnapshotResult<(Vec<Delegation>, PerDelegation<Dec>)> {
        let staking = require(app_state, "app_state", "staking")?;
        let mut delegations = Vec::new();
        let mut shares_index = PerDelegation::new();

        for (i, entry) in optional_array(staking, "app_state.staking", "delegations")?.iter().enumerate() {
            let path = format!("app_state.staking.delegations[{i}]");
            let delegator = require_str(entry, &path, "delegator_address")?;
            codec::decode(delegator, &self.prefix)?;
            let operator = require_str(entry, &path, "validator_address")?;
            let shares = parse_dec(entry, &path, "shares")?;

            let (validator_id, validator) = operators
                .get(operator)
                .and_then(|id| validators.get(id).map(|v| (id, v)))
                .ok_or_else(|| malformed(&format!("{path}.validator_address"), format!("unknown validator {operator}")))?;
            let tokens = validator
                .tokens_from_shares(&shares)
                .ok_or_else(|| malformed(&format!("{path}.shares"), "share conversion overflow or zero total shares"))?;
            if shares_index
                .get_or_insert_with(operator.to_string(), OrderedMap::new)
                .insert(delegator.to_string(), shares)
                .is_some()
            {
                return Err(duplicate("app_state.staking.delegations", &format!("{delegator}/{operator}")));
            }
            if tokens == 0 {
                debug!(delegator = %delegator, validator = %operator, "Delegation below one token, skipping");
                continue;
            }

            delegations.push(Delegation {
                delegator: delegator.to_string(),
                validator_id: validator_id.clone(),
                validator_operator: operator.to_string(),
                tokens,
            });
        }
        Ok((delegations, shares_index))
    }

    fn index_unbonding(&self, app_state: &Value) -> SnapshotResult<Vec<UnbondingEntry>> {
        let staking = require(app_state, "app_state", "staking")?;
        let mut entries = Vec::new();

        for (i, record) in optional_array(staking, "app_state.staking", "unbonding_delegations")?
            .iter()
            .enumerate()
        {
            let path = format!("app_state.staking.unbonding_delegations[{i}]");
            let delegator = require_str(record, &path, "delegator_address")?;
            codec::decode(delegator, &self.prefix)?;
            let operator = require_str(record, &path, "validator_address")?;

            for (j, entry) in require_array(record, &path, "entries")?.iter().enumerate() {
                let entry_path = format!("{path}.entries[{j}]");
                entries.push(UnbondingEntry {
                    delegator: delegator.to_string(),
                    validator_operator: operator.to_string(),
                    balance: require_amount(entry, &entry_path, "balance")?,
                    initial_balance: require_amount(entry, &entry_path, "initial_balance")?,
                    creation_height: parse_u64(require(entry, &entry_path, "creation_height")?)
                        .ok_or_else(|| malformed(&format!("{entry_path}.creation_height"), "expected an unsigned integer"))?,
                    completion_time: require_str(entry, &entry_path, "completion_time")?.to_string(),
                });
            }
        }
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Distribution
    // -------------------------------------------------------------------------

    /// Parse the distribution records. Every list is optional.
    fn index_distribution(&self, app_state: &Value) -> SnapshotResult<DistributionState> {
        let mut state = DistributionState::default();
        let Some(distribution) = app_state.get("distribution") else {
            return Ok(state);
        };
        let section = "app_state.distribution";

        if let Some(fee_pool) = distribution.get("fee_pool") {
            state.community_pool = optional_dec_coins(fee_pool, &format!("{section}.fee_pool"), "community_pool")?;
        }

        for (i, entry) in optional_array(distribution, section, "outstanding_rewards")?.iter().enumerate() {
            let path = format!("{section}.outstanding_rewards[{i}]");
            let operator = self.operator(entry, &path)?;
            let rewards = optional_dec_coins(entry, &path, "outstanding_rewards")?;
            if state.outstanding_rewards.insert(operator.clone(), rewards).is_some() {
                return Err(duplicate(&format!("{section}.outstanding_rewards"), &operator));
            }
        }

        for (i, entry) in optional_array(distribution, section, "validator_accumulated_commissions")?
            .iter()
            .enumerate()
        {
            let path = format!("{section}.validator_accumulated_commissions[{i}]");
            let operator = self.operator(entry, &path)?;
            let accumulated = require(entry, &path, "accumulated")?;
            let commission = optional_dec_coins(accumulated, &format!("{path}.accumulated"), "commission")?;
            if state.accumulated_commissions.insert(operator.clone(), commission).is_some() {
                return Err(duplicate(&format!("{section}.validator_accumulated_commissions"), &operator));
            }
        }

        for (i, entry) in optional_array(distribution, section, "validator_current_rewards")?
            .iter()
            .enumerate()
        {
            let path = format!("{section}.validator_current_rewards[{i}]");
            let operator = self.operator(entry, &path)?;
            let rewards_path = format!("{path}.rewards");
            let rewards = require(entry, &path, "rewards")?;
            let current = ValidatorCurrentRewards {
                period: require_u64(rewards, &rewards_path, "period")?,
                rewards: optional_dec_coins(rewards, &rewards_path, "rewards")?,
            };
            if state.current_rewards.insert(operator.clone(), current).is_some() {
                return Err(duplicate(&format!("{section}.validator_current_rewards"), &operator));
            }
        }

        for (i, entry) in optional_array(distribution, section, "validator_historical_rewards")?
            .iter()
            .enumerate()
        {
            let path = format!("{section}.validator_historical_rewards[{i}]");
            let operator = self.operator(entry, &path)?;
            let period = require_u64(entry, &path, "period")?;
            let rewards = require(entry, &path, "rewards")?;
            let ratio = optional_dec_coins(rewards, &format!("{path}.rewards"), "cumulative_reward_ratio")?;
            let history = state.historical_rewards.get_or_insert_with(operator.clone(), Default::default);
            if history.insert(period, ratio).is_some() {
                return Err(duplicate(
                    &format!("{section}.validator_historical_rewards"),
                    &format!("{operator}/{period}"),
                ));
            }
        }

        for (i, entry) in optional_array(distribution, section, "delegator_starting_infos")?
            .iter()
            .enumerate()
        {
            let path = format!("{section}.delegator_starting_infos[{i}]");
            let operator = self.operator(entry, &path)?;
            let delegator = require_str(entry, &path, "delegator_address")?;
            codec::decode(delegator, &self.prefix)?;
            let info_path = format!("{path}.starting_info");
            let info = require(entry, &path, "starting_info")?;
            let starting = DelegatorStartingInfo {
                previous_period: require_u64(info, &info_path, "previous_period")?,
                height: require_u64(info, &info_path, "height")?,
                stake: parse_dec(info, &info_path, "stake")?,
            };
            if state
                .starting_infos
                .get_or_insert_with(operator.clone(), OrderedMap::new)
                .insert(delegator.to_string(), starting)
                .is_some()
            {
                return Err(duplicate(
                    &format!("{section}.delegator_starting_infos"),
                    &format!("{delegator}/{operator}"),
                ));
            }
        }

        for (i, entry) in optional_array(distribution, section, "validator_slash_events")?
            .iter()
            .enumerate()
        {
            let path = format!("{section}.validator_slash_events[{i}]");
            let operator = self.operator(entry, &path)?;
            let height = require_u64(entry, &path, "height")?;
            let period = require_u64(entry, &path, "period")?;
            let event_path = format!("{path}.validator_slash_event");
            let event = require(entry, &path, "validator_slash_event")?;
            let slash = ValidatorSlashEvent {
                validator_period: require_u64(event, &event_path, "validator_period")?,
                fraction: parse_dec(event, &event_path, "fraction")?,
            };
            if slash.validator_period != period {
                return Err(SnapshotError::InvalidDistribution(format!(
                    "slash event of {operator} at height {height} records period {period} but validator period {}",
                    slash.validator_period
                )));
            }
            let events = state.slash_events.get_or_insert_with(operator.clone(), Default::default);
            if events.insert(height, slash).is_some() {
                return Err(duplicate(
                    &format!("{section}.validator_slash_events"),
                    &format!("{operator}/{height}"),
                ));
            }
        }

        for (i, entry) in optional_array(distribution, section, "delegator_withdraw_infos")?
            .iter()
            .enumerate()
        {
            let path = format!("{section}.delegator_withdraw_infos[{i}]");
            let delegator = require_str(entry, &path, "delegator_address")?;
            let withdraw = require_str(entry, &path, "withdraw_address")?;
            codec::decode(delegator, &self.prefix)?;
            codec::decode(withdraw, &self.prefix)?;
            state
                .withdraw_addresses
                .insert(delegator.to_string(), withdraw.to_string());
        }

        debug!(
            validators = state.outstanding_rewards.len(),
            starting_infos = state.starting_infos.values().map(OrderedMap::len).sum::<usize>(),
            "Distribution indexed"
        );
        Ok(state)
    }

    /// Validator operator address at `validator_address`.
    fn operator(&self, entry: &Value, path: &str) -> SnapshotResult<String> {
        let operator = require_str(entry, path, "validator_address")?;
        codec::decode(operator, &self.valoper_prefix)?;
        Ok(operator.to_string())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn duplicate(section: &str, key: &str) -> SnapshotError {
    SnapshotError::DuplicateEntry {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn parse_dec(value: &Value, path: &str, key: &str) -> SnapshotResult<Dec> {
    require_str(value, path, key)?
        .parse()
        .map_err(|e: crate::models::ParseDecError| malformed(&format!("{path}.{key}"), e.to_string()))
}

fn require_u64(value: &Value, path: &str, key: &str) -> SnapshotResult<u64> {
    parse_u64(require(value, path, key)?)
        .ok_or_else(|| malformed(&format!("{path}.{key}"), "expected an unsigned integer"))
}

/// Decimal coin list at `key`; missing or null reads as empty.
fn optional_dec_coins(value: &Value, path: &str, key: &str) -> SnapshotResult<DecCoins> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(DecCoins::new()),
        Some(coins) => DecCoins::from_json(coins, &format!("{path}.{key}")),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::*;
    use serde_json::json;

    fn indexer() -> SnapshotIndexer {
        SnapshotIndexer::new(&config())
    }

    #[test]
    fn test_index_basic_snapshot() {
        let genesis = GenesisBuilder::new()
            .base_account(&src_addr(1))
            .balance(&src_addr(1), BOND_DENOM, 100)
            .build();

        let snapshot = indexer().index(&genesis).unwrap();

        assert_eq!(snapshot.chain_id, "cudos-1");
        assert_eq!(snapshot.initial_height, 12345);
        assert_eq!(snapshot.bond_denom, BOND_DENOM);
        assert_eq!(snapshot.total_supply, Coins::single(BOND_DENOM, 100));
        let account = snapshot.accounts.get(&src_addr(1)).unwrap();
        assert_eq!(account.balance, Coins::single(BOND_DENOM, 100));
        assert_eq!(account.classification, AccountClassification::Base);
        assert_eq!(snapshot.bonded_pool, module_addr(BONDED_POOL));
        assert_eq!(snapshot.not_bonded_pool, module_addr(NOT_BONDED_POOL));
    }

    #[test]
    fn test_classification_precedence() {
        let contract = src_addr(2);
        let escrow = codec::escrow_address(SRC, "transfer", "channel-0").unwrap();
        let genesis = GenesisBuilder::new()
            .base_account(&contract)
            .base_account(&escrow)
            .module_account("gravity")
            .contract(&contract, &src_addr(1), &src_addr(1))
            .channel("transfer", "channel-0")
            .build();

        let snapshot = indexer().index(&genesis).unwrap();

        assert_eq!(
            snapshot.accounts.get(&contract).unwrap().classification,
            AccountClassification::Contract
        );
        assert_eq!(
            snapshot.accounts.get(&escrow).unwrap().classification,
            AccountClassification::IbcEscrow {
                channel_id: "channel-0".into(),
                port_id: "transfer".into()
            }
        );
        assert_eq!(snapshot.gravity_module, Some(module_addr("gravity")));
        assert!(snapshot.distribution_module.is_none());
    }

    #[test]
    fn test_escrow_without_records_is_indexed() {
        let genesis = GenesisBuilder::new().channel("transfer", "channel-7").build();
        let snapshot = indexer().index(&genesis).unwrap();
        let escrow = codec::escrow_address(SRC, "transfer", "channel-7").unwrap();

        assert!(snapshot.accounts.contains_key(&escrow));
        assert!(snapshot.created_accounts.is_empty());
    }

    #[test]
    fn test_vesting_account_parsed() {
        let genesis = GenesisBuilder::new().vesting_account(&src_addr(3), 500).build();
        let snapshot = indexer().index(&genesis).unwrap();
        let vesting = snapshot.accounts.get(&src_addr(3)).unwrap().vesting.clone().unwrap();

        assert_eq!(vesting.kind, VestingKind::Continuous);
        assert_eq!(vesting.original_vesting, Coins::single(BOND_DENOM, 500));
        assert_eq!(vesting.start_time, Some(1_600_000_000));
        assert_eq!(vesting.end_time, 1_700_000_000);
    }

    #[test]
    fn test_pub_key_decoded() {
        let genesis = GenesisBuilder::new()
            .base_account_with_key(&src_addr(4), secp_key(4))
            .build();
        let snapshot = indexer().index(&genesis).unwrap();
        let account = snapshot.accounts.get(&src_addr(4)).unwrap();

        assert!(matches!(account.pub_key, Some(PubKey::Secp256k1(_))));
        assert_eq!(account.sequence, 3);
    }

    // Unknown key types abort instead of silently dropping the key
    #[test]
    fn test_unknown_key_type_is_fatal() {
        let genesis = GenesisBuilder::new()
            .base_account_with_key(&src_addr(4), json!({"@type": "/foo.Key", "key": "AA=="}))
            .build();
        assert_eq!(
            indexer().index(&genesis).unwrap_err(),
            SnapshotError::UnknownKeyType("/foo.Key".into())
        );
    }

    #[test]
    fn test_unknown_account_type_is_fatal() {
        let genesis = GenesisBuilder::new()
            .raw_account(json!({"@type": "/foo.Account", "address": src_addr(5)}))
            .build();
        assert_eq!(
            indexer().index(&genesis).unwrap_err(),
            SnapshotError::UnknownAccountType("/foo.Account".into())
        );
    }

    #[test]
    fn test_orphan_balance() {
        let convertible = GenesisBuilder::new()
            .balance(&src_addr(6), BOND_DENOM, 10)
            .build();
        assert_eq!(
            indexer().index(&convertible).unwrap_err(),
            SnapshotError::OrphanBalance(src_addr(6))
        );

        // Dust in a denom without a conversion constant is skipped
        let dust = GenesisBuilder::new().balance(&src_addr(6), "ibc/ABC", 10).build();
        let snapshot = indexer().index(&dust).unwrap();
        assert!(!snapshot.accounts.contains_key(&src_addr(6)));
    }

    #[test]
    fn test_contract_balance_without_auth_is_materialised() {
        let contract = src_addr(7);
        let genesis = GenesisBuilder::new()
            .contract(&contract, &src_addr(1), "")
            .balance(&contract, BOND_DENOM, 40)
            .build();
        let snapshot = indexer().index(&genesis).unwrap();

        let account = snapshot.accounts.get(&contract).unwrap();
        assert_eq!(account.classification, AccountClassification::Contract);
        assert_eq!(account.balance, Coins::single(BOND_DENOM, 40));
        assert_eq!(
            snapshot.created_accounts,
            vec![(contract, BALANCE_WITHOUT_AUTH_REASON.to_string())]
        );
    }

    #[test]
    fn test_duplicate_account_rejected() {
        let genesis = GenesisBuilder::new()
            .base_account(&src_addr(1))
            .base_account(&src_addr(1))
            .build();
        assert!(matches!(
            indexer().index(&genesis),
            Err(SnapshotError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_wrong_prefix_rejected() {
        let genesis = GenesisBuilder::new().base_account(&dst_addr(1)).build();
        assert!(matches!(indexer().index(&genesis), Err(SnapshotError::Codec(_))));
    }

    #[test]
    fn test_missing_bond_denom() {
        let mut genesis = GenesisBuilder::new().build();
        genesis["app_state"]["staking"]["params"] = json!({});
        let err = indexer().index(&genesis).unwrap_err();
        assert!(err.to_string().contains("bond_denom"));
    }

    #[test]
    fn test_delegation_shares_truncate() {
        let genesis = GenesisBuilder::new()
            .validator(&src_valoper(1), 9, 1000, "1000.0", "BOND_STATUS_BONDED")
            .delegation(&src_addr(1), &src_valoper(1), "250.0")
            .delegation(&src_addr(2), &src_valoper(1), "333.33")
            .delegation(&src_addr(3), &src_valoper(1), "0.5")
            .build();
        let snapshot = indexer().index(&genesis).unwrap();

        let tokens: Vec<u128> = snapshot.delegations.iter().map(|d| d.tokens).collect();
        assert_eq!(tokens, vec![250, 333]);
        let validator = snapshot.validator_by_operator(&src_valoper(1)).unwrap();
        assert!(validator.status.is_bonded());
        assert_eq!(snapshot.delegations[0].validator_id, validator.consensus_pubkey.id());
    }

    #[test]
    fn test_delegation_to_unknown_validator() {
        let genesis = GenesisBuilder::new()
            .delegation(&src_addr(1), &src_valoper(9), "1.0")
            .build();
        let err = indexer().index(&genesis).unwrap_err();
        assert!(err.to_string().contains("unknown validator"));
    }

    #[test]
    fn test_unbonding_and_community_pool() {
        let genesis = GenesisBuilder::new()
            .unbonding(&src_addr(1), &src_valoper(1), 70)
            .community_pool(BOND_DENOM, "12.999")
            .build();
        let snapshot = indexer().index(&genesis).unwrap();

        assert_eq!(snapshot.unbonding.len(), 1);
        assert_eq!(snapshot.unbonding[0].balance, 70);
        assert_eq!(snapshot.unbonding[0].creation_height, 100);
        assert_eq!(
            snapshot.distribution.community_pool,
            DecCoins::single(BOND_DENOM, "12.999".parse().unwrap())
        );
    }

    fn rewarded_genesis() -> GenesisBuilder {
        let op = src_valoper(1);
        GenesisBuilder::new()
            .validator(&op, 9, 1000, "1000.0", "BOND_STATUS_BONDED")
            .delegation(&src_addr(1), &op, "400.0")
            .delegation(&src_addr(2), &op, "600.0")
            .historical_rewards(&op, 0, BOND_DENOM, "0")
            .current_rewards(&op, 1, BOND_DENOM, "50.5")
            .outstanding_rewards(&op, BOND_DENOM, "60.5")
            .commission(&op, BOND_DENOM, "10")
            .starting_info(&src_addr(1), &op, 0, 5, "400.0")
            .starting_info(&src_addr(2), &op, 0, 5, "600.0")
            .withdraw_address(&src_addr(2), &src_addr(7))
    }

    #[test]
    fn test_distribution_rewards_recomputed() {
        let snapshot = indexer().index(&rewarded_genesis().build()).unwrap();
        let distribution = &snapshot.distribution;
        let op = src_valoper(1);
        let reward = |delegator: &str| distribution.delegator_reward(delegator, &op);

        // 50.5 over 1000 tokens is 0.0505 per token
        assert_eq!(reward(&src_addr(1)), DecCoins::single(BOND_DENOM, "20.2".parse().unwrap()));
        assert_eq!(reward(&src_addr(2)), DecCoins::single(BOND_DENOM, "30.3".parse().unwrap()));
        assert_eq!(
            distribution.validator_rewards.get(&op),
            Some(&DecCoins::single(BOND_DENOM, "10".parse().unwrap()))
        );
        assert_eq!(
            distribution.accumulated_commissions.get(&op),
            Some(&DecCoins::single(BOND_DENOM, "10".parse().unwrap()))
        );
        assert_eq!(distribution.withdraw_address(&src_addr(2)), src_addr(7));
    }

    #[test]
    fn test_slash_event_period_mismatch() {
        let mut genesis = rewarded_genesis()
            .slash_event(&src_valoper(1), 8, 1, "0.1")
            .build();
        genesis["app_state"]["distribution"]["validator_slash_events"][0]["period"] = json!("2");

        let err = indexer().index(&genesis).unwrap_err();
        assert!(matches!(err, SnapshotError::InvalidDistribution(r) if r.contains("validator period 1")));
    }

    #[test]
    fn test_duplicate_starting_info_rejected() {
        let genesis = rewarded_genesis()
            .starting_info(&src_addr(1), &src_valoper(1), 0, 5, "400.0")
            .build();
        assert!(matches!(
            indexer().index(&genesis).unwrap_err(),
            SnapshotError::DuplicateEntry { section, .. } if section.ends_with("delegator_starting_infos")
        ));
    }

    #[test]
    fn test_rewards_for_unknown_validator_rejected() {
        let genesis = GenesisBuilder::new()
            .historical_rewards(&src_valoper(4), 0, BOND_DENOM, "0")
            .current_rewards(&src_valoper(4), 1, BOND_DENOM, "1")
            .outstanding_rewards(&src_valoper(4), BOND_DENOM, "1")
            .starting_info(&src_addr(1), &src_valoper(4), 0, 5, "1.0")
            .build();
        assert!(matches!(
            indexer().index(&genesis).unwrap_err(),
            SnapshotError::InvalidDistribution(r) if r.contains("unknown validator")
        ));
    }

    #[test]
    fn test_missing_bonded_pool() {
        let mut genesis = GenesisBuilder::new().build();
        genesis["app_state"]["auth"]["accounts"] = json!([]);
        assert_eq!(
            indexer().index(&genesis).unwrap_err(),
            SnapshotError::MissingModuleAccount(BONDED_POOL.into())
        );
    }
}
