//! Shared test fixtures: addresses, a sample network config, a genesis
//! document builder, and in-memory port implementations.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::codec;
use crate::config::NetworkConfig;
use crate::error::{LedgerError, LedgerResult, SignatureError, SignatureResult};
use crate::models::{Coins, ED25519_TYPE, RawAddress, SECP256K1_TYPE};
use crate::ports::{ContractMeta, Ledger, LedgerAccount, LedgerValidator, SignatureScheme};

pub const SRC: &str = "cudos";
pub const DST: &str = "fetch";
pub const BOND_DENOM: &str = "acudos";
pub const DEST_DENOM: &str = "afet";

// =============================================================================
// Addresses
// =============================================================================

pub fn raw(n: u8) -> RawAddress {
    RawAddress(vec![n; 20])
}

pub fn src_addr(n: u8) -> String {
    codec::encode(SRC, &[n; 20]).unwrap()
}

pub fn dst_addr(n: u8) -> String {
    codec::encode(DST, &[n; 20]).unwrap()
}

pub fn src_valoper(n: u8) -> String {
    codec::encode("cudosvaloper", &[n; 20]).unwrap()
}

pub fn dst_valoper(n: u8) -> String {
    codec::encode("fetchvaloper", &[n; 20]).unwrap()
}

pub fn module_raw(name: &str) -> RawAddress {
    RawAddress(Sha256::digest(name.as_bytes())[..20].to_vec())
}

pub fn module_addr(name: &str) -> String {
    codec::encode(SRC, module_raw(name).as_bytes()).unwrap()
}

pub fn secp_key(n: u8) -> Value {
    let mut key = vec![n; 33];
    key[0] = 2;
    json!({"@type": SECP256K1_TYPE, "key": STANDARD.encode(key)})
}

// Well-known configured addresses
pub const IBC_TARGET: u8 = 0xA1;
pub const STAKING_REMAINDER: u8 = 0xA2;
pub const GRAVITY_REMAINDER: u8 = 0xA3;
pub const DISTRIBUTION_REMAINDER: u8 = 0xA4;
pub const GENERIC_REMAINDER: u8 = 0xA5;
pub const COLLISION_DEST: u8 = 0xA6;
pub const RECONCILIATION_TARGET: u8 = 0xA7;
pub const BACKUP_VALIDATOR: u8 = 0xB1;
pub const RECONCILIATION_CONTRACT: u8 = 0xC1;
pub const NEW_ADMIN: u8 = 0xC2;
pub const TOKEN_BRIDGE: u8 = 0xC3;
pub const ALMANAC_PROD: u8 = 0xC4;

// =============================================================================
// Config
// =============================================================================

pub fn config_json() -> Value {
    json!({
        "merge_source_chain_id": "cudos-1",
        "destination_chain_id": "fetchhub-4",
        "source_address_prefix": SRC,
        "destination_address_prefix": DST,
        "destination_denom": DEST_DENOM,
        "reconciliation_info": {"target_address": dst_addr(RECONCILIATION_TARGET)},
        "contracts": {
            "reconciliation": {
                "addr": dst_addr(RECONCILIATION_CONTRACT),
                "new_admin": dst_addr(NEW_ADMIN),
                "new_label": "reconciliation-v2",
                "new_contract_version": {
                    "cw_2_version": {"contract": "crates.io:reconciliation", "version": "2.0.0"}
                }
            },
            "token_bridge": {"addr": dst_addr(TOKEN_BRIDGE), "new_admin": dst_addr(NEW_ADMIN)},
            "almanac": {"prod_addr": dst_addr(ALMANAC_PROD), "dev_addr": ""}
        },
        "merge": {
            "ibc_target_addr": src_addr(IBC_TARGET),
            "remaining_staking_balance_addr": src_addr(STAKING_REMAINDER),
            "remaining_gravity_balance_addr": src_addr(GRAVITY_REMAINDER),
            "remaining_distribution_balance_addr": src_addr(DISTRIBUTION_REMAINDER),
            "generic_module_remaining_balance": src_addr(GENERIC_REMAINDER),
            "vesting_collision_dest_addr": dst_addr(COLLISION_DEST),
            "vesting_period": 3600,
            "balance_conversion_constants": [[BOND_DENOM, "10"]],
            "backup_validators": [dst_valoper(BACKUP_VALIDATOR)]
        }
    })
}

pub fn config() -> NetworkConfig {
    serde_json::from_value(config_json()).unwrap()
}

// =============================================================================
// Genesis builder
// =============================================================================

/// Builds a minimal source genesis document.
///
/// The staking pool module accounts are always present.
pub struct GenesisBuilder {
    accounts: Vec<Value>,
    balances: BTreeMap<String, BTreeMap<String, u128>>,
    validators: Vec<Value>,
    delegations: Vec<Value>,
    unbonding: Vec<Value>,
    contracts: Vec<Value>,
    channels: Vec<Value>,
    community_pool: Vec<Value>,
    distribution: BTreeMap<&'static str, Vec<Value>>,
    extra_supply: Vec<(String, u128)>,
}

impl GenesisBuilder {
    pub fn new() -> Self {
        Self {
            accounts: Vec::new(),
            balances: BTreeMap::new(),
            validators: Vec::new(),
            delegations: Vec::new(),
            unbonding: Vec::new(),
            contracts: Vec::new(),
            channels: Vec::new(),
            community_pool: Vec::new(),
            distribution: BTreeMap::new(),
            extra_supply: Vec::new(),
        }
        .module_account("bonded_tokens_pool")
        .module_account("not_bonded_tokens_pool")
    }

    pub fn base_account(mut self, address: &str) -> Self {
        self.accounts.push(json!({
            "@type": "/cosmos.auth.v1beta1.BaseAccount",
            "address": address,
            "pub_key": null,
            "account_number": self.accounts.len().to_string(),
            "sequence": "0"
        }));
        self
    }

    pub fn base_account_with_key(mut self, address: &str, key: Value) -> Self {
        self.accounts.push(json!({
            "@type": "/cosmos.auth.v1beta1.BaseAccount",
            "address": address,
            "pub_key": key,
            "account_number": self.accounts.len().to_string(),
            "sequence": "3"
        }));
        self
    }

    pub fn vesting_account(mut self, address: &str, original_vesting: u128) -> Self {
        self.accounts.push(json!({
            "@type": "/cosmos.vesting.v1beta1.ContinuousVestingAccount",
            "base_vesting_account": {
                "base_account": {
                    "address": address,
                    "pub_key": null,
                    "account_number": self.accounts.len().to_string(),
                    "sequence": "0"
                },
                "original_vesting": [{"denom": BOND_DENOM, "amount": original_vesting.to_string()}],
                "delegated_free": [],
                "delegated_vesting": [],
                "end_time": "1700000000"
            },
            "start_time": "1600000000"
        }));
        self
    }

    pub fn module_account(mut self, name: &str) -> Self {
        self.accounts.push(json!({
            "@type": "/cosmos.auth.v1beta1.ModuleAccount",
            "base_account": {
                "address": module_addr(name),
                "pub_key": null,
                "account_number": self.accounts.len().to_string(),
                "sequence": "0"
            },
            "name": name,
            "permissions": []
        }));
        self
    }

    pub fn raw_account(mut self, account: Value) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn balance(mut self, address: &str, denom: &str, amount: u128) -> Self {
        *self
            .balances
            .entry(address.to_string())
            .or_default()
            .entry(denom.to_string())
            .or_default() += amount;
        self
    }

    pub fn validator(
        mut self,
        operator: &str,
        cons_key_byte: u8,
        tokens: u128,
        shares: &str,
        status: &str,
    ) -> Self {
        self.validators.push(json!({
            "operator_address": operator,
            "consensus_pubkey": {"@type": ED25519_TYPE, "key": STANDARD.encode([cons_key_byte; 32])},
            "jailed": false,
            "status": status,
            "tokens": tokens.to_string(),
            "delegator_shares": shares
        }));
        self
    }

    pub fn delegation(mut self, delegator: &str, operator: &str, shares: &str) -> Self {
        self.delegations.push(json!({
            "delegator_address": delegator,
            "validator_address": operator,
            "shares": shares
        }));
        self
    }

    pub fn unbonding(mut self, delegator: &str, operator: &str, balance: u128) -> Self {
        self.unbonding.push(json!({
            "delegator_address": delegator,
            "validator_address": operator,
            "entries": [{
                "creation_height": "100",
                "completion_time": "2024-01-01T00:00:00Z",
                "initial_balance": balance.to_string(),
                "balance": balance.to_string()
            }]
        }));
        self
    }

    pub fn contract(mut self, address: &str, admin: &str, creator: &str) -> Self {
        self.contracts.push(json!({
            "contract_address": address,
            "contract_info": {"code_id": "1", "creator": creator, "admin": admin, "label": "c"}
        }));
        self
    }

    pub fn channel(mut self, port: &str, channel: &str) -> Self {
        self.channels.push(json!({"port_id": port, "channel_id": channel, "state": "STATE_OPEN"}));
        self
    }

    pub fn community_pool(mut self, denom: &str, amount: &str) -> Self {
        self.community_pool.push(json!({"denom": denom, "amount": amount}));
        self
    }

    fn distribution_record(mut self, section: &'static str, record: Value) -> Self {
        self.distribution.entry(section).or_default().push(record);
        self
    }

    pub fn outstanding_rewards(self, operator: &str, denom: &str, amount: &str) -> Self {
        self.distribution_record(
            "outstanding_rewards",
            json!({
                "validator_address": operator,
                "outstanding_rewards": [{"denom": denom, "amount": amount}]
            }),
        )
    }

    pub fn commission(self, operator: &str, denom: &str, amount: &str) -> Self {
        self.distribution_record(
            "validator_accumulated_commissions",
            json!({
                "validator_address": operator,
                "accumulated": {"commission": [{"denom": denom, "amount": amount}]}
            }),
        )
    }

    pub fn current_rewards(self, operator: &str, period: u64, denom: &str, amount: &str) -> Self {
        self.distribution_record(
            "validator_current_rewards",
            json!({
                "validator_address": operator,
                "rewards": {"rewards": [{"denom": denom, "amount": amount}], "period": period.to_string()}
            }),
        )
    }

    pub fn historical_rewards(self, operator: &str, period: u64, denom: &str, ratio: &str) -> Self {
        self.distribution_record(
            "validator_historical_rewards",
            json!({
                "validator_address": operator,
                "period": period.to_string(),
                "rewards": {
                    "cumulative_reward_ratio": [{"denom": denom, "amount": ratio}],
                    "reference_count": 1
                }
            }),
        )
    }

    pub fn starting_info(
        self,
        delegator: &str,
        operator: &str,
        previous_period: u64,
        height: u64,
        stake: &str,
    ) -> Self {
        self.distribution_record(
            "delegator_starting_infos",
            json!({
                "delegator_address": delegator,
                "validator_address": operator,
                "starting_info": {
                    "previous_period": previous_period.to_string(),
                    "stake": stake,
                    "height": height.to_string()
                }
            }),
        )
    }

    pub fn slash_event(self, operator: &str, height: u64, period: u64, fraction: &str) -> Self {
        self.distribution_record(
            "validator_slash_events",
            json!({
                "validator_address": operator,
                "height": height.to_string(),
                "period": period.to_string(),
                "validator_slash_event": {"validator_period": period.to_string(), "fraction": fraction}
            }),
        )
    }

    pub fn withdraw_address(self, delegator: &str, withdraw: &str) -> Self {
        self.distribution_record(
            "delegator_withdraw_infos",
            json!({"delegator_address": delegator, "withdraw_address": withdraw}),
        )
    }

    /// Supply beyond the sum of balances.
    pub fn extra_supply(mut self, denom: &str, amount: u128) -> Self {
        self.extra_supply.push((denom.to_string(), amount));
        self
    }

    pub fn build(self) -> Value {
        let mut supply: BTreeMap<String, u128> = BTreeMap::new();
        for coins in self.balances.values() {
            for (denom, amount) in coins {
                *supply.entry(denom.clone()).or_default() += amount;
            }
        }
        for (denom, amount) in &self.extra_supply {
            *supply.entry(denom.clone()).or_default() += amount;
        }
        let coins_json = |coins: &BTreeMap<String, u128>| -> Value {
            coins
                .iter()
                .map(|(d, a)| json!({"denom": d, "amount": a.to_string()}))
                .collect()
        };
        let mut distribution = json!({"fee_pool": {"community_pool": self.community_pool}});
        for (section, records) in self.distribution {
            distribution[section] = Value::Array(records);
        }
        let balances: Vec<Value> = self
            .balances
            .iter()
            .map(|(address, coins)| json!({"address": address, "coins": coins_json(coins)}))
            .collect();

        json!({
            "chain_id": "cudos-1",
            "initial_height": "12345",
            "app_state": {
                "auth": {"accounts": self.accounts},
                "bank": {"balances": balances, "supply": coins_json(&supply)},
                "staking": {
                    "params": {"bond_denom": BOND_DENOM},
                    "validators": self.validators,
                    "delegations": self.delegations,
                    "unbonding_delegations": self.unbonding
                },
                "distribution": distribution,
                "wasm": {"contracts": self.contracts},
                "ibc": {"channel_genesis": {"channels": self.channels}}
            }
        })
    }
}

// =============================================================================
// Mock ledger
// =============================================================================

#[derive(Default)]
struct MockState {
    accounts: BTreeMap<RawAddress, LedgerAccount>,
    balances: BTreeMap<RawAddress, Coins>,
    validators: BTreeMap<String, LedgerValidator>,
    contracts: BTreeMap<RawAddress, ContractMeta>,
    storage: BTreeMap<RawAddress, BTreeMap<Vec<u8>, Vec<u8>>>,
    next_account_number: u64,
    minted: Coins,
}

/// Minimal destination ledger for tests.
#[derive(Default)]
pub struct MockLedger {
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new() -> Self {
        let ledger = Self::default();
        ledger.state.lock().unwrap().next_account_number = 1000;
        ledger
    }

    pub fn with_validator(self, operator: &str, jailed: bool) -> Self {
        self.state.lock().unwrap().validators.insert(
            operator.to_string(),
            LedgerValidator {
                operator_address: operator.to_string(),
                jailed,
            },
        );
        self
    }

    pub fn with_account(self, account: LedgerAccount) -> Self {
        self.state.lock().unwrap().accounts.insert(account.address.clone(), account);
        self
    }

    pub fn with_balance(self, address: RawAddress, coins: Coins) -> Self {
        self.state.lock().unwrap().balances.insert(address, coins);
        self
    }

    pub fn with_contract(self, address: RawAddress, meta: ContractMeta) -> Self {
        self.state.lock().unwrap().contracts.insert(address, meta);
        self
    }

    pub fn with_storage(self, address: RawAddress, key: &[u8], value: &[u8]) -> Self {
        self.state
            .lock()
            .unwrap()
            .storage
            .entry(address)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        self
    }

    pub fn balance_of(&self, address: &RawAddress) -> Coins {
        self.state.lock().unwrap().balances.get(address).cloned().unwrap_or_default()
    }

    pub fn account_of(&self, address: &RawAddress) -> Option<LedgerAccount> {
        self.state.lock().unwrap().accounts.get(address).cloned()
    }

    pub fn storage_of(&self, address: &RawAddress) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.state.lock().unwrap().storage.get(address).cloned().unwrap_or_default()
    }

    pub fn total_minted(&self) -> Coins {
        self.state.lock().unwrap().minted.clone()
    }
}

#[async_trait]
impl Ledger for MockLedger {
    async fn account(&self, address: &RawAddress) -> LedgerResult<Option<LedgerAccount>> {
        Ok(self.state.lock().unwrap().accounts.get(address).cloned())
    }

    async fn set_account(&self, account: LedgerAccount) -> LedgerResult<()> {
        self.state.lock().unwrap().accounts.insert(account.address.clone(), account);
        Ok(())
    }

    async fn next_account_number(&self) -> LedgerResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.next_account_number += 1;
        Ok(state.next_account_number - 1)
    }

    async fn balance(&self, address: &RawAddress) -> LedgerResult<Coins> {
        Ok(self.balance_of(address))
    }

    async fn send(&self, from: &RawAddress, to: &RawAddress, amount: &Coins) -> LedgerResult<()> {
        let mut state = self.state.lock().unwrap();
        let from_balance = state.balances.get(from).cloned().unwrap_or_default();
        let rest = from_balance
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InsufficientFunds {
                address: from.to_hex(),
                needed: amount.to_string(),
            })?;
        state.balances.insert(from.clone(), rest);
        let to_balance = state.balances.get(to).cloned().unwrap_or_default();
        let credited = to_balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Backend("overflow".into()))?;
        state.balances.insert(to.clone(), credited);
        Ok(())
    }

    async fn mint(&self, to: &RawAddress, amount: &Coins) -> LedgerResult<()> {
        let mut state = self.state.lock().unwrap();
        let balance = state.balances.get(to).cloned().unwrap_or_default();
        state.balances.insert(to.clone(), balance.checked_add(amount).unwrap());
        state.minted = state.minted.checked_add(amount).unwrap();
        Ok(())
    }

    async fn validator(&self, operator_address: &str) -> LedgerResult<Option<LedgerValidator>> {
        Ok(self.state.lock().unwrap().validators.get(operator_address).cloned())
    }

    async fn contract(&self, address: &RawAddress) -> LedgerResult<Option<ContractMeta>> {
        Ok(self.state.lock().unwrap().contracts.get(address).cloned())
    }

    async fn set_contract(&self, address: &RawAddress, meta: ContractMeta) -> LedgerResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.contracts.get_mut(address) {
            Some(existing) => {
                *existing = meta;
                Ok(())
            }
            None => Err(LedgerError::ContractNotFound(address.to_hex())),
        }
    }

    async fn contract_storage_keys(&self, address: &RawAddress) -> LedgerResult<Vec<Vec<u8>>> {
        Ok(self.storage_of(address).into_keys().collect())
    }

    async fn contract_storage_get(
        &self,
        address: &RawAddress,
        key: &[u8],
    ) -> LedgerResult<Option<Vec<u8>>> {
        Ok(self.storage_of(address).get(key).cloned())
    }

    async fn contract_storage_set(
        &self,
        address: &RawAddress,
        key: &[u8],
        value: Vec<u8>,
    ) -> LedgerResult<()> {
        self.state
            .lock()
            .unwrap()
            .storage
            .entry(address.clone())
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    async fn contract_storage_delete(&self, address: &RawAddress, key: &[u8]) -> LedgerResult<()> {
        if let Some(store) = self.state.lock().unwrap().storage.get_mut(address) {
            store.remove(key);
        }
        Ok(())
    }
}

// =============================================================================
// Mock signature scheme
// =============================================================================

/// Toy scheme: a signature is `sha256(sk || msg)`, the public key is the
/// secret key, and aggregation concatenates. Only for exercising the port.
pub struct MockScheme;

impl MockScheme {
    fn tag(key: &[u8], message: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(message);
        hasher.finalize().to_vec()
    }
}

impl SignatureScheme for MockScheme {
    fn public_key(&self, secret_key: &[u8]) -> SignatureResult<Vec<u8>> {
        if secret_key.len() != 32 {
            return Err(SignatureError::InvalidKey("expected 32 bytes".into()));
        }
        Ok(secret_key.to_vec())
    }

    fn sign(&self, secret_key: &[u8], message: &[u8]) -> SignatureResult<Vec<u8>> {
        Ok(Self::tag(secret_key, message))
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> SignatureResult<bool> {
        if public_key.len() % 32 != 0 || public_key.len() != signature.len() {
            return Ok(false);
        }
        Ok(public_key
            .chunks(32)
            .zip(signature.chunks(32))
            .all(|(pk, sig)| Self::tag(pk, message) == sig))
    }

    fn aggregate_signatures(&self, signatures: &[Vec<u8>]) -> SignatureResult<Vec<u8>> {
        if signatures.is_empty() {
            return Err(SignatureError::EmptyAggregate);
        }
        Ok(signatures.concat())
    }

    fn aggregate_public_keys(&self, public_keys: &[Vec<u8>]) -> SignatureResult<Vec<u8>> {
        if public_keys.is_empty() {
            return Err(SignatureError::EmptyAggregate);
        }
        Ok(public_keys.concat())
    }
}
