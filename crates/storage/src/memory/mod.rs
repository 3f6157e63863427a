//! In-memory destination ledger.
//!
//! [`MemoryLedger`] implements the [`Ledger`] port over a single
//! `RwLock`-guarded state. The state can be seeded from and written back to
//! a JSON file, which is how the CLI performs a dry run against a
//! destination snapshot.
//!
//! # State file
//!
//! ```json
//! {
//!   "accounts": { "<hex>": { "address": "<hex>", "account_number": 7, ... } },
//!   "balances": { "<hex>": [{ "denom": "afet", "amount": "100" }] },
//!   "validators": { "fetchvaloper1...": { "operator_address": "...", "jailed": false } },
//!   "contracts": { "<hex>": { "admin": "...", "label": "..." } },
//!   "contract_storage": { "<hex>": { "<hex key>": "<hex value>" } },
//!   "next_account_number": 1000,
//!   "supply": [{ "denom": "afet", "amount": "100" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use confluence_core::error::{LedgerError, LedgerResult};
use confluence_core::models::{Coins, RawAddress};
use confluence_core::ports::{ContractMeta, Ledger, LedgerAccount, LedgerValidator};

use crate::error::{StorageError, StorageResult};

type ContractStorage = BTreeMap<Vec<u8>, Vec<u8>>;

/// Serializable ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    pub accounts: BTreeMap<RawAddress, LedgerAccount>,
    #[serde(default)]
    pub balances: BTreeMap<RawAddress, Coins>,
    #[serde(default)]
    pub validators: BTreeMap<String, LedgerValidator>,
    #[serde(default)]
    pub contracts: BTreeMap<RawAddress, ContractMeta>,
    #[serde(default, with = "hex_storage")]
    pub contract_storage: BTreeMap<RawAddress, ContractStorage>,
    #[serde(default)]
    pub next_account_number: u64,
    /// Total created through [`Ledger::mint`].
    #[serde(default)]
    pub supply: Coins,
}

/// In-memory [`Ledger`] implementation.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LedgerState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Load the state from a JSON file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> StorageResult<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        let state: LedgerState = serde_json::from_slice(&bytes).map_err(|e| StorageError::json(path, e))?;
        debug!(
            accounts = state.accounts.len(),
            validators = state.validators.len(),
            contracts = state.contracts.len(),
            "Destination state loaded"
        );
        Ok(Self::from_state(state))
    }

    /// Write the current state to a JSON file.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn save(&self, path: &Path) -> StorageResult<()> {
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state).map_err(|e| StorageError::json(path, e))?
        };
        tokio::fs::write(path, bytes)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        debug!("Destination state saved");
        Ok(())
    }

    /// Clone of the current state.
    pub async fn snapshot(&self) -> LedgerState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn account(&self, address: &RawAddress) -> LedgerResult<Option<LedgerAccount>> {
        Ok(self.state.read().await.accounts.get(address).cloned())
    }

    async fn set_account(&self, account: LedgerAccount) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        if account.account_number >= state.next_account_number {
            state.next_account_number = account.account_number + 1;
        }
        state.accounts.insert(account.address.clone(), account);
        Ok(())
    }

    async fn next_account_number(&self) -> LedgerResult<u64> {
        let mut state = self.state.write().await;
        let number = state.next_account_number;
        state.next_account_number = number
            .checked_add(1)
            .ok_or_else(|| LedgerError::Backend("account number overflow".into()))?;
        Ok(number)
    }

    async fn balance(&self, address: &RawAddress) -> LedgerResult<Coins> {
        Ok(self
            .state
            .read()
            .await
            .balances
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn send(&self, from: &RawAddress, to: &RawAddress, amount: &Coins) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let from_balance = state.balances.get(from).cloned().unwrap_or_default();
        let rest = from_balance
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::InsufficientFunds {
                address: from.to_hex(),
                needed: amount.to_string(),
            })?;
        let to_balance = if from == to {
            rest.clone()
        } else {
            state.balances.get(to).cloned().unwrap_or_default()
        };
        let credited = to_balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Backend(format!("balance overflow on {}", to.to_hex())))?;

        set_or_remove(&mut state.balances, from.clone(), rest);
        set_or_remove(&mut state.balances, to.clone(), credited);
        Ok(())
    }

    async fn mint(&self, to: &RawAddress, amount: &Coins) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let balance = state.balances.get(to).cloned().unwrap_or_default();
        let credited = balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Backend(format!("balance overflow on {}", to.to_hex())))?;
        let supply = state
            .supply
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Backend("supply overflow".into()))?;
        set_or_remove(&mut state.balances, to.clone(), credited);
        state.supply = supply;
        Ok(())
    }

    async fn validator(&self, operator_address: &str) -> LedgerResult<Option<LedgerValidator>> {
        Ok(self.state.read().await.validators.get(operator_address).cloned())
    }

    async fn contract(&self, address: &RawAddress) -> LedgerResult<Option<ContractMeta>> {
        Ok(self.state.read().await.contracts.get(address).cloned())
    }

    async fn set_contract(&self, address: &RawAddress, meta: ContractMeta) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let slot = state
            .contracts
            .get_mut(address)
            .ok_or_else(|| LedgerError::ContractNotFound(address.to_hex()))?;
        *slot = meta;
        Ok(())
    }

    async fn contract_storage_keys(&self, address: &RawAddress) -> LedgerResult<Vec<Vec<u8>>> {
        Ok(self
            .state
            .read()
            .await
            .contract_storage
            .get(address)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn contract_storage_get(
        &self,
        address: &RawAddress,
        key: &[u8],
    ) -> LedgerResult<Option<Vec<u8>>> {
        Ok(self
            .state
            .read()
            .await
            .contract_storage
            .get(address)
            .and_then(|s| s.get(key).cloned()))
    }

    async fn contract_storage_set(
        &self,
        address: &RawAddress,
        key: &[u8],
        value: Vec<u8>,
    ) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        if !state.contracts.contains_key(address) {
            return Err(LedgerError::ContractNotFound(address.to_hex()));
        }
        state
            .contract_storage
            .entry(address.clone())
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    async fn contract_storage_delete(&self, address: &RawAddress, key: &[u8]) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        if let Some(storage) = state.contract_storage.get_mut(address) {
            storage.remove(key);
            if storage.is_empty() {
                state.contract_storage.remove(address);
            }
        }
        Ok(())
    }
}

fn set_or_remove(balances: &mut BTreeMap<RawAddress, Coins>, address: RawAddress, coins: Coins) {
    if coins.is_empty() {
        balances.remove(&address);
    } else {
        balances.insert(address, coins);
    }
}

/// Contract storage as nested hex-keyed JSON maps.
mod hex_storage {
    use std::collections::BTreeMap;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{ContractStorage, RawAddress};

    pub fn serialize<S: Serializer>(
        storage: &BTreeMap<RawAddress, ContractStorage>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&RawAddress, BTreeMap<String, String>> = storage
            .iter()
            .map(|(address, kv)| {
                let kv = kv.iter().map(|(k, v)| (hex::encode(k), hex::encode(v))).collect();
                (address, kv)
            })
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<RawAddress, ContractStorage>, D::Error> {
        let encoded = BTreeMap::<RawAddress, BTreeMap<String, String>>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(address, kv)| {
                let kv = kv
                    .into_iter()
                    .map(|(k, v)| {
                        let key = hex::decode(k).map_err(D::Error::custom)?;
                        let value = hex::decode(v).map_err(D::Error::custom)?;
                        Ok((key, value))
                    })
                    .collect::<Result<ContractStorage, D::Error>>()?;
                Ok((address, kv))
            })
            .collect()
    }
}
