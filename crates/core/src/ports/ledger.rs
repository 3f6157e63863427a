//! Port trait for the destination ledger.
//!
//! The merge engine never touches account storage directly. Every
//! destination-side effect (account creation, minting, transfers, contract
//! metadata and raw contract storage) goes through [`Ledger`].
//! Implementations live in the infrastructure layer (e.g., `confluence-storage`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LedgerResult;
use crate::models::{Coins, PubKey, RawAddress};

/// Account type on the destination ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerAccountKind {
    Base,
    ContinuousVesting {
        original_vesting: Coins,
        start_time: i64,
        end_time: i64,
    },
    Module {
        name: String,
    },
    /// Any other account type the engine does not manage.
    Other {
        type_url: String,
    },
}

/// Account record on the destination ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAccount {
    pub address: RawAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<PubKey>,
    pub account_number: u64,
    pub sequence: u64,
    pub kind: LedgerAccountKind,
}

impl LedgerAccount {
    pub fn is_base(&self) -> bool {
        self.kind == LedgerAccountKind::Base
    }
}

/// Validator as seen on the destination ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerValidator {
    pub operator_address: String,
    pub jailed: bool,
}

/// Contract metadata on the destination ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractMeta {
    #[serde(default)]
    pub admin: String,
    #[serde(default)]
    pub label: String,
}

/// Port trait for the destination ledger.
///
/// All addresses are raw bytes; bech32 encoding is the caller's concern.
#[async_trait]
pub trait Ledger: Send + Sync {
    // -------------------------------------------------------------------------
    // Accounts & balances
    // -------------------------------------------------------------------------

    /// Get an account record.
    async fn account(&self, address: &RawAddress) -> LedgerResult<Option<LedgerAccount>>;

    /// Create or replace an account record.
    async fn set_account(&self, account: LedgerAccount) -> LedgerResult<()>;

    /// Reserve the next free account number.
    async fn next_account_number(&self) -> LedgerResult<u64>;

    /// Get the spendable balance of an address.
    async fn balance(&self, address: &RawAddress) -> LedgerResult<Coins>;

    /// Move coins between two addresses.
    async fn send(&self, from: &RawAddress, to: &RawAddress, amount: &Coins) -> LedgerResult<()>;

    /// Create new supply and credit it to `to`.
    async fn mint(&self, to: &RawAddress, amount: &Coins) -> LedgerResult<()>;

    // -------------------------------------------------------------------------
    // Staking
    // -------------------------------------------------------------------------

    /// Look up a validator by operator address.
    async fn validator(&self, operator_address: &str) -> LedgerResult<Option<LedgerValidator>>;

    // -------------------------------------------------------------------------
    // Contracts
    // -------------------------------------------------------------------------

    /// Get contract metadata.
    async fn contract(&self, address: &RawAddress) -> LedgerResult<Option<ContractMeta>>;

    /// Replace contract metadata. The contract must exist.
    async fn set_contract(&self, address: &RawAddress, meta: ContractMeta) -> LedgerResult<()>;

    /// List every raw storage key of a contract, sorted.
    async fn contract_storage_keys(&self, address: &RawAddress) -> LedgerResult<Vec<Vec<u8>>>;

    /// Read a raw storage value.
    async fn contract_storage_get(
        &self,
        address: &RawAddress,
        key: &[u8],
    ) -> LedgerResult<Option<Vec<u8>>>;

    /// Write a raw storage value.
    async fn contract_storage_set(
        &self,
        address: &RawAddress,
        key: &[u8],
        value: Vec<u8>,
    ) -> LedgerResult<()>;

    /// Delete a raw storage value.
    async fn contract_storage_delete(&self, address: &RawAddress, key: &[u8]) -> LedgerResult<()>;
}
