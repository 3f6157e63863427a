//! Contract mutations applied to the destination ledger after the merge.
//!
//! Order: state wipe, admin update, label update, CW2 version update. Each
//! change is recorded in the manifest `contracts` section. A configured
//! contract that does not exist on the ledger aborts the run.

use tracing::{debug, info, instrument};

use crate::codec;
use crate::config::{ContractSet, ContractVersion};
use crate::error::{LedgerError, MergeError, MergeResult};
use crate::manifest::{ContractValueUpdate, ContractVersionUpdate, Cw2Version, UpgradeManifest};
use crate::metrics::StageTimer;
use crate::models::RawAddress;
use crate::ports::{ContractMeta, Ledger};

/// Raw storage key of the CW2 version record.
pub const CW2_CONTRACT_INFO_KEY: &[u8] = b"contract_info";

#[derive(Debug, Clone, Copy)]
enum MetaField {
    Admin,
    Label,
}

impl MetaField {
    fn slot(self, meta: &mut ContractMeta) -> &mut String {
        match self {
            Self::Admin => &mut meta.admin,
            Self::Label => &mut meta.label,
        }
    }
}

/// Applies the configured [`ContractSet`] changes.
pub struct ContractMutator<'a, L: Ledger> {
    ledger: &'a L,
    contracts: &'a ContractSet,
    prefix: &'a str,
}

impl<'a, L: Ledger> ContractMutator<'a, L> {
    /// `prefix` is the destination address prefix.
    pub fn new(ledger: &'a L, contracts: &'a ContractSet, prefix: &'a str) -> Self {
        Self {
            ledger,
            contracts,
            prefix,
        }
    }

    #[instrument(skip_all)]
    pub async fn apply(&self, manifest: &mut UpgradeManifest) -> MergeResult<()> {
        let _timer = StageTimer::new("contracts_mutations");
        let set = self.contracts;

        // State wipe
        let mut wiped: Vec<&str> = Vec::new();
        if let Some(c) = &set.reconciliation {
            wiped.push(&c.addr);
        }
        for c in [&set.almanac, &set.a_name].into_iter().flatten() {
            wiped.extend(c.addresses());
        }
        for address in wiped {
            self.wipe_state(address).await?;
            manifest.contracts_mut().contracts_state_cleaned.push(address.to_string());
        }

        // Admin
        let admin_updates = [
            set.reconciliation.as_ref().map(|c| (&c.addr, &c.new_admin)),
            set.token_bridge.as_ref().map(|c| (&c.addr, &c.new_admin)),
        ];
        for (address, new_admin) in admin_updates.into_iter().flatten() {
            if let Some(new_admin) = new_admin {
                let update = self.update_meta(address, MetaField::Admin, new_admin).await?;
                manifest.contracts_mut().contracts_admin_updated.push(update);
            }
        }

        // Label
        if let Some(c) = &set.reconciliation
            && let Some(label) = &c.new_label
        {
            let update = self.update_meta(&c.addr, MetaField::Label, label).await?;
            manifest.contracts_mut().contracts_label_updated.push(update);
        }

        // Version
        if let Some(c) = &set.reconciliation
            && let Some(version) = &c.new_contract_version
        {
            let update = self.update_version(&c.addr, version).await?;
            manifest.contracts_mut().contracts_version_updated.push(update);
        }

        if let Some(mutations) = &manifest.contracts {
            info!(
                cleaned = mutations.contracts_state_cleaned.len(),
                admins = mutations.contracts_admin_updated.len(),
                labels = mutations.contracts_label_updated.len(),
                versions = mutations.contracts_version_updated.len(),
                "📝 Contracts updated"
            );
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn existing(&self, address: &str) -> MergeResult<(RawAddress, ContractMeta)> {
        let raw = codec::decode(address, self.prefix)?;
        let meta = self
            .ledger
            .contract(&raw)
            .await?
            .ok_or_else(|| LedgerError::ContractNotFound(address.to_string()))?;
        Ok((raw, meta))
    }

    async fn wipe_state(&self, address: &str) -> MergeResult<()> {
        let (raw, _) = self.existing(address).await?;
        let keys = self.ledger.contract_storage_keys(&raw).await?;
        for key in &keys {
            self.ledger.contract_storage_delete(&raw, key).await?;
        }
        debug!(contract = %address, keys = keys.len(), "Contract state wiped");
        Ok(())
    }

    async fn update_meta(
        &self,
        address: &str,
        field: MetaField,
        value: &str,
    ) -> MergeResult<ContractValueUpdate> {
        let (raw, mut meta) = self.existing(address).await?;
        let from = std::mem::replace(field.slot(&mut meta), value.to_string());
        self.ledger.set_contract(&raw, meta).await?;
        Ok(ContractValueUpdate {
            address: address.to_string(),
            from,
            to: value.to_string(),
        })
    }

    async fn update_version(
        &self,
        address: &str,
        version: &ContractVersion,
    ) -> MergeResult<ContractVersionUpdate> {
        let (raw, _) = self.existing(address).await?;
        let previous = self
            .ledger
            .contract_storage_get(&raw, CW2_CONTRACT_INFO_KEY)
            .await?
            .map(|bytes| serde_json::from_slice::<Cw2Version>(&bytes))
            .transpose()
            .map_err(|e| MergeError::Serialization(format!("contract_info of {address}: {e}")))?;

        match &version.cw_2_version {
            Some(next) => {
                let bytes = serde_json::to_vec(next).map_err(|e| MergeError::Serialization(e.to_string()))?;
                self.ledger
                    .contract_storage_set(&raw, CW2_CONTRACT_INFO_KEY, bytes)
                    .await?;
            }
            None => {
                self.ledger
                    .contract_storage_delete(&raw, CW2_CONTRACT_INFO_KEY)
                    .await?;
            }
        }

        Ok(ContractVersionUpdate {
            address: address.to_string(),
            from: previous,
            to: version.cw_2_version.clone(),
        })
    }
}
