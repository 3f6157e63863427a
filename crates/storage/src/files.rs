//! File inputs and outputs of a merge run.
//!
//! - Genesis snapshot and network config, each hashed and optionally checked
//!   against an expected SHA-256 before parsing
//! - Reconciliation CSV (`[eth_address, _, address, ...]`, no header)
//! - Audit manifest persistence next to the upgrade-info file

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, instrument};

use confluence_core::config::{NetworkConfig, verify_sha256};
use confluence_core::manifest::UpgradeManifest;
use confluence_core::services::ReconciliationRow;

use crate::error::{StorageError, StorageResult};

/// Base name of the manifest file.
pub const MANIFEST_FILENAME: &str = "upgrade_manifest.json";

/// A parsed input together with the digest of its raw bytes.
#[derive(Debug, Clone)]
pub struct LoadedFile<T> {
    pub value: T,
    /// Hex SHA-256 of the file content.
    pub sha256: String,
}

async fn read(path: &Path) -> StorageResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| StorageError::io(path, e))
}

/// Load and hash-check the network config.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn load_config(path: &Path, expected_sha256: Option<&str>) -> StorageResult<LoadedFile<NetworkConfig>> {
    let bytes = read(path).await?;
    let sha256 = verify_sha256(&path.display().to_string(), &bytes, expected_sha256)?;
    let value = NetworkConfig::from_json(&bytes)?;
    debug!(sha256 = %sha256, verified = expected_sha256.is_some(), "Config loaded");
    Ok(LoadedFile { value, sha256 })
}

/// Load and hash-check the source genesis document.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn load_genesis(path: &Path, expected_sha256: Option<&str>) -> StorageResult<LoadedFile<Value>> {
    let bytes = read(path).await?;
    let sha256 = verify_sha256(&path.display().to_string(), &bytes, expected_sha256)?;
    let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::json(path, e))?;
    info!(bytes = bytes.len(), sha256 = %sha256, "📄 Genesis loaded");
    Ok(LoadedFile { value, sha256 })
}

/// Read every row of the reconciliation CSV.
pub async fn read_reconciliation_csv(path: &Path) -> StorageResult<Vec<ReconciliationRow>> {
    let bytes = read(path).await?;
    parse_reconciliation_csv(path, &bytes)
}

fn parse_reconciliation_csv(path: &Path, bytes: &[u8]) -> StorageResult<Vec<ReconciliationRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| StorageError::Csv {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let fields: Vec<&str> = record.iter().collect();
        rows.push(ReconciliationRow::from_record(index, &fields)?);
    }
    debug!(rows = rows.len(), "Reconciliation CSV parsed");
    Ok(rows)
}

/// Manifest location: the upgrade-info file's directory, optionally with a
/// `<label>_` prefix on the file name.
pub fn manifest_path(upgrade_info: &Path, label: Option<&str>) -> PathBuf {
    let dir = upgrade_info.parent().unwrap_or_else(|| Path::new("."));
    match label.filter(|l| !l.is_empty()) {
        Some(label) => dir.join(format!("{label}_{MANIFEST_FILENAME}")),
        None => dir.join(MANIFEST_FILENAME),
    }
}

/// Write the manifest as tab-indented JSON.
#[instrument(skip_all, fields(path = %path.display()))]
pub async fn save_manifest(manifest: &UpgradeManifest, path: &Path) -> StorageResult<()> {
    let bytes = manifest.to_pretty_json()?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    info!("💾 Manifest saved");
    Ok(())
}

pub async fn load_manifest(path: &Path) -> StorageResult<UpgradeManifest> {
    let bytes = read(path).await?;
    Ok(UpgradeManifest::from_json(&bytes)?)
}
