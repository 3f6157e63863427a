//! Storage layer for the Confluence merge engine.
//!
//! This crate provides the adapters around `confluence-core`: an in-memory
//! implementation of the [`confluence_core::ports::Ledger`] port and the
//! file I/O of a merge run.
//!
//! # Architecture
//!
//! - [`MemoryLedger`] - Destination ledger state, loadable from and savable
//!   to JSON
//! - [`files`] - Genesis/config loading with SHA-256 checks, reconciliation
//!   CSV reading, manifest persistence
//!
//! # Usage
//!
//! ```ignore
//! let config = files::load_config(&config_path, expected_sha).await?;
//! let ledger = Arc::new(MemoryLedger::load(&state_path).await?);
//!
//! // ... run the merge ...
//!
//! files::save_manifest(&manifest, &files::manifest_path(&upgrade_info, label)).await?;
//! ledger.save(&state_out).await?;
//! ```

pub mod error;
pub mod files;
pub mod memory;

pub use error::{StorageError, StorageResult};
pub use files::{LoadedFile, manifest_path};
pub use memory::{LedgerState, MemoryLedger};
