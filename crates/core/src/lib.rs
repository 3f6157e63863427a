//! Core domain layer of the Confluence genesis merge engine.
//!
//! This crate folds the final state of a retiring source chain into a
//! destination ledger: every source account is classified, every balance is
//! moved under a global conservation check, and the converted result is
//! minted on the destination side. It follows hexagonal architecture
//! principles; nothing here performs file or network I/O.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    confluence (binary)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   confluence-storage                        │
//! │          (MemoryLedger, file loading, manifest I/O)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  confluence-core  ← YOU ARE HERE            │
//! │        (models, ports, codec, services, manifest)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Typed snapshot entities (Account, Coins, Dec, PubKey)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Indexer, resolver, conservation ledger, pipeline
//! - [`codec`] - Bech32 address translation
//! - [`config`] - Network configuration and verification
//! - [`manifest`] - Audit manifest
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::Ledger`] - The destination ledger (accounts, balances, contracts)
//! - [`ports::SignatureScheme`] - Aggregate signing used for manifest attestation
//!
//! ## Merge Lifecycle
//!
//! 1. Verify the [`config::NetworkConfig`]
//! 2. Index the source genesis into a [`services::Snapshot`]
//! 3. Run the [`services::MigrationPipeline`] stages
//! 4. Apply contract mutations and reconciliation
//! 5. Verify and persist the [`manifest::UpgradeManifest`]

pub mod codec;
pub mod config;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
pub mod utils;

#[cfg(test)]
mod fixtures;
