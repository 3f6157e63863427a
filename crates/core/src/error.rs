//! Error types for the merge engine.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`CodecError`] - Address encoding/decoding failures
//! - [`SnapshotError`] - Malformed or inconsistent source snapshot
//! - [`ResolveError`] - Contract ownership resolution failures
//! - [`LedgerError`] - Failures reported by the external ledger
//! - [`ConfigError`] - Invalid network configuration
//! - [`SignatureError`] - Manifest attestation failures
//! - [`MergeError`] - Top-level pipeline errors
//!
//! Every lower-level error converts into [`MergeError`] via `From`, so `?`
//! works across layers. All of them are fatal: the engine never retries.

use thiserror::Error;

// =============================================================================
// Codec Errors
// =============================================================================

/// Address translation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Address decoded fine but carries a different human-readable prefix.
    #[error("Address prefix mismatch: expected {expected}, got {actual}")]
    PrefixMismatch {
        /// Prefix the caller required.
        expected: String,
        /// Prefix found in the address.
        actual: String,
    },

    /// Address is not valid bech32 or is not in canonical form.
    #[error("Failed to decode address {address}: {reason}")]
    DecodeFailure {
        /// Offending address.
        address: String,
        /// Decoder message.
        reason: String,
    },

    /// Raw bytes could not be encoded under the given prefix.
    #[error("Failed to encode address with prefix {prefix}: {reason}")]
    EncodeFailure {
        /// Requested prefix.
        prefix: String,
        /// Encoder message.
        reason: String,
    },
}

// =============================================================================
// Snapshot Errors
// =============================================================================

/// Errors raised while indexing the source genesis snapshot.
///
/// Any of these aborts the run before a single balance is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// A required field is missing or has the wrong shape.
    #[error("Malformed snapshot at {section}: {reason}")]
    MalformedSnapshot {
        /// JSON path of the offending value.
        section: String,
        /// What was expected.
        reason: String,
    },

    /// Public key `@type` is not one of the supported key types.
    #[error("Unknown public key type: {0}")]
    UnknownKeyType(String),

    /// Threshold keys nested deeper than the decoder allows.
    #[error("Public key nesting exceeds depth {0}")]
    KeyNestingTooDeep(usize),

    /// Account `@type` is not one of the supported account types.
    #[error("Unknown account type: {0}")]
    UnknownAccountType(String),

    /// A convertible balance exists for an address with no account record.
    #[error("Balance for {0} has no matching account record")]
    OrphanBalance(String),

    /// The same key appears twice in a section that must be unique.
    #[error("Duplicate entry in {section}: {key}")]
    DuplicateEntry {
        /// Section name.
        section: String,
        /// Repeated key.
        key: String,
    },

    /// A required module account is absent.
    #[error("Module account not found: {0}")]
    MissingModuleAccount(String),

    /// Distribution records are inconsistent with each other or with staking.
    #[error("Invalid distribution state: {0}")]
    InvalidDistribution(String),

    /// Address inside the snapshot failed to decode.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

// =============================================================================
// Resolve Errors
// =============================================================================

/// Contract ownership resolution errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Contract has neither an admin nor a creator.
    #[error("Contract {0} has no admin and no creator")]
    OrphanContract(String),

    /// Resolution chain revisited an address.
    #[error("Contract ownership cycle starting at {start}: {revisited} visited twice")]
    ContractCycle {
        /// Address resolution started from.
        start: String,
        /// First address seen twice.
        revisited: String,
    },

    /// Chain is longer than the resolver allows.
    #[error("Contract ownership chain from {start} exceeds depth {limit}")]
    DepthExceeded {
        /// Address resolution started from.
        start: String,
        /// Configured limit.
        limit: usize,
    },
}

// =============================================================================
// Ledger Errors
// =============================================================================

/// Errors reported by a [`crate::ports::Ledger`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// Account does not exist on the destination ledger.
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Contract does not exist on the destination ledger.
    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    /// Transfer exceeds the sender's balance.
    #[error("Insufficient funds on {address}: needs {needed}")]
    InsufficientFunds {
        /// Sender address (hex of raw bytes).
        address: String,
        /// Requested amount.
        needed: String,
    },

    /// Adapter-specific failure.
    #[error("Ledger backend error: {0}")]
    Backend(String),
}

// =============================================================================
// Config Errors
// =============================================================================

/// Network configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// File content does not match the expected SHA-256.
    #[error("SHA-256 mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        /// File that was checked.
        file: String,
        /// Expected hex digest.
        expected: String,
        /// Actual hex digest.
        actual: String,
    },

    /// Expected digest is not valid hex.
    #[error("Invalid expected SHA-256 hex: {0}")]
    InvalidHash(String),

    /// A configured address failed validation.
    #[error("Invalid {field}: {source}")]
    InvalidAddress {
        /// Config field name.
        field: String,
        /// Underlying codec error.
        source: CodecError,
    },

    /// A required field is empty or out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Config JSON does not deserialize.
    #[error("Config parse error: {0}")]
    Parse(String),
}

// =============================================================================
// Signature Errors
// =============================================================================

/// Errors reported by a [`crate::ports::SignatureScheme`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    /// Key material is not valid for the scheme.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature bytes are not valid for the scheme.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Nothing to aggregate.
    #[error("Cannot aggregate an empty set")]
    EmptyAggregate,
}

// =============================================================================
// Merge Errors
// =============================================================================

/// Top-level merge pipeline errors.
///
/// This is the error type returned by [`crate::services::MigrationPipeline`].
#[derive(Debug, Error)]
pub enum MergeError {
    /// Address codec error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Snapshot indexing error.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Ownership resolution error.
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    /// External ledger error.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Attestation error.
    #[error("Signature error: {0}")]
    Signature(#[from] SignatureError),

    /// Address is not in the account index.
    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    /// Account was already finalized.
    #[error("Account already migrated: {0}")]
    AlreadyMigrated(String),

    /// Movement would drive a balance below zero.
    #[error("Negative balance on {address}: cannot subtract {amount} from {balance}")]
    NegativeBalance {
        /// Account being debited.
        address: String,
        /// Requested amount.
        amount: String,
        /// Balance at the time of the movement.
        balance: String,
    },

    /// Conservation check failed.
    #[error("Conservation violated: {0}")]
    ConservationViolated(String),

    /// Manifest aggregate does not match its detail list.
    #[error("Manifest mismatch in {section}: {reason}")]
    ManifestMismatch {
        /// Manifest section.
        section: String,
        /// What disagreed.
        reason: String,
    },

    /// Account still carries a balance nobody claimed.
    #[error("Unresolved balance on {address} ({kind}): {balance}")]
    UnresolvedBalance {
        /// Account address.
        address: String,
        /// Account classification.
        kind: String,
        /// Remaining balance.
        balance: String,
    },

    /// Residual pool balance is larger than the configured tolerance.
    #[error("Remaining balance of {account} is {balance}, above tolerance {tolerance}")]
    ToleranceExceeded {
        /// Module or pool account.
        account: String,
        /// Remaining balance.
        balance: String,
        /// Configured tolerance.
        tolerance: u128,
    },

    /// Destination account exists with a different public key.
    #[error("Account {0} already exists with a different public key")]
    PubKeyCollision(String),

    /// Minted supply differs from the converted source supply.
    #[error("Supply mismatch: expected {expected}, minted {minted}")]
    SupplyMismatch {
        /// Converted source supply.
        expected: String,
        /// Aggregated minted amount.
        minted: String,
    },

    /// No destination validator can receive a delegation.
    #[error("No destination validator available for {0}")]
    ValidatorUnavailable(String),

    /// Reconciliation scalars disagree with the detail records.
    #[error("Reconciliation state mismatch: {0}")]
    ReconciliationMismatch(String),

    /// Reconciliation CSV row is too short or carries a bad address.
    #[error("Invalid reconciliation row {row}: {reason}")]
    InvalidReconciliationRow {
        /// Zero-based row index.
        row: usize,
        /// What was wrong.
        reason: String,
    },

    /// Arithmetic overflow on token amounts.
    #[error("Amount overflow: {0}")]
    Overflow(String),

    /// Serialization failure (manifest or contract values).
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for pipeline operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// Result type for address codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Result type for snapshot indexing.
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Result type for ownership resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result type for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for signature operations.
pub type SignatureResult<T> = Result<T, SignatureError>;
