//! Port trait for an aggregatable signature scheme.
//!
//! Used to attest the upgrade manifest digest. The pairing-based primitive
//! itself is supplied by the host.

use crate::error::SignatureResult;

/// Aggregatable signature scheme (sign, verify, aggregate).
pub trait SignatureScheme: Send + Sync {
    /// Public key for a secret key.
    fn public_key(&self, secret_key: &[u8]) -> SignatureResult<Vec<u8>>;

    /// Sign `message`.
    fn sign(&self, secret_key: &[u8], message: &[u8]) -> SignatureResult<Vec<u8>>;

    /// Verify a (possibly aggregated) signature against a (possibly
    /// aggregated) public key.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> SignatureResult<bool>;

    /// Aggregate signatures over the same message.
    fn aggregate_signatures(&self, signatures: &[Vec<u8>]) -> SignatureResult<Vec<u8>>;

    /// Aggregate public keys matching [`SignatureScheme::aggregate_signatures`].
    fn aggregate_public_keys(&self, public_keys: &[Vec<u8>]) -> SignatureResult<Vec<u8>>;
}
