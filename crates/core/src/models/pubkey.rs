//! Public key material found on accounts and validators.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::error::{SnapshotError, SnapshotResult};
use crate::utils::{malformed, parse_u32, require, require_array, require_str};

/// Maximum nesting of threshold keys.
pub const MAX_KEY_DEPTH: usize = 16;

pub const SECP256K1_TYPE: &str = "/cosmos.crypto.secp256k1.PubKey";
pub const ED25519_TYPE: &str = "/cosmos.crypto.ed25519.PubKey";
pub const MULTISIG_TYPE: &str = "/cosmos.crypto.multisig.LegacyAminoPubKey";

/// Decoded public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PubKey {
    /// Compressed secp256k1 point (33 bytes).
    Secp256k1(Vec<u8>),
    /// Ed25519 key (32 bytes).
    Ed25519(Vec<u8>),
    /// k-of-n threshold key over nested keys.
    Threshold { threshold: u32, keys: Vec<PubKey> },
}

impl PubKey {
    /// Decode the JSON form found in a snapshot (`{"@type": ..., "key": ...}`).
    pub fn from_json(value: &Value) -> SnapshotResult<Self> {
        Self::decode(value, "pub_key", 0)
    }

    fn decode(value: &Value, path: &str, depth: usize) -> SnapshotResult<Self> {
        if depth > MAX_KEY_DEPTH {
            return Err(SnapshotError::KeyNestingTooDeep(MAX_KEY_DEPTH));
        }

        let type_url = require_str(value, path, "@type")?;
        match type_url {
            SECP256K1_TYPE => Ok(Self::Secp256k1(decode_key(value, path, 33)?)),
            ED25519_TYPE => Ok(Self::Ed25519(decode_key(value, path, 32)?)),
            MULTISIG_TYPE => {
                let threshold = parse_u32(require(value, path, "threshold")?)
                    .ok_or_else(|| malformed(&format!("{path}.threshold"), "expected u32"))?;
                let keys = require_array(value, path, "public_keys")?
                    .iter()
                    .enumerate()
                    .map(|(i, k)| Self::decode(k, &format!("{path}.public_keys[{i}]"), depth + 1))
                    .collect::<SnapshotResult<Vec<_>>>()?;
                if threshold == 0 || threshold as usize > keys.len() {
                    return Err(malformed(path, "threshold out of range"));
                }
                Ok(Self::Threshold { threshold, keys })
            }
            other => Err(SnapshotError::UnknownKeyType(other.to_string())),
        }
    }

    /// JSON form, the inverse of [`PubKey::from_json`].
    pub fn to_json(&self) -> Value {
        match self {
            Self::Secp256k1(key) => json!({"@type": SECP256K1_TYPE, "key": STANDARD.encode(key)}),
            Self::Ed25519(key) => json!({"@type": ED25519_TYPE, "key": STANDARD.encode(key)}),
            Self::Threshold { threshold, keys } => json!({
                "@type": MULTISIG_TYPE,
                "threshold": threshold,
                "public_keys": keys.iter().map(PubKey::to_json).collect::<Vec<_>>(),
            }),
        }
    }

    /// Stable identity: hex of the key bytes, or a digest over the parts for
    /// threshold keys.
    pub fn id(&self) -> String {
        match self {
            Self::Secp256k1(key) | Self::Ed25519(key) => hex::encode(key),
            Self::Threshold { threshold, keys } => {
                let mut hasher = Sha256::new();
                hasher.update(threshold.to_be_bytes());
                for key in keys {
                    hasher.update(key.id().as_bytes());
                }
                hex::encode(hasher.finalize())
            }
        }
    }
}

fn decode_key(value: &Value, path: &str, expected_len: usize) -> SnapshotResult<Vec<u8>> {
    let encoded = require_str(value, path, "key")?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| malformed(&format!("{path}.key"), e.to_string()))?;
    if bytes.len() != expected_len {
        return Err(malformed(
            &format!("{path}.key"),
            format!("expected {expected_len} bytes, got {}", bytes.len()),
        ));
    }
    Ok(bytes)
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        PubKey::from_json(&value).map_err(serde::de::Error::custom)
    }
}
