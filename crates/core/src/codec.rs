//! Address codec.
//!
//! Translates between human-readable bech32 addresses of both chains and
//! their raw byte identity. Pure functions, no I/O.
//!
//! Only canonical encodings are accepted: an address must re-encode to the
//! exact input string, which rejects upper-case and bech32m forms.

use bech32::{Bech32, Hrp};
use sha2::{Digest, Sha256};

use crate::error::{CodecError, CodecResult};
use crate::models::RawAddress;

/// ICS-20 version string mixed into escrow address derivation.
const ICS20_VERSION: &str = "ics20-1";

/// Length of a derived escrow address.
const ESCROW_ADDRESS_LEN: usize = 20;

/// Decode `address` into its raw bytes, returning the prefix it carries.
pub fn decode_any(address: &str) -> CodecResult<(String, RawAddress)> {
    let failure = |reason: String| CodecError::DecodeFailure {
        address: address.to_string(),
        reason,
    };

    let (hrp, bytes) = bech32::decode(address).map_err(|e| failure(e.to_string()))?;
    let canonical = bech32::encode::<Bech32>(hrp, &bytes).map_err(|e| failure(e.to_string()))?;
    if canonical != address {
        return Err(failure("address is not in canonical form".to_string()));
    }
    Ok((hrp.as_str().to_string(), RawAddress(bytes)))
}

/// Decode `address`, requiring it to carry `expected_prefix`.
pub fn decode(address: &str, expected_prefix: &str) -> CodecResult<RawAddress> {
    let (prefix, raw) = decode_any(address)?;
    if prefix != expected_prefix {
        return Err(CodecError::PrefixMismatch {
            expected: expected_prefix.to_string(),
            actual: prefix,
        });
    }
    Ok(raw)
}

/// Encode raw bytes under `prefix`.
pub fn encode(prefix: &str, raw: &[u8]) -> CodecResult<String> {
    let failure = |reason: String| CodecError::EncodeFailure {
        prefix: prefix.to_string(),
        reason,
    };
    let hrp = Hrp::parse(prefix).map_err(|e| failure(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, raw).map_err(|e| failure(e.to_string()))
}

/// Re-encode an address from one prefix to another, keeping its bytes.
pub fn convert(address: &str, from_prefix: &str, to_prefix: &str) -> CodecResult<String> {
    let raw = decode(address, from_prefix)?;
    encode(to_prefix, raw.as_bytes())
}

/// Raw escrow address for a transfer channel:
/// `sha256("ics20-1" || 0x00 || "<port>/<channel>")[..20]`.
pub fn escrow_raw_address(port_id: &str, channel_id: &str) -> RawAddress {
    let mut hasher = Sha256::new();
    hasher.update(ICS20_VERSION.as_bytes());
    hasher.update([0u8]);
    hasher.update(format!("{port_id}/{channel_id}").as_bytes());
    let digest = hasher.finalize();
    RawAddress(digest[..ESCROW_ADDRESS_LEN].to_vec())
}

/// Escrow address for a transfer channel, encoded under `prefix`.
pub fn escrow_address(prefix: &str, port_id: &str, channel_id: &str) -> CodecResult<String> {
    encode(prefix, escrow_raw_address(port_id, channel_id).as_bytes())
}
