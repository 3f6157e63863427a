//! Shared helpers for walking the untyped snapshot document.
//!
//! Every accessor takes the JSON path it is reading so that a shape mismatch
//! names the exact location in [`SnapshotError::MalformedSnapshot`].

use serde_json::Value;

use crate::error::{SnapshotError, SnapshotResult};

// =============================================================================
// Field access
// =============================================================================

/// Build a `MalformedSnapshot` error for `path`.
pub fn malformed(path: &str, reason: impl Into<String>) -> SnapshotError {
    SnapshotError::MalformedSnapshot {
        section: path.to_string(),
        reason: reason.into(),
    }
}

/// Follow a dotted path (`"app_state.bank.balances"`) from `root`.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, key| node.get(key))
}

/// Required field at `key`, reported as `path.key` when missing.
pub fn require<'a>(value: &'a Value, path: &str, key: &str) -> SnapshotResult<&'a Value> {
    value
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| malformed(&format!("{path}.{key}"), "missing required field"))
}

/// Required string field.
pub fn require_str<'a>(value: &'a Value, path: &str, key: &str) -> SnapshotResult<&'a str> {
    require(value, path, key)?
        .as_str()
        .ok_or_else(|| malformed(&format!("{path}.{key}"), "expected a string"))
}

/// Required array field.
pub fn require_array<'a>(value: &'a Value, path: &str, key: &str) -> SnapshotResult<&'a [Value]> {
    require(value, path, key)?
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| malformed(&format!("{path}.{key}"), "expected an array"))
}

/// Optional array field; a missing or null field reads as empty.
pub fn optional_array<'a>(value: &'a Value, path: &str, key: &str) -> SnapshotResult<&'a [Value]> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(malformed(&format!("{path}.{key}"), "expected an array")),
    }
}

/// Optional non-empty string field.
pub fn optional_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Required amount field (see [`parse_amount`]).
pub fn require_amount(value: &Value, path: &str, key: &str) -> SnapshotResult<u128> {
    parse_amount(require(value, path, key)?)
        .ok_or_else(|| malformed(&format!("{path}.{key}"), "expected an unsigned integer"))
}

// =============================================================================
// Numeric parsing
// =============================================================================

/// Parse an amount (u128) from JSON.
///
/// Handles both numeric and string representations, since JSON numbers are
/// limited to u64 but token amounts routinely exceed it.
pub fn parse_amount(value: &Value) -> Option<u128> {
    match value {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse a u64 from JSON.
pub fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse an i64 from JSON (timestamps may be negative in theory).
pub fn parse_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parse a u32 from JSON.
pub fn parse_u32(value: &Value) -> Option<u32> {
    parse_u64(value).and_then(|v| v.try_into().ok())
}

// =============================================================================
// Serde adapters
// =============================================================================

/// Serde adapter for u128 amounts: written as decimal strings, read from
/// either strings or JSON numbers.
pub mod amount_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let value = Value::deserialize(deserializer)?;
        super::parse_amount(&value).ok_or_else(|| D::Error::custom(format!("invalid amount {value}")))
    }
}

/// Same as [`amount_string`] for optional amounts.
pub mod option_amount_string {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u128>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => super::parse_amount(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid amount {value}"))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
