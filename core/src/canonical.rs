//! Deterministic serialization and hashing for event payloads.
//!
//! Every payload is reduced to a canonical JSON byte form before hashing:
//! object keys sorted, `-0.0` normalized to `0.0`, non-finite numbers
//! rejected, UTF-8 output. Two structurally equal payloads always produce
//! identical bytes, which is what makes the hash chain and the policy
//! determinism law checkable.
//!
//! The chain itself hashes digests, not bodies:
//!
//! ```text
//! payload_digest = SHA-256(canonical_payload_bytes)
//! hash           = SHA-256(prev_hash || payload_digest)
//! ```
//!
//! so a pruned event (payload body dropped, digest retained) stays fully
//! verifiable in place.

use serde::Serialize;
use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;

use crate::error::CoreErr;
use crate::error::Result;

pub const HASH_LEN: usize = 32;

pub type Hash = [u8; HASH_LEN];

/// The genesis event's `prev_hash`.
pub const GENESIS_PREV_HASH: Hash = [0u8; HASH_LEN];

/// Serialize `value` into canonical JSON bytes.
///
/// `serde_json`'s `Map` is a `BTreeMap` (the `preserve_order` feature is
/// deliberately not enabled), so routing through [`Value`] sorts object keys
/// at every level for free.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut value = serde_json::to_value(value)?;
    normalize_numbers(&mut value)?;
    Ok(serde_json::to_vec(&value)?)
}

fn normalize_numbers(value: &mut Value) -> Result<()> {
    match value {
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if !f.is_finite() {
                    return Err(CoreErr::SchemaViolation(
                        "non-finite number in payload".to_string(),
                    ));
                }
                // serde_json keeps the sign bit of -0.0 through round-trips.
                if f == 0.0 && f.is_sign_negative() {
                    *value = Value::from(0.0);
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                normalize_numbers(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                normalize_numbers(v)?;
            }
            Ok(())
        }
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
    }
}

pub fn sha256(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn payload_digest(canonical_payload: &[u8]) -> Hash {
    sha256(canonical_payload)
}

/// Hash of one chain link: `SHA-256(prev_hash || payload_digest)`.
pub fn chain_hash(prev_hash: &Hash, payload_digest: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(payload_digest);
    hasher.finalize().into()
}

pub fn to_hex(hash: &Hash) -> String {
    let mut out = String::with_capacity(HASH_LEN * 2);
    for byte in hash {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn from_hex(hex: &str) -> Result<Hash> {
    if hex.len() != HASH_LEN * 2 {
        return Err(CoreErr::SchemaViolation(format!(
            "expected {} hex chars, got {}",
            HASH_LEN * 2,
            hex.len()
        )));
    }
    let mut out = [0u8; HASH_LEN];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk)
            .map_err(|_| CoreErr::SchemaViolation("non-utf8 hex".to_string()))?;
        out[i] = u8::from_str_radix(s, 16)
            .map_err(|_| CoreErr::SchemaViolation(format!("bad hex byte `{s}`")))?;
    }
    Ok(out)
}
