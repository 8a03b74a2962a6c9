//! Payload signing for outbound deliveries.
//!
//! Receivers verify `X-Courier-Signature` by recomputing HMAC-SHA256 over the
//! raw request body with their copy of the endpoint secret. The body is the
//! canonical encoding produced here, so the bytes signed are the bytes sent.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Prefix of every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Bytes of entropy in a generated endpoint secret.
pub const SECRET_BYTES: usize = 32;

/// Signing failures. Messages never include the secret.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    /// The secret is empty.
    #[error("signing secret is empty")]
    EmptySecret,

    /// The payload could not be encoded.
    #[error("payload could not be encoded: {0}")]
    Encoding(String),

    /// The signature header is not `sha256=<hex>`.
    #[error("invalid signature format")]
    InvalidFormat,
}

/// Encodes `value` as compact JSON with object keys sorted by byte order at
/// every depth.
///
/// Output is independent of map iteration order, so the same value always
/// produces the same bytes.
///
/// # Errors
///
/// Returns `SigningError::Encoding` if a string cannot be serialized.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, SigningError> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), SigningError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push(b'{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)
                    .map_err(|e| SigningError::Encoding(e.to_string()))?;
                out.push(b':');
                write_canonical(child, out)?;
            }
            out.push(b'}');
        },
        Value::Array(items) => {
            out.push(b'[');
            for (i, child) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(child, out)?;
            }
            out.push(b']');
        },
        scalar => {
            serde_json::to_writer(&mut *out, scalar)
                .map_err(|e| SigningError::Encoding(e.to_string()))?;
        },
    }
    Ok(())
}

/// Signs raw bytes, returning `sha256=<lowercase hex>`.
///
/// # Errors
///
/// Returns `SigningError::EmptySecret` for an empty secret.
pub fn sign_bytes(secret: &str, body: &[u8]) -> Result<String, SigningError> {
    if secret.is_empty() {
        return Err(SigningError::EmptySecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SigningError::EmptySecret)?;
    mac.update(body);
    Ok(format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

/// Signs the canonical encoding of `payload`.
///
/// Pure and deterministic: identical inputs yield identical signatures.
///
/// # Errors
///
/// Returns an error for an empty secret or an unencodable payload.
pub fn sign(secret: &str, payload: &Value) -> Result<String, SigningError> {
    sign_bytes(secret, &canonical_json(payload)?)
}

/// Checks a `sha256=<hex>` header against `body`, in constant time over the
/// digest.
///
/// # Errors
///
/// Returns `SigningError::InvalidFormat` if the header is malformed and
/// `SigningError::EmptySecret` for an empty secret.
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> Result<bool, SigningError> {
    let provided = header.strip_prefix(SIGNATURE_PREFIX).ok_or(SigningError::InvalidFormat)?;
    if provided.len() != 64 || !provided.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SigningError::InvalidFormat);
    }
    let expected = sign_bytes(secret, body)?;
    Ok(timing_safe_eq(
        provided.to_ascii_lowercase().as_bytes(),
        &expected.as_bytes()[SIGNATURE_PREFIX.len()..],
    ))
}

/// Generates a fresh endpoint secret: 32 random bytes, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
