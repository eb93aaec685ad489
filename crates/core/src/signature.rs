//! HMAC request signatures for device traffic
//!
//! Devices sign every request with their shared `secret_key`. Two schemes are
//! accepted so firmware can be upgraded independently of the server:
//!
//! - body-only: `HMAC-SHA256(secret, canonical_body)`
//! - legacy: `HMAC-SHA256(secret, device_id . timestamp . METHOD . path . canonical_body)`,
//!   selected when the request carries a timestamp, which must be fresh.
//!
//! Signatures are lowercase hex. The canonical body is the JSON body with
//! object keys sorted recursively and no insignificant whitespace.

use hmac::{Hmac, Mac};
use serde_json::Value as JsonValue;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use queuepay_types::defaults;

type HmacSha256 = Hmac<Sha256>;

pub const DEVICE_ID_HEADER: &str = "x-device-id";
pub const SIGNATURE_HEADER: &str = "x-signature";
pub const TIMESTAMP_HEADER: &str = "x-timestamp";

/// Timestamps above this are taken to be milliseconds
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Signature timestamp is outside the accepted window")]
    Expired,
    #[error("Signature does not match")]
    Invalid,
    #[error("Device secret cannot be used as an HMAC key")]
    InvalidKey,
}

/// Which message a signature covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureMode {
    BodyOnly,
    Legacy { timestamp: String },
}

impl SignatureMode {
    /// Legacy mode is selected by the presence of a timestamp
    pub fn from_timestamp(timestamp: Option<&str>) -> Self {
        match timestamp {
            Some(timestamp) => SignatureMode::Legacy {
                timestamp: timestamp.to_string(),
            },
            None => SignatureMode::BodyOnly,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignatureConfig {
    /// Maximum distance between a legacy timestamp and server time
    pub tolerance_secs: i64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: defaults::SIGNATURE_TOLERANCE_SECS,
        }
    }
}

impl SignatureConfig {
    pub fn with_tolerance_secs(mut self, tolerance_secs: i64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }
}

/// Serialize `value` with object keys sorted at every depth
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical form of a raw request body.
///
/// An empty body is `{}`; a body that is not JSON is used verbatim.
pub fn canonical_body(body: &[u8]) -> String {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return "{}".to_string();
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(value) => canonical_json(&value),
        Err(_) => String::from_utf8_lossy(body).into_owned(),
    }
}

/// The exact bytes a device signs
pub fn signing_message(
    mode: &SignatureMode,
    device_id: &str,
    method: &str,
    path: &str,
    canonical_body: &str,
) -> String {
    match mode {
        SignatureMode::BodyOnly => canonical_body.to_string(),
        SignatureMode::Legacy { timestamp } => format!(
            "{}{}{}{}{}",
            device_id,
            timestamp,
            method.to_ascii_uppercase(),
            path,
            canonical_body
        ),
    }
}

/// HMAC-SHA256 in lowercase hex
pub fn sign_hmac_sha256_hex(secret: &str, data: &str) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidKey)?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time equality; only the length leaks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Compare two hex signatures, case-insensitive
pub fn signatures_match(provided: &str, expected: &str) -> bool {
    let provided = provided.trim().to_ascii_lowercase();
    let expected = expected.to_ascii_lowercase();
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

/// Parse a legacy timestamp (seconds, or milliseconds) into Unix seconds
fn timestamp_secs(timestamp: &str) -> Option<i64> {
    let value: i64 = timestamp.trim().parse().ok()?;
    if value > MILLIS_THRESHOLD {
        Some(value / 1000)
    } else {
        Some(value)
    }
}

/// A signed request as seen by the verifier
#[derive(Debug, Clone)]
pub struct SignedRequest<'a> {
    pub device_id: &'a str,
    pub signature: &'a str,
    pub mode: SignatureMode,
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
}

impl SignedRequest<'_> {
    /// Check freshness (legacy mode only) and then the signature itself.
    ///
    /// `now_secs` is the server clock in Unix seconds.
    pub fn verify(
        &self,
        secret_key: &str,
        config: &SignatureConfig,
        now_secs: i64,
    ) -> Result<(), SignatureError> {
        if let SignatureMode::Legacy { timestamp } = &self.mode {
            let ts = timestamp_secs(timestamp).ok_or(SignatureError::Expired)?;
            if now_secs.abs_diff(ts) > config.tolerance_secs.max(0) as u64 {
                return Err(SignatureError::Expired);
            }
        }

        let message = signing_message(
            &self.mode,
            self.device_id,
            self.method,
            self.path,
            &canonical_body(self.body),
        );
        let expected = sign_hmac_sha256_hex(secret_key, &message)?;
        if signatures_match(self.signature, &expected) {
            Ok(())
        } else {
            Err(SignatureError::Invalid)
        }
    }
}
