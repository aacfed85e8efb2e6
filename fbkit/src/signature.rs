//! Verification of payloads signed by Facebook with the application secret.
//!
//! Two shapes are accepted:
//! - the compact `signed_request` token (`base64url(sig).base64url(json)`),
//!   signed with HMAC-SHA256 over the encoded payload segment;
//! - the legacy flat `session` map carrying its own `sig` field, signed with
//!   an MD5 digest over the sorted `key=value` pairs followed by the secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The only algorithm Facebook uses for signed requests
const SIGNED_REQUEST_ALGORITHM: &str = "HMAC-SHA256";

/// Fields describing the token itself rather than the session it carries
const TOKEN_SHAPE_FIELDS: [&str; 2] = ["algorithm", "issued_at"];

/// Errors that can occur while verifying a signed payload
#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("Malformed signed payload: {0}")]
    Malformed(String),
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Signature mismatch")]
    Mismatch,
}

/// Verify a compact `signed_request` token and return its payload.
pub fn verify_signed_request(
    signed_request: &str,
    secret: &str,
) -> Result<Map<String, Value>, SignatureError> {
    let (encoded_sig, encoded_payload) = signed_request
        .split_once('.')
        .ok_or_else(|| SignatureError::Malformed("missing payload segment".to_string()))?;

    let signature = decode_segment(encoded_sig)?;
    let payload = decode_segment(encoded_payload)?;
    let data: Map<String, Value> = serde_json::from_slice(&payload)
        .map_err(|e| SignatureError::Malformed(format!("payload is not a JSON object: {e}")))?;

    let algorithm = data
        .get("algorithm")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !algorithm.eq_ignore_ascii_case(SIGNED_REQUEST_ALGORITHM) {
        return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
    }

    // The signature covers the payload segment exactly as it was transmitted
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    mac.update(encoded_payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| SignatureError::Mismatch)?;

    Ok(data)
}

/// Verify a legacy JSON `session` map and return its fields without `sig`
/// and without the token-shape fields.
pub fn verify_legacy_session(
    session: &str,
    secret: &str,
) -> Result<Map<String, Value>, SignatureError> {
    let mut data: Map<String, Value> = serde_json::from_str(session)
        .map_err(|e| SignatureError::Malformed(format!("session is not a JSON object: {e}")))?;

    let supplied = match data.remove("sig") {
        Some(Value::String(sig)) => sig.to_ascii_lowercase(),
        _ => return Err(SignatureError::Malformed("missing sig field".to_string())),
    };

    let expected = legacy_signature(
        data.iter().map(|(key, value)| (key.as_str(), render_value(value))),
        secret,
    );
    if !bool::from(expected.as_bytes().ct_eq(supplied.as_bytes())) {
        return Err(SignatureError::Mismatch);
    }

    for field in TOKEN_SHAPE_FIELDS {
        data.remove(field);
    }
    Ok(data)
}

/// Compute the legacy MD5 signature: sorted `key=value` pairs concatenated,
/// followed by the secret, as lowercase hex.
pub fn legacy_signature<I, K, V>(params: I, secret: &str) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(K, V)> = params.into_iter().collect();
    pairs.sort_by(|a, b| a.0.as_ref().cmp(b.0.as_ref()));

    let mut hasher = Md5::new();
    for (key, value) in &pairs {
        hasher.update(key.as_ref().as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_ref().as_bytes());
    }
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, SignatureError> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| SignatureError::Malformed(format!("invalid base64 segment: {e}")))
}

/// Legacy sessions carry string values; anything else is signed as JSON text
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
