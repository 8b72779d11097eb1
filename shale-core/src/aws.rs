//! AWS signature version 4 request signing, used when archiving objects to
//! AWS-hosted cold storage.

use crate::error::{Result, ShaleError};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_ALGORITHM: &str = "AWS4-HMAC-SHA256";
const TERMINATION_STRING: &str = "aws4_request";

/// SHA-256 of an empty payload, for bodyless requests.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    /// Hex signature for the Authorization header.
    pub signature: String,
    /// The `;`-joined, sorted header names covered by the signature.
    pub signed_headers: String,
}

/// Computes the request signature from the canonical request and the derived
/// signing key. Header names are lower-cased and the set is sorted before
/// signing; header values get insignificant whitespace collapsed. The
/// `x-amz-date` header is required.
pub fn sign_request(
    method: &str,
    path: &str,
    query: &str,
    headers: &[(&str, &str)],
    payload_sha256_hex: &str,
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<SignedRequest> {
    let mut canonical_headers: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), canonical_header_value(value)))
        .collect();
    canonical_headers.sort();

    let timestamp = canonical_headers
        .iter()
        .find(|(name, _)| name == "x-amz-date")
        .map(|(_, value)| value.clone())
        .ok_or_else(|| {
            ShaleError::InvalidRequest("request must carry an x-amz-date header".to_string())
        })?;

    let signed_headers = canonical_headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let mut canonical_request = Sha256::new();
    canonical_request.update(method);
    canonical_request.update("\n");
    canonical_request.update(path);
    canonical_request.update("\n");
    canonical_request.update(query);
    canonical_request.update("\n");
    for (name, value) in &canonical_headers {
        canonical_request.update(name);
        canonical_request.update(":");
        canonical_request.update(value);
        canonical_request.update("\n");
    }
    canonical_request.update("\n");
    canonical_request.update(&signed_headers);
    canonical_request.update("\n");
    canonical_request.update(payload_sha256_hex);
    let canonical_hash = hex::encode(canonical_request.finalize());

    let mut signing_key = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date.as_bytes())?;
    signing_key = hmac_sha256(&signing_key, region.as_bytes())?;
    signing_key = hmac_sha256(&signing_key, service.as_bytes())?;
    signing_key = hmac_sha256(&signing_key, TERMINATION_STRING.as_bytes())?;

    let string_to_sign = format!(
        "{}\n{}\n{}/{}/{}/{}\n{}",
        SIGNATURE_ALGORITHM, timestamp, date, region, service, TERMINATION_STRING, canonical_hash
    );
    let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes())?);

    Ok(SignedRequest {
        signature,
        signed_headers,
    })
}

/// Collapses runs of whitespace outside double quotes into single spaces
/// and trims the ends.
fn canonical_header_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_quotes = false;

    for ch in value.trim_start().chars() {
        if !in_quotes && ch.is_ascii_whitespace() {
            if !out.ends_with(' ') {
                out.push(' ');
            }
        } else {
            if ch == '"' {
                in_quotes = !in_quotes;
            }
            out.push(ch);
        }
    }

    out.trim_end().to_string()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|error| ShaleError::Internal(format!("hmac key setup failed: {}", error)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
