use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::SigningSecret;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";
pub const DELIVERY_ID_HEADER: &str = "X-Webhook-Delivery-Id";
pub const EVENT_TYPE_HEADER: &str = "X-Webhook-Event-Type";

/// Compute the signature token sent with a delivery.
///
/// The MAC covers `"{timestamp}.{payload}"`, keyed with the subscription
/// secret, and is returned as lowercase hex. Identical inputs always produce
/// the same token.
pub fn sign(payload: &[u8], secret: &SigningSecret, timestamp: i64) -> String {
    compute_signature(secret.expose(), payload, timestamp)
}

/// Same as [`sign`], for callers holding raw key bytes (e.g. receivers).
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: i64) -> String {
    let mac = keyed_mac(secret, payload, timestamp);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a received signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: i64, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };

    keyed_mac(secret, payload, timestamp)
        .verify_slice(&signature)
        .is_ok()
}

fn keyed_mac(secret: &[u8], payload: &[u8], timestamp: i64) -> HmacSha256 {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: i64, now_secs: i64, max_age_secs: i64) -> bool {
    now_secs >= timestamp_secs && now_secs - timestamp_secs <= max_age_secs
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Pick the signature and timestamp headers out of a header list.
/// Header names match case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(TIMESTAMP_HEADER) {
            parsed.timestamp = Some(value.to_string());
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("missing timestamp header")]
    MissingTimestamp,
    #[error("timestamp is not a unix timestamp")]
    InvalidTimestamp,
    #[error("timestamp outside the accepted window")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: i64,
    now_secs: i64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let timestamp = parsed
        .timestamp
        .ok_or(VerificationError::MissingTimestamp)?
        .parse::<i64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, timestamp, &signature) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
