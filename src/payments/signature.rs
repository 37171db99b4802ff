//! Webhook signature verification
//!
//! Providers sign the raw request body with a shared secret and send the hex
//! digest in a header. Verification recomputes the HMAC over the exact bytes
//! received and compares through `Mac::verify_slice`, which is constant-time.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use crate::error::{PaymentError, PaymentResult};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Default tolerance for timestamped signatures (Stripe)
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verify a hex-encoded HMAC-SHA512 signature (Paystack)
pub fn verify_hmac_sha512_hex(secret: &[u8], payload: &[u8], signature: &str) -> PaymentResult<()> {
    let expected = decode_hex_signature(signature)?;
    let mut mac = HmacSha512::new_from_slice(secret).map_err(|_| PaymentError::InvalidSignature)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::InvalidSignature)
}

/// Verify a hex-encoded HMAC-SHA256 signature (Chapa)
pub fn verify_hmac_sha256_hex(secret: &[u8], payload: &[u8], signature: &str) -> PaymentResult<()> {
    let expected = decode_hex_signature(signature)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| PaymentError::InvalidSignature)?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| PaymentError::InvalidSignature)
}

/// Verify a `t=<unix>,v1=<hex>` signature header (Stripe).
///
/// The signed content is `"{t}.{payload}"`. Any of several `v1` entries may
/// match; the timestamp must be within `tolerance_secs` of now.
pub fn verify_timestamped_sha256(
    secret: &[u8],
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
) -> PaymentResult<()> {
    verify_timestamped_sha256_at(secret, payload, header, tolerance_secs, Utc::now().timestamp())
}

fn verify_timestamped_sha256_at(
    secret: &[u8],
    payload: &[u8],
    header: &str,
    tolerance_secs: i64,
    now: i64,
) -> PaymentResult<()> {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", sig)) => candidates.push(sig),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(PaymentError::InvalidSignature)?;
    if (now - timestamp).abs() > tolerance_secs {
        tracing::warn!(timestamp, now, "webhook signature timestamp outside tolerance");
        return Err(PaymentError::InvalidSignature);
    }

    let mut signed = timestamp.to_string().into_bytes();
    signed.push(b'.');
    signed.extend_from_slice(payload);

    candidates
        .into_iter()
        .any(|sig| verify_hmac_sha256_hex(secret, &signed, sig).is_ok())
        .then_some(())
        .ok_or(PaymentError::InvalidSignature)
}

fn decode_hex_signature(signature: &str) -> PaymentResult<Vec<u8>> {
    hex::decode(signature.trim()).map_err(|_| PaymentError::InvalidSignature)
}

/// Produce a hex HMAC-SHA256 digest; used by tests and local tooling that
/// replay provider webhooks.
pub fn sign_hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Produce a hex HMAC-SHA512 digest
pub fn sign_hmac_sha512_hex(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha512::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
