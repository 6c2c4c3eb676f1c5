//! Stripe webhook signature verification
//!
//! Header format: `t=timestamp,v1=signature[,v1=signature...]`. The signature is
//! HMAC-SHA256 over `"{t}.{payload}"` keyed with the endpoint secret, hex encoded.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Verify a webhook signature header against the raw payload.
///
/// `now` is a unix timestamp; events signed more than `tolerance_secs` away
/// from it are rejected.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > tolerance_secs {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(payload, secret, timestamp)?;

    let matched = signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_bytes().ct_eq(expected.as_bytes())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Build a signature header for a payload, in the format Stripe sends
pub fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(payload, secret, timestamp)?
    ))
}

fn compute_signature(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const NOW: i64 = 1_700_000_000;

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, SECRET, NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW + 10).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign_payload(br#"{"id":"evt_1"}"#, SECRET, NOW).unwrap();
        let result = verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 300, NOW);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = b"{}";
        let header = sign_payload(payload, "whsec_other", NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = b"{}";
        let header = sign_payload(payload, SECRET, NOW).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, NOW + 301).is_err());
    }

    #[test]
    fn test_any_of_multiple_signatures_accepted() {
        let payload = b"{}";
        let good = sign_payload(payload, SECRET, NOW).unwrap();
        let good_sig = good.split_once("v1=").map(|(_, s)| s).unwrap();
        let header = format!("t={},v1=deadbeef,v1={}", NOW, good_sig);
        assert!(verify_signature(payload, &header, SECRET, 300, NOW).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature(b"{}", "garbage", SECRET, 300, NOW).is_err());
        assert!(verify_signature(b"{}", "t=abc,v1=00", SECRET, 300, NOW).is_err());
        assert!(verify_signature(b"{}", &format!("t={}", NOW), SECRET, 300, NOW).is_err());
    }
}
