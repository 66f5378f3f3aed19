//! HMAC-SHA256 signature verification for inbound webhook payloads.
//!
//! The signature is the hex-encoded HMAC-SHA256 of the raw request body
//! under the subscription's secret, carried in `X-Webhook-Signature`.
//! Comparison happens inside the MAC (constant time), never on the hex
//! strings.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 signature of the raw body.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Header carrying the optional event type.
pub const EVENT_TYPE_HEADER: &str = "x-event-type";

/// Verify a hex-encoded HMAC-SHA256 signature over the raw payload.
///
/// Returns false for signatures that are not valid hex as well as for
/// honest mismatches; the caller treats both as a bad signature.
pub fn verify_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the hex signature for a payload. Used by tests and callers that
/// need to produce valid requests.
pub fn compute_signature(payload: &[u8], secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
