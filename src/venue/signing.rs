//! REST request signing shared by both venue adapters. Both venue families
//! here are conventional CEX-style APIs (HMAC-SHA256 over a canonical
//! request string), unlike the teacher's Hyperliquid EIP-712/msgpack L1
//! action signing — that scheme is specific to an on-chain order book and has
//! no counterpart in this system's two venues, so it is not carried forward.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 signature over `payload`, keyed by the venue's
/// API secret. Used as the `signature` query/body parameter on authenticated
/// REST calls.
pub fn sign_hex(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Builds the canonical `key1=val1&key2=val2` query string in the order
/// given (callers must pass params pre-sorted/ordered per venue convention),
/// used as both the signed payload and the request query string.
pub fn canonical_query(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_hex_is_deterministic() {
        let a = sign_hex("secret", "payload");
        let b = sign_hex("secret", "payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn canonical_query_joins_in_order() {
        let q = canonical_query(&[("symbol", "BNBUSDT"), ("side", "BUY")]);
        assert_eq!(q, "symbol=BNBUSDT&side=BUY");
    }
}
