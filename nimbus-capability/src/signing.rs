//! HMAC-SHA256 request signing
//!
//! The signed string is
//!
//! ```text
//! METHOD \n PATH \n TIMESTAMP \n hex(sha256(BODY))
//! ```
//!
//! where `PATH` is the escaped request path without the base URL and
//! `TIMESTAMP` is unix seconds. The signature is the lowercase hex HMAC of that
//! string keyed by the shared secret.

use hmac::{Hmac, Mac};
use nimbus_core::error::{NimbusError, NimbusResult};
use sha2::{Digest, Sha256};

pub const HEADER_API_KEY: &str = "X-API-KEY";
pub const HEADER_TIMESTAMP: &str = "X-API-TIMESTAMP";
pub const HEADER_SIGNATURE: &str = "X-API-SIGNATURE";

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct RequestSigner {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("api_key", &self.api_key)
            .finish_non_exhaustive()
    }
}

impl RequestSigner {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn sign(&self, method: &str, path: &str, timestamp: &str, body: &[u8]) -> NimbusResult<String> {
        sign(&self.api_secret, method, path, timestamp, body)
    }
}

pub fn canonical_string(method: &str, path: &str, timestamp: &str, body: &[u8]) -> String {
    let body_hash = hex::encode(Sha256::digest(body));
    format!("{}\n{}\n{}\n{}", method, path, timestamp, body_hash)
}

pub fn sign(secret: &str, method: &str, path: &str, timestamp: &str, body: &[u8]) -> NimbusResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NimbusError::configuration("control_plane", format!("invalid signing key: {}", e)))?;
    mac.update(canonical_string(method, path, timestamp, body).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature.
pub fn verify(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(canonical_string(method, path, timestamp, body).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_string_hashes_body() {
        let canonical = canonical_string("POST", "/instances", "1700000000", b"{}");
        assert_eq!(
            canonical,
            "POST\n/instances\n1700000000\n44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let signature = sign("secret", "GET", "/tasks/t-1", "1700000000", b"{}").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify("secret", "GET", "/tasks/t-1", "1700000000", b"{}", &signature));
        assert!(!verify("other", "GET", "/tasks/t-1", "1700000000", b"{}", &signature));
        assert!(!verify("secret", "GET", "/tasks/t-2", "1700000000", b"{}", &signature));
        assert!(!verify("secret", "GET", "/tasks/t-1", "1700000001", b"{}", &signature));
        assert!(!verify("secret", "GET", "/tasks/t-1", "1700000000", b"{}", "not-hex"));
    }
}
