//! Webhook body signatures (HMAC-SHA256 over the raw request body) and
//! constant-time token comparison.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Messenger `X-Hub-Signature-256: sha256=<hex>`. An empty secret disables the check.
pub fn verify_hub_signature(app_secret: &str, header: Option<&str>, body: &[u8]) -> bool {
    let app_secret = app_secret.trim();
    if app_secret.is_empty() {
        return true;
    }
    let signature = header.unwrap_or("").trim();
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature).trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// LINE `X-Line-Signature: <base64>`. An empty secret disables the check.
pub fn verify_line_signature(channel_secret: &str, header: Option<&str>, body: &[u8]) -> bool {
    let channel_secret = channel_secret.trim();
    if channel_secret.is_empty() {
        return true;
    }
    let signature = header.unwrap_or("").trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(channel_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compares a presented bearer token with the configured one in constant time.
/// Both sides are reduced to fixed-length HMAC tags first, so length leaks nothing.
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    let tag = |value: &str| {
        HmacSha256::new_from_slice(b"shopchat-bearer-token").map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    let (Ok(provided), Ok(expected)) = (tag(provided), tag(expected)) else {
        return false;
    };
    provided
        .verify_slice(&expected.finalize().into_bytes())
        .is_ok()
}

#[cfg(test)]
pub(crate) fn sign_hex(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
pub(crate) fn sign_base64(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_signature_round_trip() {
        let body = br#"{"object":"page"}"#;
        let header = sign_hex("secret", body);
        assert!(verify_hub_signature("secret", Some(&header), body));
        assert!(!verify_hub_signature("other", Some(&header), body));
        assert!(!verify_hub_signature("secret", Some(&header), b"tampered"));
        assert!(!verify_hub_signature("secret", None, body));
        assert!(!verify_hub_signature("secret", Some("sha256=zz"), body));
        assert!(verify_hub_signature("", None, body));
    }

    #[test]
    fn test_line_signature_round_trip() {
        let body = br#"{"events":[]}"#;
        let header = sign_base64("line-secret", body);
        assert!(verify_line_signature("line-secret", Some(&header), body));
        assert!(!verify_line_signature("line-secret", Some("bm90LWl0"), body));
        assert!(!verify_line_signature("line-secret", Some("%%%"), body));
        assert!(!verify_line_signature("line-secret", None, body));
        assert!(verify_line_signature(" ", None, body));
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("admin", "admin"));
        assert!(!tokens_match("admin2", "admin"));
        assert!(!tokens_match("", "admin"));
        assert!(!tokens_match("Admin", "admin"));
    }
}
