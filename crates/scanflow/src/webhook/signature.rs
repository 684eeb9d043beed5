use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Verifies an HMAC-SHA256 signature against any of the configured header
/// names. The analysis server signs with one of two conventions depending
/// on deployment generation; accepting both means a fleet mid-migration
/// doesn't need every instance upgraded in lockstep.
pub fn verify_signature(secret: &str, body: &[u8], provided_hex: &str) -> bool {
    let provided = match hex::decode(provided_hex.trim_start_matches("sha256=")) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);

    mac.verify_slice(&provided).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_correctly_signed_body() {
        let body = b"{\"analysis_id\":\"a1\"}";
        let signature = sign("secret", body);
        assert!(verify_signature("secret", body, &signature));
    }

    #[test]
    fn accepts_the_sha256_prefixed_convention() {
        let body = b"{\"analysis_id\":\"a1\"}";
        let signature = format!("sha256={}", sign("secret", body));
        assert!(verify_signature("secret", body, &signature));
    }

    #[test]
    fn rejects_a_signature_from_the_wrong_secret() {
        let body = b"{\"analysis_id\":\"a1\"}";
        let signature = sign("wrong-secret", body);
        assert!(!verify_signature("secret", body, &signature));
    }

    #[test]
    fn rejects_a_signature_for_a_tampered_body() {
        let signed_body = b"{\"analysis_id\":\"a1\"}";
        let signature = sign("secret", signed_body);
        assert!(!verify_signature("secret", b"{\"analysis_id\":\"a2\"}", &signature));
    }

    #[test]
    fn rejects_non_hex_garbage() {
        assert!(!verify_signature("secret", b"body", "not-hex-at-all"));
    }
}
