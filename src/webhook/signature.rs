use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check an `X-Hub-Signature-256` header (`sha256=<hex>`) against the body.
pub fn verify_github(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

const GITLAB_TOKEN_CONTEXT: &[u8] = b"x-gitlab-token";

/// Compare an `X-Gitlab-Token` header with the shared secret in constant
/// time. Each side keys a MAC over a fixed message and the tags are compared.
pub fn verify_gitlab(secret: &str, token: &str) -> bool {
    let Ok(mut expected) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    expected.update(GITLAB_TOKEN_CONTEXT);
    let expected = expected.finalize().into_bytes();

    let Ok(mut mac) = HmacSha256::new_from_slice(token.as_bytes()) else {
        return false;
    };
    mac.update(GITLAB_TOKEN_CONTEXT);
    mac.verify_slice(&expected).is_ok()
}

/// Test helper and tooling aid: the header value GitHub would send.
pub fn sign_github(secret: &str, payload: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mut mac) => {
            mac.update(payload);
            format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
        }
        Err(_) => String::new(),
    }
}
