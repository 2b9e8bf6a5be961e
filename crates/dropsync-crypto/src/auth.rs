use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::OsRng;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::keys::derive_auth_key;

type HmacSha256 = Hmac<Sha256>;

pub const CHALLENGE_SIZE: usize = 32;

/// 32 random bytes for the auth challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut nonce = [0u8; CHALLENGE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// HMAC-SHA256 over the nonce under the password-derived auth key.
pub fn sign_challenge(nonce: &[u8], password: &str) -> [u8; 32] {
    let key = derive_auth_key(password);
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.finalize().into_bytes().into()
}

/// Constant-time MAC verification. Never short-circuits on a prefix match.
pub fn verify_challenge(nonce: &[u8], signature: &[u8], password: &str) -> bool {
    let key = derive_auth_key(password);
    let mut mac = HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(nonce);
    mac.verify_slice(signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let nonce = generate_challenge();
        let sig = sign_challenge(&nonce, "secret");
        assert!(verify_challenge(&nonce, &sig, "secret"));
    }

    #[test]
    fn wrong_password_rejected() {
        let nonce = generate_challenge();
        let sig = sign_challenge(&nonce, "alpha");
        assert!(!verify_challenge(&nonce, &sig, "beta"));
    }

    #[test]
    fn wrong_nonce_rejected() {
        let sig = sign_challenge(&generate_challenge(), "secret");
        assert!(!verify_challenge(&generate_challenge(), &sig, "secret"));
    }

    #[test]
    fn truncated_signature_rejected() {
        let nonce = generate_challenge();
        let sig = sign_challenge(&nonce, "secret");
        assert!(!verify_challenge(&nonce, &sig[..16], "secret"));
    }

    #[test]
    fn challenges_vary() {
        assert_ne!(generate_challenge(), generate_challenge());
    }
}
