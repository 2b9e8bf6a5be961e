/// Password-derived cryptography for DropSync sessions.
///
/// Key derivation: PBKDF2-HMAC-SHA256(password, fixed salt, 100 000 rounds)
///   → 32-byte key. Two fixed salts give two independent keys: one for
///   chunk encryption, one for challenge MACs.
///
/// Wire format per encrypted chunk: IV(12) + ciphertext + GCM tag(16), with
/// a fresh random IV per chunk so nonces never repeat across the session or
/// across retries.
///
/// Challenge-response: HMAC-SHA256 over the 32-byte nonce under the auth
/// key; verification is constant-time.

pub mod auth;
pub mod chunk;
pub mod keys;

pub use auth::{generate_challenge, sign_challenge, verify_challenge, CHALLENGE_SIZE};
pub use chunk::{decrypt_chunk, encrypt_chunk, ChunkCipher, CipherCache};
pub use keys::{
    derive_auth_key, derive_chunk_key, derive_key_with_salt, AUTH_KEY_SALT, CHUNK_KEY_SALT,
    KDF_ITERATIONS, KEY_SIZE,
};

pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("encrypted payload too short")]
    TooShort,
    #[error("decryption failed: wrong password or corrupted chunk")]
    DecryptionFailed,
}
