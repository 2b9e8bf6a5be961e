use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::keys::derive_chunk_key;
use crate::{CryptoError, IV_SIZE, TAG_SIZE};

/// A cipher bound to one password. Deriving the key runs the full PBKDF2
/// schedule, so callers on a chunk loop should hold one of these (or a
/// [`CipherCache`]) instead of calling the free functions per chunk.
pub struct ChunkCipher {
    password: String,
    cipher: Aes256Gcm,
}

impl ChunkCipher {
    pub fn new(password: &str) -> Self {
        let key = derive_chunk_key(password);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("AES-256 key length is fixed");
        Self {
            password: password.to_owned(),
            cipher,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Encrypt one chunk. Output layout: IV(12) + ciphertext + tag(16).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt one chunk. Any authentication failure is fatal for the
    /// transfer and surfaces as [`CryptoError::DecryptionFailed`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < IV_SIZE + TAG_SIZE {
            return Err(CryptoError::TooShort);
        }
        let (iv, ciphertext) = data.split_at(IV_SIZE);
        let nonce = Nonce::from_slice(iv);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Re-derives the cipher only when the observed password changes, so
/// long-lived chunk loops can read the current password fresh at every use
/// without paying the KDF each time.
#[derive(Default)]
pub struct CipherCache {
    current: Option<ChunkCipher>,
}

impl CipherCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cipher(&mut self, password: &str) -> &ChunkCipher {
        let stale = self
            .current
            .as_ref()
            .is_none_or(|c| c.password() != password);
        if stale {
            self.current = Some(ChunkCipher::new(password));
        }
        self.current.as_ref().expect("cipher was just installed")
    }
}

/// One-shot chunk encryption.
pub fn encrypt_chunk(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    ChunkCipher::new(password).encrypt(plaintext)
}

/// One-shot chunk decryption.
pub fn decrypt_chunk(data: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    ChunkCipher::new(password).decrypt(data)
}
