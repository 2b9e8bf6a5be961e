use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

pub const KEY_SIZE: usize = 32;
pub const KDF_ITERATIONS: u32 = 100_000;

/// Domain-separation salt for the chunk-encryption key.
pub const CHUNK_KEY_SALT: &[u8] = b"dropsync/chunk-key/v1";

/// Domain-separation salt for the challenge-MAC key.
pub const AUTH_KEY_SALT: &[u8] = b"dropsync/auth-key/v1";

/// PBKDF2-HMAC-SHA256 with the standard iteration count.
///
/// Public so a deployment can substitute a room-scoped salt without any
/// protocol change.
pub fn derive_key_with_salt(password: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ITERATIONS, &mut key);
    key
}

pub fn derive_chunk_key(password: &str) -> [u8; KEY_SIZE] {
    derive_key_with_salt(password, CHUNK_KEY_SALT)
}

pub fn derive_auth_key(password: &str) -> [u8; KEY_SIZE] {
    derive_key_with_salt(password, AUTH_KEY_SALT)
}
