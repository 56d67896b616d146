//! Password-derived encryption for signaling envelopes.
//!
//! A room password is stretched into a 256-bit AES-GCM key with
//! PBKDF2-HMAC-SHA256, salted with the room name. Every envelope published
//! to the relay is then sealed into a self-describing token:
//!
//! ```text
//! base64( varstring(algorithm) • varbytes(nonce) • varbytes(ciphertext) )
//! ```
//!
//! The relay never sees plaintext signaling for keyed rooms, and peers with
//! a different password simply fail to open each other's envelopes.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Algorithm name embedded in every token.
pub const ALGORITHM: &str = "AES-GCM";

/// PBKDF2 rounds used for key stretching.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Size of the derived key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Errors raised while sealing or opening a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrong key or tampered ciphertext.
    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Unknown encryption algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Decrypted payload is not valid JSON")]
    InvalidPlaintext,
}

/// Symmetric key derived from a room password.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Wrap raw key material. Mostly useful for tests and benchmarks,
    /// where running the full key stretch is too slow.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Derive the key for `(password, room_name)`.
///
/// Deterministic and deliberately slow. Call [`derive_key_async`] from async
/// code so the stretch runs on the blocking pool.
pub fn derive_key(password: &str, room_name: &str) -> CipherKey {
    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(
        password.as_bytes(),
        room_name.as_bytes(),
        PBKDF2_ITERATIONS,
        &mut bytes,
    );
    CipherKey { bytes }
}

/// [`derive_key`] on tokio's blocking pool.
pub async fn derive_key_async(password: String, room_name: String) -> Result<CipherKey, CryptoError> {
    tokio::task::spawn_blocking(move || derive_key(&password, &room_name))
        .await
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
}

/// Seal a JSON value into a base64 token. A fresh random nonce is drawn
/// on every call.
pub fn encrypt(key: &CipherKey, value: &Value) -> Result<String, CryptoError> {
    let plaintext =
        serde_json::to_vec(value).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let cipher = Aes256Gcm::new((&key.bytes).into());
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut token = Vec::with_capacity(ALGORITHM.len() + NONCE_SIZE + ciphertext.len() + 4);
    token.write_string(ALGORITHM);
    token.write_buf(&nonce_bytes);
    token.write_buf(&ciphertext);
    Ok(STANDARD.encode(token))
}

/// Open a token produced by [`encrypt`].
pub fn decrypt(key: &CipherKey, token: &str) -> Result<Value, CryptoError> {
    let raw = STANDARD
        .decode(token)
        .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
    let mut cursor = Cursor::new(&raw);

    let algorithm = cursor
        .read_string()
        .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;
    if algorithm != ALGORITHM {
        return Err(CryptoError::UnknownAlgorithm(algorithm.to_string()));
    }

    let nonce = cursor
        .read_buf()
        .map_err(|e| CryptoError::MalformedToken(e.to_string()))?
        .to_vec();
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::MalformedToken(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    let ciphertext = cursor
        .read_buf()
        .map_err(|e| CryptoError::MalformedToken(e.to_string()))?;

    let cipher = Aes256Gcm::new((&key.bytes).into());
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    serde_json::from_slice(&plaintext).map_err(|_| CryptoError::InvalidPlaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(seed: u8) -> CipherKey {
        CipherKey::from_bytes([seed; KEY_SIZE])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let k = key(7);
        let value = json!({"type": "announce", "from": "peer-a"});

        let token = encrypt(&k, &value).unwrap();
        assert_eq!(decrypt(&k, &token).unwrap(), value);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let k = key(7);
        let value = json!({"type": "announce", "from": "peer-a"});

        let a = encrypt(&k, &value).unwrap();
        let b = encrypt(&k, &value).unwrap();

        assert_ne!(a, b, "Two encryptions of the same value must differ");
        assert_eq!(decrypt(&k, &a).unwrap(), value);
        assert_eq!(decrypt(&k, &b).unwrap(), value);
    }

    #[test]
    fn test_wrong_key_fails() {
        let token = encrypt(&key(1), &json!("hello")).unwrap();
        assert_eq!(decrypt(&key(2), &token), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_unknown_algorithm() {
        let mut raw: Vec<u8> = Vec::new();
        raw.write_string("ROT13");
        raw.write_buf([0u8; NONCE_SIZE]);
        raw.write_buf([1u8, 2, 3]);
        let token = STANDARD.encode(raw);

        assert_eq!(
            decrypt(&key(1), &token),
            Err(CryptoError::UnknownAlgorithm("ROT13".into()))
        );
    }

    #[test]
    fn test_garbage_tokens() {
        let k = key(3);
        assert!(matches!(decrypt(&k, "not base64 !!"), Err(CryptoError::MalformedToken(_))));
        assert!(decrypt(&k, "").is_err());
        // Valid base64, truncated fields
        assert!(decrypt(&k, &STANDARD.encode([7u8, b'A'])).is_err());
    }

    #[test]
    fn test_short_nonce_rejected() {
        let mut raw: Vec<u8> = Vec::new();
        raw.write_string(ALGORITHM);
        raw.write_buf([0u8; 4]);
        raw.write_buf([0u8; 32]);
        let token = STANDARD.encode(raw);
        assert!(matches!(decrypt(&key(1), &token), Err(CryptoError::MalformedToken(_))));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let k = key(9);
        let token = encrypt(&k, &json!({"a": 1})).unwrap();
        let mut raw = STANDARD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        assert_eq!(decrypt(&k, &STANDARD.encode(raw)), Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_derive_key_deterministic_per_pair() {
        let a = derive_key("pw1", "secret");
        let b = derive_key("pw1", "secret");
        let c = derive_key("pw2", "secret");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let token = encrypt(&a, &json!({"x": true})).unwrap();
        assert!(decrypt(&b, &token).is_ok());
        assert!(decrypt(&c, &token).is_err());
    }

    #[test]
    fn test_debug_hides_key_material() {
        let k = key(0xAB);
        assert_eq!(format!("{k:?}"), "CipherKey(..)");
    }
}
