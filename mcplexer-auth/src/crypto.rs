//! At-rest encryption seam
//!
//! The store only ever sees sealed bytes; everything that needs plaintext
//! goes through an [`Encryptor`]. The shipped implementation is
//! AES-256-GCM with a random 96-bit nonce prefixed to the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use crate::error::{AuthError, AuthResult};

/// Nonce length for AES-GCM
const NONCE_LEN: usize = 12;

/// Opaque byte-in/byte-out encryption
pub trait Encryptor: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> AuthResult<Vec<u8>>;
}

/// AES-256-GCM encryptor keyed from `MCPLEXER_AGE_KEY`
pub struct AesGcmEncryptor {
    cipher: Aes256Gcm,
}

impl AesGcmEncryptor {
    /// Build from a base64-encoded 32-byte key
    pub fn from_base64_key(encoded: &str) -> AuthResult<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| AuthError::crypto(format!("key is not valid base64: {e}")))?;
        if bytes.len() != 32 {
            return Err(AuthError::crypto(format!(
                "key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate a fresh random key, base64-encoded for the env var
    pub fn generate_key() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        BASE64.encode(bytes)
    }
}

impl Encryptor for AesGcmEncryptor {
    fn seal(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AuthError::crypto(format!("encrypt failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> AuthResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(AuthError::crypto("sealed bytes shorter than nonce"));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| AuthError::crypto(format!("decrypt failed: {e}")))
    }
}

/// Identity "encryptor" for tests and plaintext development setups
pub struct PlaintextEncryptor;

impl Encryptor for PlaintextEncryptor {
    fn seal(&self, plaintext: &[u8]) -> AuthResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8]) -> AuthResult<Vec<u8>> {
        Ok(sealed.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let encryptor = AesGcmEncryptor::from_base64_key(&AesGcmEncryptor::generate_key()).unwrap();
        let sealed = encryptor.seal(b"client-secret").unwrap();
        assert_ne!(sealed, b"client-secret");
        assert_eq!(encryptor.open(&sealed).unwrap(), b"client-secret");
    }

    #[test]
    fn nonce_makes_ciphertexts_differ() {
        let encryptor = AesGcmEncryptor::from_base64_key(&AesGcmEncryptor::generate_key()).unwrap();
        let a = encryptor.seal(b"same").unwrap();
        let b = encryptor.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let alice = AesGcmEncryptor::from_base64_key(&AesGcmEncryptor::generate_key()).unwrap();
        let mallory = AesGcmEncryptor::from_base64_key(&AesGcmEncryptor::generate_key()).unwrap();
        let sealed = alice.seal(b"secret").unwrap();
        assert!(mallory.open(&sealed).is_err());
    }

    #[test]
    fn bad_keys_rejected() {
        assert!(AesGcmEncryptor::from_base64_key("not base64 !!!").is_err());
        assert!(AesGcmEncryptor::from_base64_key(&BASE64.encode([0u8; 16])).is_err());
    }
}
