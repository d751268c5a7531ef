// ABOUTME: Credential sealing: AES-256-GCM with a key derived from the server secret

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed: blob corrupt or wrong key")]
    Open,
}

/// Seals and opens small credential blobs. The sealed format is
/// `nonce || ciphertext`, nonce freshly random per seal.
#[derive(Clone)]
pub struct CredentialSealer {
    cipher: Aes256Gcm,
}

impl CredentialSealer {
    /// Derive the AES key from the configured server secret via SHA-256,
    /// so operators can use any sufficiently long passphrase.
    pub fn new(server_secret: &str) -> Self {
        let digest = Sha256::digest(server_secret.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Seal)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Open);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}
