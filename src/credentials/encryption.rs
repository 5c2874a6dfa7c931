//! AES-256-GCM sealing of credential blobs.
//!
//! Each seal uses a fresh random nonce. The master key must be 32 bytes
//! (256 bits) and is provided from an environment variable, never from disk.

use super::{Credentials, SealedCredentials};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Decodes a base64 master key and checks that it is exactly 32 bytes.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64.trim())
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Seals and opens [`Credentials`] with a single master key.
///
/// Cloning is cheap enough to hand one to every component; the key never
/// leaves process memory.
#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = validate_key(key_base64)?;
        Self::from_bytes(&key)
    }

    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Serializes and encrypts credentials under a fresh nonce.
    pub fn seal(&self, credentials: &Credentials) -> Result<SealedCredentials> {
        let plaintext =
            serde_json::to_vec(credentials).context("Failed to serialize credentials")?;

        // Never reuse a nonce under the same key
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(SealedCredentials {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
        })
    }

    /// Decrypts and deserializes a sealed blob.
    ///
    /// Fails on a wrong key, a wrong nonce, or any tampering.
    pub fn open(&self, sealed: &SealedCredentials) -> Result<Credentials> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce_bytes = BASE64.decode(&sealed.nonce).context("Failed to decode nonce")?;

        if nonce_bytes.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce_bytes.len()
            ));
        }

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        serde_json::from_slice(&plaintext).context("Decrypted credentials are malformed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn cipher(byte: u8) -> CredentialCipher {
        CredentialCipher::from_bytes(&[byte; 32]).unwrap()
    }

    fn credentials() -> Credentials {
        Credentials {
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            expires_at: Some(Utc::now() + Duration::hours(1)),
            api_secret: None,
        }
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key(&BASE64.encode([0u8; 32])).is_ok());
        assert!(validate_key(&BASE64.encode([0u8; 16])).is_err());
        assert!(validate_key(&BASE64.encode([0u8; 64])).is_err());
        assert!(validate_key("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_seal_then_open() {
        let c = cipher(0);
        let creds = credentials();

        let sealed = c.seal(&creds).unwrap();
        assert!(!sealed.ciphertext.contains("access-token"));

        assert_eq!(c.open(&sealed).unwrap(), creds);
    }

    #[test]
    fn test_nonces_differ_per_seal() {
        let c = cipher(0);
        let a = c.seal(&credentials()).unwrap();
        let b = c.seal(&credentials()).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher(0).seal(&credentials()).unwrap();
        assert!(cipher(1).open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let c = cipher(0);
        let mut sealed = c.seal(&credentials()).unwrap();

        let mut raw = BASE64.decode(&sealed.ciphertext).unwrap();
        raw[0] ^= 0xff;
        sealed.ciphertext = BASE64.encode(raw);

        assert!(c.open(&sealed).is_err());
    }

    #[test]
    fn test_swapped_nonce_fails() {
        let c = cipher(0);
        let mut sealed = c.seal(&credentials()).unwrap();
        sealed.nonce = c.seal(&credentials()).unwrap().nonce;
        assert!(c.open(&sealed).is_err());
    }
}
