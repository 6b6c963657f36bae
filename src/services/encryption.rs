use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::Engine;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for X-ray images held in remote object storage.
///
/// Sealed layout: `nonce (12 bytes) || ciphertext || tag`. Fingerprints are
/// always computed over the plaintext, never over sealed bytes.
pub struct ImageCipher {
    cipher: Aes256Gcm,
}

impl ImageCipher {
    /// Create from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self, CipherError> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_base64.trim())
            .map_err(|_| CipherError::InvalidKey)?;

        if key.len() != KEY_LEN {
            return Err(CipherError::InvalidKey);
        }

        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, image: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, image)
            .map_err(|_| CipherError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        if sealed.len() < NONCE_LEN {
            return Err(CipherError::Open);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Open)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("Invalid image key (must be 32 bytes, base64-encoded)")]
    InvalidKey,

    #[error("Failed to seal image")]
    Seal,

    #[error("Failed to open sealed image (wrong key or tampered data)")]
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        base64::engine::general_purpose::STANDARD.encode([7u8; KEY_LEN])
    }

    #[test]
    fn test_rejects_short_key() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(
            ImageCipher::from_base64_key(&short),
            Err(CipherError::InvalidKey)
        ));
    }

    #[test]
    fn test_tampered_image_fails_to_open() {
        let cipher = ImageCipher::from_base64_key(&key()).unwrap();
        let mut sealed = cipher.seal(b"png bytes").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"png bytes");

        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(cipher.open(&sealed), Err(CipherError::Open)));
    }
}
