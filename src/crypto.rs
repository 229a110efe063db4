use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::aead::{Aead, AeadCore, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit};
use sha2::{Digest, Sha256};

use crate::error::CipherError;

pub const DEFAULT_PASSPHRASE: &str = "ZeroCloud-Secure-LAN-Communication-Key";
pub const PLACEHOLDER: &str = "[Encrypted Message]";

const NONCE_LEN: usize = 12;

/// Message-body cipher shared by every host that knows the passphrase.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl Cipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self {
            key: Sha256::digest(passphrase.as_bytes()).into(),
        }
    }

    /// base64(nonce || ciphertext), a fresh nonce per call.
    pub fn seal(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng); // 96-bits; unique per message
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(result))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CipherError> {
        let bytes = STANDARD.decode(sealed.trim()).map_err(|_| CipherError::Encoding)?;
        if bytes.len() < NONCE_LEN {
            return Err(CipherError::TooShort);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(nonce.into(), ciphertext)
            .map_err(|_| CipherError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
    }

    /// Never fails: anything that does not decrypt renders as a fixed placeholder.
    pub fn open_or_placeholder(&self, sealed: &str) -> String {
        self.open(sealed).unwrap_or_else(|e| {
            tracing::debug!("Cannot decrypt message: {}", e);
            PLACEHOLDER.to_string()
        })
    }
}

impl Default for Cipher {
    fn default() -> Self {
        Self::from_passphrase(DEFAULT_PASSPHRASE)
    }
}
