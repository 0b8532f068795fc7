use crate::errors::{AppError, AppResult};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;

const CIPHERTEXT_PREFIX: &str = "v1";
const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for OAuth tokens at rest.
///
/// Sealed values look like `v1:<nonce>:<ciphertext>`, both parts standard base64.
#[derive(Clone)]
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; 32]) -> AppResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|error| AppError::Crypto(error.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn from_base64_key(encoded: &str) -> AppResult<Self> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|error| AppError::Config(format!("TOKEN_ENCRYPTION_KEY is not base64: {}", error)))?;
        if decoded.len() != 32 {
            return Err(AppError::Config(format!(
                "TOKEN_ENCRYPTION_KEY must decode to 32 bytes, got {}",
                decoded.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Self::new(&key)
    }

    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let encrypted = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|error| AppError::Crypto(error.to_string()))?;
        let engine = base64::engine::general_purpose::STANDARD;
        Ok(format!(
            "{}:{}:{}",
            CIPHERTEXT_PREFIX,
            engine.encode(nonce_bytes),
            engine.encode(encrypted)
        ))
    }

    pub fn decrypt(&self, sealed: &str) -> AppResult<String> {
        let mut parts = sealed.splitn(3, ':');
        let (Some(prefix), Some(nonce_raw), Some(ciphertext_raw)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AppError::Crypto("malformed sealed token".to_string()));
        };
        if prefix != CIPHERTEXT_PREFIX {
            return Err(AppError::Crypto(format!("unsupported token format '{}'", prefix)));
        }

        let engine = base64::engine::general_purpose::STANDARD;
        let nonce_bytes = engine
            .decode(nonce_raw)
            .map_err(|error| AppError::Crypto(error.to_string()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(AppError::Crypto("bad nonce length".to_string()));
        }
        let ciphertext = engine
            .decode(ciphertext_raw)
            .map_err(|error| AppError::Crypto(error.to_string()))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| AppError::Crypto("token decryption failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|error| AppError::Crypto(error.to_string()))
    }
}
