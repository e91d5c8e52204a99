// Aglogen Assistant — API key encryption
//
// Provider API keys are stored as Fernet tokens, so keys written by other
// services sharing the same secret stay readable.

use fernet::Fernet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("Encryption key must be set. Generate one with: aglogen-assistant keygen")]
    MissingKey,
    #[error("Invalid encryption key format: expected 32 url-safe base64 encoded bytes")]
    InvalidKey,
    #[error("Cannot encrypt empty value. API key must be provided.")]
    EmptyPlaintext,
    #[error("Cannot decrypt empty value. Encrypted API key must be provided.")]
    EmptyCiphertext,
    #[error("Failed to decrypt API key. The encryption key may have changed or the data was tampered with.")]
    InvalidToken,
    #[error("Decrypted API key is not valid UTF-8")]
    InvalidUtf8,
}

pub struct ApiKeyEncryption {
    fernet: Fernet,
}

impl ApiKeyEncryption {
    pub fn new(key: &str) -> Result<Self, EncryptionError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(EncryptionError::MissingKey);
        }
        let fernet = Fernet::new(key).ok_or(EncryptionError::InvalidKey)?;
        Ok(Self { fernet })
    }

    pub fn encrypt(&self, plain_text: &str) -> Result<String, EncryptionError> {
        if plain_text.is_empty() {
            return Err(EncryptionError::EmptyPlaintext);
        }
        Ok(self.fernet.encrypt(plain_text.as_bytes()))
    }

    pub fn decrypt(&self, cipher_text: &str) -> Result<String, EncryptionError> {
        if cipher_text.is_empty() {
            return Err(EncryptionError::EmptyCiphertext);
        }
        let bytes = self
            .fernet
            .decrypt(cipher_text)
            .map_err(|_| EncryptionError::InvalidToken)?;
        String::from_utf8(bytes).map_err(|_| EncryptionError::InvalidUtf8)
    }

    pub fn generate_key() -> String {
        Fernet::generate_key()
    }
}

impl std::fmt::Debug for ApiKeyEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKeyEncryption { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let enc = ApiKeyEncryption::new(&ApiKeyEncryption::generate_key()).unwrap();
        let token = enc.encrypt("sk-test-123").unwrap();
        assert_ne!(token, "sk-test-123");
        assert_eq!(enc.decrypt(&token).unwrap(), "sk-test-123");
    }

    #[test]
    fn test_key_validation() {
        assert_eq!(ApiKeyEncryption::new("").unwrap_err(), EncryptionError::MissingKey);
        assert_eq!(ApiKeyEncryption::new("not-a-key").unwrap_err(), EncryptionError::InvalidKey);
    }

    #[test]
    fn test_empty_inputs() {
        let enc = ApiKeyEncryption::new(&ApiKeyEncryption::generate_key()).unwrap();
        assert_eq!(enc.encrypt("").unwrap_err(), EncryptionError::EmptyPlaintext);
        assert_eq!(enc.decrypt("").unwrap_err(), EncryptionError::EmptyCiphertext);
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let a = ApiKeyEncryption::new(&ApiKeyEncryption::generate_key()).unwrap();
        let b = ApiKeyEncryption::new(&ApiKeyEncryption::generate_key()).unwrap();
        let token = a.encrypt("secret").unwrap();
        let err = b.decrypt(&token).unwrap_err();
        assert_eq!(err, EncryptionError::InvalidToken);
        assert!(err.to_string().contains("tampered"));
        assert_eq!(a.decrypt("garbage").unwrap_err(), EncryptionError::InvalidToken);
    }
}
