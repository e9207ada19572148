use std::io::Cursor;
use std::iter;
use std::str::FromStr;
use std::sync::Arc;

use age::{x25519::Identity, Decryptor, Encryptor};
use color_eyre::eyre::{eyre, Result};

/// Age identity used to encrypt sensitive columns (tokens, DPoP private
/// keys, PKCE verifiers) before they touch the database.
#[derive(Clone)]
pub struct EncryptionKey {
    key: Arc<Identity>,
}

impl EncryptionKey {
    pub fn from_env() -> Result<Self> {
        let key_str = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| eyre!("ENCRYPTION_KEY environment variable not set"))?;
        Self::from_identity_str(&key_str)
    }

    pub fn from_identity_str(key_str: &str) -> Result<Self> {
        let key = Identity::from_str(key_str.trim())
            .map_err(|e| eyre!("Failed to parse age identity: {}", e))?;
        Ok(Self { key: Arc::new(key) })
    }

    pub fn generate() -> Self {
        Self {
            key: Arc::new(Identity::generate()),
        }
    }

    /// Encrypts a string, returning base64 of the age ciphertext. The work
    /// runs on a blocking thread since age encryption is CPU bound.
    pub async fn encrypt(&self, data: &str) -> Result<String> {
        let data_vec = data.as_bytes().to_vec();
        let key = self.key.clone();

        let encrypted = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let recipient = key.to_public();
            let recipients = iter::once(&recipient as &dyn age::Recipient);
            let encryptor = Encryptor::with_recipients(recipients)
                .map_err(|e| eyre!("Failed to create encryptor: {}", e))?;

            let mut encrypted = vec![];
            let mut writer = encryptor
                .wrap_output(&mut encrypted)
                .map_err(|e| eyre!("Failed to create encrypted writer: {}", e))?;

            use std::io::Write;
            writer
                .write_all(&data_vec)
                .map_err(|e| eyre!("Failed to write data for encryption: {}", e))?;
            writer
                .finish()
                .map_err(|e| eyre!("Failed to finish encryption: {}", e))?;

            Ok(encrypted)
        })
        .await??;

        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &encrypted);
        Ok(encoded)
    }

    /// Decrypts a base64-encoded ciphertext produced by [`Self::encrypt`].
    pub async fn decrypt(&self, encrypted_base64: &str) -> Result<String> {
        let encrypted_data = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            encrypted_base64,
        )
        .map_err(|e| eyre!("Failed to decode base64 data: {}", e))?;

        let key = self.key.clone();

        let decrypted = tokio::task::spawn_blocking(move || -> Result<String> {
            let cursor = Cursor::new(encrypted_data);
            let decryptor = Decryptor::new(cursor)
                .map_err(|e| eyre!("Failed to create decryptor: {}", e))?;

            let identities = iter::once(key.as_ref() as &dyn age::Identity);
            let mut reader = decryptor
                .decrypt(identities)
                .map_err(|e| eyre!("Failed to decrypt data: {}", e))?;

            let mut decrypted = String::new();
            use std::io::Read;
            reader
                .read_to_string(&mut decrypted)
                .map_err(|e| eyre!("Failed to read decrypted data: {}", e))?;

            Ok(decrypted)
        })
        .await??;

        Ok(decrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let key = EncryptionKey::generate();

        let original = "refresh-token-material-that-must-not-be-stored-in-the-clear";

        let encrypted = key.encrypt(original).await.unwrap();
        assert_ne!(encrypted, original);

        let decrypted = key.decrypt(&encrypted).await.unwrap();
        assert_eq!(decrypted, original);
    }

    #[tokio::test]
    async fn test_decrypt_with_wrong_key_fails() {
        let key = EncryptionKey::generate();
        let other = EncryptionKey::generate();

        let encrypted = key.encrypt("secret").await.unwrap();
        assert!(other.decrypt(&encrypted).await.is_err());
    }
}
