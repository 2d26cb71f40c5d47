use std::collections::HashMap;

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use super::ArchiveError;

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

/// Decrypts the raw upload blob for a study.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, study_id: &str, data: &[u8]) -> Result<Vec<u8>, ArchiveError>;
}

/// AES-256-GCM decryptor with one key per study.
///
/// Wire framing is `[12-byte nonce][ciphertext + 16-byte tag]`; the client
/// SDK encrypts with the study's distributed key using the same layout.
pub struct AesGcmDecryptor {
    keys: HashMap<String, [u8; KEY_LENGTH]>,
}

impl AesGcmDecryptor {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn with_study_key(mut self, study_id: impl Into<String>, key: [u8; KEY_LENGTH]) -> Self {
        self.keys.insert(study_id.into(), key);
        self
    }

    /// Derive a study key from an operator-provisioned secret string.
    pub fn derive_key(secret: &str) -> [u8; KEY_LENGTH] {
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&digest);
        key
    }

    /// Encrypt plaintext under a study key with the same framing the
    /// decryptor expects. Used by fixtures and the client-side packaging
    /// path.
    pub fn encrypt(key_bytes: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, ArchiveError> {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        let cipher = Aes256Gcm::new(key);

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ArchiveError::DecryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl Default for AesGcmDecryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Decryptor for AesGcmDecryptor {
    fn decrypt(&self, study_id: &str, data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
        let key_bytes = self
            .keys
            .get(study_id)
            .ok_or_else(|| ArchiveError::MissingStudyKey(study_id.to_string()))?;

        // Nonce plus at least the GCM auth tag.
        if data.len() < NONCE_LENGTH + 16 {
            return Err(ArchiveError::Malformed("archive shorter than nonce + tag".into()));
        }

        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(&data[..NONCE_LENGTH]);

        cipher
            .decrypt(nonce, &data[NONCE_LENGTH..])
            .map_err(|_| ArchiveError::DecryptionFailed)
    }
}

/// Pass-through decryptor for tests and for studies that upload plaintext
/// archives over the already-encrypted transport.
pub struct NoopDecryptor;

impl Decryptor for NoopDecryptor {
    fn decrypt(&self, _study_id: &str, data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = AesGcmDecryptor::derive_key("study-secret");
        let decryptor = AesGcmDecryptor::new().with_study_key("cardio-flex", key);

        let plaintext = b"archive bytes here";
        let encrypted = AesGcmDecryptor::encrypt(&key, plaintext).unwrap();
        assert_ne!(&encrypted[NONCE_LENGTH..], plaintext.as_slice());

        let decrypted = decryptor.decrypt("cardio-flex", &encrypted).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn unknown_study_fails() {
        let decryptor = AesGcmDecryptor::new();
        let err = decryptor.decrypt("nope", &[0u8; 64]).unwrap_err();
        assert!(matches!(err, ArchiveError::MissingStudyKey(_)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = AesGcmDecryptor::derive_key("study-secret");
        let decryptor = AesGcmDecryptor::new().with_study_key("cardio-flex", key);

        let mut encrypted = AesGcmDecryptor::encrypt(&key, b"payload").unwrap();
        let last = encrypted.len() - 1;
        encrypted[last] ^= 0xFF;

        let err = decryptor.decrypt("cardio-flex", &encrypted).unwrap_err();
        assert!(matches!(err, ArchiveError::DecryptionFailed));
    }

    #[test]
    fn truncated_input_is_malformed() {
        let key = AesGcmDecryptor::derive_key("study-secret");
        let decryptor = AesGcmDecryptor::new().with_study_key("cardio-flex", key);
        let err = decryptor.decrypt("cardio-flex", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ArchiveError::Malformed(_)));
    }

    #[test]
    fn derive_key_is_deterministic() {
        assert_eq!(
            AesGcmDecryptor::derive_key("secret"),
            AesGcmDecryptor::derive_key("secret")
        );
        assert_ne!(
            AesGcmDecryptor::derive_key("secret"),
            AesGcmDecryptor::derive_key("other")
        );
    }
}
