//! Payload envelope encryption keyed by a KMS-issued data key.
//!
//! The agent requests encryption during handshake by naming a KMS key. The
//! client fetches a 64-byte data key from KMS and splits it: the first 32
//! bytes are the agent's encryption key (the client decrypts agent traffic
//! with it), the second 32 bytes are the client's encryption key (the client
//! encrypts its own payloads with it). Both halves drive AES-256-GCM with a
//! random 12-byte nonce prefixed to each ciphertext. The KMS-wrapped form of
//! the same key travels back to the agent inside the handshake response so
//! both sides end up with identical material.

use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};

/// Size of the data key fetched from KMS. The 64-byte key is split into two
/// 32-byte AES-256 halves, one per direction.
pub const KMS_KEY_SIZE_IN_BYTES: usize = 64;

/// AES-GCM nonce length prefixed to every ciphertext.
pub const NONCE_SIZE: usize = 12;

/// Encryption-context key carrying the session id.
pub const CONTEXT_SESSION_ID: &str = "aws:ssm:SessionId";
/// Encryption-context key carrying the target instance id.
pub const CONTEXT_TARGET_ID: &str = "aws:ssm:TargetId";

/// A data key as returned by KMS `GenerateDataKey`.
#[derive(Debug, Clone)]
pub struct GeneratedDataKey {
    /// The key wrapped under the KMS key, opaque to the client.
    pub ciphertext_blob: Vec<u8>,
    /// The plaintext key material, [`KMS_KEY_SIZE_IN_BYTES`] long.
    pub plaintext: Vec<u8>,
}

/// Source of KMS data keys.
///
/// The production implementation calls KMS; tests supply fixed material.
#[async_trait]
pub trait DataKeyProvider: Send + Sync {
    /// Generates a [`KMS_KEY_SIZE_IN_BYTES`]-byte data key under `kms_key_id`
    /// bound to the given encryption context.
    async fn generate_data_key(
        &self,
        kms_key_id: &str,
        encryption_context: &HashMap<String, String>,
    ) -> Result<GeneratedDataKey>;
}

/// Authenticated payload encrypter/decrypter for one session.
pub struct Encrypter {
    cipher_text_key: Vec<u8>,
    /// Client half, used to encrypt client-to-agent payloads.
    encryption_cipher: Aes256Gcm,
    /// Agent half, used to decrypt agent-to-client payloads.
    decryption_cipher: Aes256Gcm,
}

impl Encrypter {
    /// Fetches a fresh data key for the session and builds the encrypter.
    pub async fn new(
        provider: &dyn DataKeyProvider,
        kms_key_id: &str,
        session_id: &str,
        target_id: &str,
    ) -> Result<Self> {
        let mut encryption_context = HashMap::new();
        encryption_context.insert(CONTEXT_SESSION_ID.to_string(), session_id.to_string());
        encryption_context.insert(CONTEXT_TARGET_ID.to_string(), target_id.to_string());

        let data_key = provider
            .generate_data_key(kms_key_id, &encryption_context)
            .await?;
        Self::from_data_key(data_key)
    }

    /// Builds the encrypter from already-fetched key material.
    pub fn from_data_key(data_key: GeneratedDataKey) -> Result<Self> {
        if data_key.plaintext.len() != KMS_KEY_SIZE_IN_BYTES {
            return Err(ProtocolError::DataKey(format!(
                "expected a {}-byte data key, got {} bytes",
                KMS_KEY_SIZE_IN_BYTES,
                data_key.plaintext.len()
            )));
        }

        let (agent_half, client_half) = data_key.plaintext.split_at(KMS_KEY_SIZE_IN_BYTES / 2);
        let decryption_cipher = Aes256Gcm::new_from_slice(agent_half)
            .map_err(|e| ProtocolError::Crypto(format!("invalid agent key half: {e}")))?;
        let encryption_cipher = Aes256Gcm::new_from_slice(client_half)
            .map_err(|e| ProtocolError::Crypto(format!("invalid client key half: {e}")))?;

        Ok(Self {
            cipher_text_key: data_key.ciphertext_blob,
            encryption_cipher,
            decryption_cipher,
        })
    }

    /// The KMS-wrapped data key, sent verbatim in the handshake response.
    pub fn encrypted_data_key(&self) -> &[u8] {
        &self.cipher_text_key
    }

    /// Encrypts a payload with the client key half. Output is the nonce
    /// followed by the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .encryption_cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| ProtocolError::Crypto("payload encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts a nonce-prefixed ciphertext with the agent key half.
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() < NONCE_SIZE {
            return Err(ProtocolError::Crypto(format!(
                "ciphertext shorter than the {NONCE_SIZE}-byte nonce"
            )));
        }
        let (nonce_bytes, ciphertext) = input.split_at(NONCE_SIZE);
        self.decryption_cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| ProtocolError::Crypto("payload decryption failed".to_string()))
    }
}

impl std::fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encrypter")
            .field("cipher_text_key_len", &self.cipher_text_key.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_key(material: [u8; KMS_KEY_SIZE_IN_BYTES]) -> GeneratedDataKey {
        GeneratedDataKey {
            ciphertext_blob: b"wrapped-key".to_vec(),
            plaintext: material.to_vec(),
        }
    }

    /// Builds the agent's view of the same key: halves swapped so its
    /// encrypt output is decryptable by the client and vice versa.
    fn agent_view(material: [u8; KMS_KEY_SIZE_IN_BYTES]) -> Encrypter {
        let mut swapped = [0u8; KMS_KEY_SIZE_IN_BYTES];
        swapped[..32].copy_from_slice(&material[32..]);
        swapped[32..].copy_from_slice(&material[..32]);
        Encrypter::from_data_key(data_key(swapped)).unwrap()
    }

    fn key_material() -> [u8; KMS_KEY_SIZE_IN_BYTES] {
        let mut material = [0u8; KMS_KEY_SIZE_IN_BYTES];
        for (i, byte) in material.iter_mut().enumerate() {
            *byte = i as u8;
        }
        material
    }

    #[test]
    fn test_rejects_wrong_key_size() {
        let short = GeneratedDataKey {
            ciphertext_blob: Vec::new(),
            plaintext: vec![0u8; 32],
        };
        assert!(matches!(
            Encrypter::from_data_key(short).unwrap_err(),
            ProtocolError::DataKey(_)
        ));
    }

    #[test]
    fn test_encrypted_data_key_is_the_wrapped_blob() {
        let encrypter = Encrypter::from_data_key(data_key(key_material())).unwrap();
        assert_eq!(encrypter.encrypted_data_key(), b"wrapped-key");
    }

    #[test]
    fn test_client_encrypts_agent_decrypts() {
        let material = key_material();
        let client = Encrypter::from_data_key(data_key(material)).unwrap();
        let agent = agent_view(material);

        let ciphertext = client.encrypt(b"keystrokes").unwrap();
        assert_ne!(&ciphertext[NONCE_SIZE..], b"keystrokes");
        assert_eq!(agent.decrypt(&ciphertext).unwrap(), b"keystrokes");
    }

    #[test]
    fn test_agent_encrypts_client_decrypts() {
        let material = key_material();
        let client = Encrypter::from_data_key(data_key(material)).unwrap();
        let agent = agent_view(material);

        let ciphertext = agent.encrypt(b"shell output").unwrap();
        assert_eq!(client.decrypt(&ciphertext).unwrap(), b"shell output");
    }

    #[test]
    fn test_nonces_are_unique_per_encryption() {
        let client = Encrypter::from_data_key(data_key(key_material())).unwrap();
        let a = client.encrypt(b"same").unwrap();
        let b = client.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let material = key_material();
        let client = Encrypter::from_data_key(data_key(material)).unwrap();
        let agent = agent_view(material);

        let mut ciphertext = client.encrypt(b"payload").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 1;
        assert!(matches!(
            agent.decrypt(&ciphertext).unwrap_err(),
            ProtocolError::Crypto(_)
        ));
    }

    #[test]
    fn test_decrypt_rejects_truncated_input() {
        let client = Encrypter::from_data_key(data_key(key_material())).unwrap();
        assert!(client.decrypt(&[0u8; NONCE_SIZE - 1]).is_err());
    }

    #[tokio::test]
    async fn test_new_passes_session_context_to_provider() {
        use std::sync::Mutex;

        struct RecordingProvider {
            seen: Mutex<Option<(String, HashMap<String, String>)>>,
        }

        #[async_trait]
        impl DataKeyProvider for RecordingProvider {
            async fn generate_data_key(
                &self,
                kms_key_id: &str,
                encryption_context: &HashMap<String, String>,
            ) -> Result<GeneratedDataKey> {
                *self.seen.lock().unwrap() =
                    Some((kms_key_id.to_string(), encryption_context.clone()));
                Ok(GeneratedDataKey {
                    ciphertext_blob: vec![9; 16],
                    plaintext: vec![7; KMS_KEY_SIZE_IN_BYTES],
                })
            }
        }

        let provider = RecordingProvider {
            seen: Mutex::new(None),
        };
        let encrypter = Encrypter::new(&provider, "alias/key", "sess-1", "i-123")
            .await
            .unwrap();
        assert_eq!(encrypter.encrypted_data_key(), &[9; 16]);

        let (key_id, context) = provider.seen.lock().unwrap().clone().unwrap();
        assert_eq!(key_id, "alias/key");
        assert_eq!(context.get(CONTEXT_SESSION_ID).unwrap(), "sess-1");
        assert_eq!(context.get(CONTEXT_TARGET_ID).unwrap(), "i-123");
    }
}
