use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand_core::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::encrypt;

pub const MIN_RSA_BITS: usize = 1024;
pub const DEFAULT_RSA_BITS: usize = 2048;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no private key stored for session {0}")]
    KeyNotFound(String),

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key vault unavailable: {0}")]
    Vault(anyhow::Error),
}

/// Transient storage for session private keys, indexed by session id.
/// Expiry and eviction belong to the implementation, not to `KeyExchange`.
pub trait KeyVault: Send + Sync {
    fn put(&self, session_id: &str, private_key_pem: &str) -> anyhow::Result<()>;
    fn get(&self, session_id: &str) -> anyhow::Result<Option<String>>;
}

/// Process-local vault. Keys live until the process exits.
#[derive(Default)]
pub struct MemoryKeyVault {
    keys: Mutex<HashMap<String, String>>,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyVault for MemoryKeyVault {
    fn put(&self, session_id: &str, private_key_pem: &str) -> anyhow::Result<()> {
        let mut keys = self.keys.lock().map_err(|e| anyhow::anyhow!("Key vault lock poisoned: {}", e))?;
        keys.insert(session_id.to_string(), private_key_pem.to_string());
        Ok(())
    }

    fn get(&self, session_id: &str) -> anyhow::Result<Option<String>> {
        let keys = self.keys.lock().map_err(|e| anyhow::anyhow!("Key vault lock poisoned: {}", e))?;
        Ok(keys.get(session_id).cloned())
    }
}

/// Issues ephemeral RSA keypairs and decrypts what clients encrypt with them.
#[derive(Clone)]
pub struct KeyExchange {
    vault: Arc<dyn KeyVault>,
    bits: usize,
}

impl KeyExchange {
    pub fn new(vault: Arc<dyn KeyVault>, bits: usize) -> Self {
        Self {
            vault,
            bits: bits.max(MIN_RSA_BITS),
        }
    }

    /// Generate a keypair, keep the private half under a fresh session id and
    /// return `(session_id, public_key_pem)`.
    pub fn issue_keypair(&self) -> Result<(String, String), KeyError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, self.bits)
            .map_err(|e| KeyError::Encryption(format!("key generation failed: {}", e)))?;
        let public_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encryption(e.to_string()))?;
        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encryption(e.to_string()))?;

        let session_id = Uuid::new_v4().to_string();
        self.vault
            .put(&session_id, private_pem.as_str())
            .map_err(KeyError::Vault)?;

        debug!("Issued {}-bit session keypair {}", self.bits, session_id);
        Ok((session_id, public_pem))
    }

    /// Public half of an existing session's keypair.
    pub fn public_key_of(&self, session_id: &str) -> Result<String, KeyError> {
        let private_key = self.private_key(session_id)?;
        RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encryption(e.to_string()))
    }

    /// Decrypt a base64 ciphertext produced for the session's public key.
    pub fn decrypt(&self, session_id: &str, ciphertext: &str) -> Result<Vec<u8>, KeyError> {
        let private_key = self.private_key(session_id)?;
        encrypt::open(&private_key, ciphertext)
    }

    pub fn decrypt_text(&self, session_id: &str, ciphertext: &str) -> Result<String, KeyError> {
        let bytes = self.decrypt(session_id, ciphertext)?;
        String::from_utf8(bytes).map_err(|_| KeyError::Decryption("plaintext is not UTF-8".into()))
    }

    /// Seal `plaintext` for the holder of `public_key_pem`.
    pub fn encrypt_for(&self, public_key_pem: &str, plaintext: &[u8]) -> Result<String, KeyError> {
        encrypt_for(public_key_pem, plaintext)
    }

    fn private_key(&self, session_id: &str) -> Result<RsaPrivateKey, KeyError> {
        let pem = self
            .vault
            .get(session_id)
            .map_err(KeyError::Vault)?
            .ok_or_else(|| KeyError::KeyNotFound(session_id.to_string()))?;

        RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| KeyError::Decryption(format!("stored key for {} is unreadable: {}", session_id, e)))
    }
}

/// Parse an SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`) PEM.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, KeyError> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| KeyError::InvalidKey(e.to_string()))
}

pub fn encrypt_for(public_key_pem: &str, plaintext: &[u8]) -> Result<String, KeyError> {
    let public_key = parse_public_key(public_key_pem)?;
    encrypt::seal(&public_key, plaintext)
}
