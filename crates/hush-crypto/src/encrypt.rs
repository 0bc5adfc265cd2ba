use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand_core::{OsRng, RngCore};
use rsa::sha2::Sha256;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};

use crate::keys::KeyError;

const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

/// Generate a random 256-bit content key for one envelope.
pub fn generate_content_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt a plaintext with AES-256-GCM.
/// Returns (ciphertext, nonce).
pub fn encrypt_message(key: &[u8; 32], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), KeyError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| KeyError::Encryption(e.to_string()))?;

    Ok((ciphertext, nonce_bytes.to_vec()))
}

/// Decrypt an AES-256-GCM ciphertext.
pub fn decrypt_message(key: &[u8; 32], ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, KeyError> {
    if nonce.len() != NONCE_LEN {
        return Err(KeyError::Decryption(format!("nonce must be {} bytes", NONCE_LEN)));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| KeyError::Decryption(e.to_string()))
}

/// Encrypt a short payload as a single RSA-OAEP(SHA-256) block, base64.
/// This is what clients do for credentials and other small fields.
pub fn encrypt_block(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<String, KeyError> {
    let ciphertext = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| KeyError::Encryption(e.to_string()))?;
    Ok(BASE64.encode(ciphertext))
}

/// Seal a payload of any length for `public_key`.
///
/// Layout (base64): `RSA-OAEP(content_key) || nonce(12) || AES-256-GCM(plaintext)`.
/// The wrapped key is exactly one modulus long, which is how `open` tells an
/// envelope from a bare RSA block.
pub fn seal(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<String, KeyError> {
    let content_key = generate_content_key();
    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &content_key)
        .map_err(|e| KeyError::Encryption(e.to_string()))?;
    let (ciphertext, nonce) = encrypt_message(&content_key, plaintext)?;

    let mut out = Vec::with_capacity(wrapped.len() + nonce.len() + ciphertext.len());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Open either a bare RSA-OAEP block or a `seal` envelope.
pub fn open(private_key: &RsaPrivateKey, encoded: &str) -> Result<Vec<u8>, KeyError> {
    let data = BASE64
        .decode(encoded.trim())
        .map_err(|e| KeyError::Decryption(format!("ciphertext is not base64: {}", e)))?;
    let block = private_key.size();

    if data.len() == block {
        return private_key
            .decrypt(Oaep::new::<Sha256>(), &data)
            .map_err(|e| KeyError::Decryption(e.to_string()));
    }

    if data.len() < block + NONCE_LEN + GCM_TAG_LEN {
        return Err(KeyError::Decryption(format!(
            "ciphertext of {} bytes fits neither a {}-byte block nor an envelope",
            data.len(),
            block
        )));
    }

    let (wrapped, rest) = data.split_at(block);
    let content_key: [u8; 32] = private_key
        .decrypt(Oaep::new::<Sha256>(), wrapped)
        .map_err(|e| KeyError::Decryption(e.to_string()))?
        .try_into()
        .map_err(|_| KeyError::Decryption("wrapped content key has the wrong length".into()))?;
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    decrypt_message(&content_key, ciphertext, nonce)
}
