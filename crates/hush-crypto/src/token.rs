use std::fmt;

use aes::Aes256;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;
const TAG_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid session token")]
    InvalidToken,

    #[error("token encoding failed: {0}")]
    Encoding(String),
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    user_id: i64,
}

/// Mints and verifies bearer tokens without server-side session storage.
///
/// Wire form: base64(`iv(16) || AES-256-CBC/PKCS#7(payload) || HMAC-SHA256`).
/// Both keys are derived from one configured secret at startup and never change.
/// Tokens carry no expiry.
#[derive(Clone)]
pub struct SessionTokens {
    cipher_key: [u8; 32],
    mac_key: [u8; 32],
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionTokens { .. }")
    }
}

impl SessionTokens {
    pub fn from_secret(secret: &str) -> Self {
        let cipher_key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let mac_key: [u8; 32] = Sha256::new()
            .chain_update(b"mac:")
            .chain_update(secret.as_bytes())
            .finalize()
            .into();
        Self { cipher_key, mac_key }
    }

    pub fn mint(&self, user_id: i64) -> Result<String, TokenError> {
        let payload = serde_json::to_vec(&TokenPayload { user_id })
            .map_err(|e| TokenError::Encoding(e.to_string()))?;

        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.cipher_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&payload);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);

        let mut mac = self.mac().map_err(|e| TokenError::Encoding(e.to_string()))?;
        mac.update(&out);
        out.extend_from_slice(&mac.finalize().into_bytes());

        Ok(BASE64.encode(out))
    }

    pub fn verify(&self, token: &str) -> Result<i64, TokenError> {
        let data = BASE64
            .decode(token.trim())
            .map_err(|_| TokenError::InvalidToken)?;

        if data.len() < IV_LEN + BLOCK_LEN + TAG_LEN || (data.len() - IV_LEN - TAG_LEN) % BLOCK_LEN != 0 {
            return Err(TokenError::InvalidToken);
        }

        let (signed, tag) = data.split_at(data.len() - TAG_LEN);
        let mut mac = self.mac().map_err(|_| TokenError::InvalidToken)?;
        mac.update(signed);
        mac.verify_slice(tag).map_err(|_| TokenError::InvalidToken)?;

        let (iv, ciphertext) = signed.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| TokenError::InvalidToken)?;
        let plaintext = Aes256CbcDec::new(&self.cipher_key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TokenError::InvalidToken)?;

        let payload: TokenPayload =
            serde_json::from_slice(&plaintext).map_err(|_| TokenError::InvalidToken)?;
        Ok(payload.user_id)
    }

    fn mac(&self) -> Result<HmacSha256, hmac::digest::InvalidLength> {
        HmacSha256::new_from_slice(&self.mac_key)
    }
}
