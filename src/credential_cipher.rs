//! At-rest encryption for profile secrets.
//!
//! Passwords are stored as base64 text of AES-128-CBC ciphertext with PKCS#7
//! padding. The key is the first 16 bytes of SHA-256 over a fixed application
//! secret and the IV is derived from the key, so the scheme is deterministic
//! and anyone holding this binary can decrypt a store file. It keeps
//! passwords out of plain sight in the profile file and nothing more.

use aes::Aes128;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;

const APP_SECRET: &[u8] = b"vpnkeeper/profile-secrets/v1";
const IV_LABEL: &[u8] = b"vpnkeeper-iv";

static APP_CIPHER: Lazy<CredentialCipher> = Lazy::new(|| CredentialCipher::with_secret(APP_SECRET));

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
  #[error("Ciphertext length {0} is not a non-zero multiple of the block size")]
  InvalidLength(usize),
  #[error("Invalid padding in decrypted data")]
  InvalidPadding,
  #[error("Ciphertext is not valid base64: {0}")]
  Encoding(String),
  #[error("Decrypted secret is not valid UTF-8")]
  Utf8,
}

#[derive(Clone)]
pub struct CredentialCipher {
  key: [u8; BLOCK_SIZE],
  iv: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for CredentialCipher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CredentialCipher").finish_non_exhaustive()
  }
}

impl CredentialCipher {
  /// The process-wide cipher keyed from the built-in application secret.
  pub fn app() -> &'static CredentialCipher {
    &APP_CIPHER
  }

  pub fn with_secret(secret: &[u8]) -> Self {
    let mut key = [0u8; BLOCK_SIZE];
    key.copy_from_slice(&Sha256::digest(secret)[..BLOCK_SIZE]);

    let mut hasher = Sha256::new();
    hasher.update(IV_LABEL);
    hasher.update(key);
    let mut iv = [0u8; BLOCK_SIZE];
    iv.copy_from_slice(&hasher.finalize()[..BLOCK_SIZE]);

    Self { key, iv }
  }

  pub fn encrypt_bytes(&self, plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
  }

  pub fn decrypt_bytes(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
      return Err(CipherError::InvalidLength(ciphertext.len()));
    }

    Aes128CbcDec::new(&self.key.into(), &self.iv.into())
      .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
      .map_err(|_| CipherError::InvalidPadding)
  }

  /// Encrypt a secret into the base64 form kept in the store file.
  pub fn encrypt(&self, plaintext: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(self.encrypt_bytes(plaintext.as_bytes()))
  }

  pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
    let raw = base64::engine::general_purpose::STANDARD
      .decode(ciphertext.trim())
      .map_err(|e| CipherError::Encoding(e.to_string()))?;
    let plaintext = self.decrypt_bytes(&raw)?;
    String::from_utf8(plaintext).map_err(|_| CipherError::Utf8)
  }
}
