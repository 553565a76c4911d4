//! Symmetric payload encryption.
//!
//! Payloads are encrypted with AES in CBC mode, PKCS#7 padded. Each
//! ciphertext is prefixed with the 16-byte random IV it was encrypted with,
//! so a receiver holding the key needs nothing else to decrypt it.
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ IV (16 B)  │ AES-CBC ciphertext (n × 16 B) │
//! └────────────┴──────────────────────────────┘
//! ```

use std::fmt;

use aes::cipher::block_padding::{Pkcs7, UnpadError};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use rand::Rng as _;

use crate::EncodingError;

const IV_LEN: usize = 16;

/// The supported cipher algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// AES with a 128-bit key, CBC mode.
    Aes128Cbc,
    /// AES with a 256-bit key, CBC mode.
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// The name used in the `cipher+<name>` encoding segment.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "aes-128-cbc",
            Self::Aes256Cbc => "aes-256-cbc",
        }
    }

    /// Key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes256Cbc => 32,
        }
    }

    /// The algorithm matching a raw key length, if any.
    pub fn for_key_len(len: usize) -> Option<Self> {
        match len {
            16 => Some(Self::Aes128Cbc),
            32 => Some(Self::Aes256Cbc),
            _ => None,
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key and the algorithm it is used with.
///
/// Clone is cheap enough: the key is at most 32 bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherParams {
    algorithm: CipherAlgorithm,
    key: Vec<u8>,
}

impl fmt::Debug for CipherParams {
    // Keys stay out of logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherParams")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl CipherParams {
    /// Creates params from a raw key; the algorithm follows from its length.
    ///
    /// # Errors
    /// Returns [`EncodingError::Cipher`] unless the key is 16 or 32 bytes.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, EncodingError> {
        let key = key.into();
        let algorithm = CipherAlgorithm::for_key_len(key.len()).ok_or_else(|| {
            EncodingError::Cipher(format!(
                "key must be 16 or 32 bytes, got {}",
                key.len()
            ))
        })?;
        Ok(Self { algorithm, key })
    }

    /// Creates params from a base64-encoded key.
    ///
    /// # Errors
    /// Fails if the string is not valid base64 or the key has a bad length.
    pub fn from_base64_key(key: &str) -> Result<Self, EncodingError> {
        let raw = base64::engine::general_purpose::STANDARD.decode(key)?;
        Self::new(raw)
    }

    /// Generates a random key for `algorithm`.
    pub fn generate(algorithm: CipherAlgorithm) -> Self {
        let mut key = vec![0u8; algorithm.key_len()];
        rand::rng().fill(key.as_mut_slice());
        Self { algorithm, key }
    }

    /// The algorithm in use.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// The full encoding segment this cipher produces.
    pub fn encoding_segment(&self) -> String {
        format!("cipher+{}", self.algorithm)
    }

    /// Encrypts with a fresh random IV and returns `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, EncodingError> {
        let iv: [u8; IV_LEN] = rand::random();
        self.encrypt_with_iv(&iv, plaintext)
    }

    pub(crate) fn encrypt_with_iv(
        &self,
        iv: &[u8; IV_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, EncodingError> {
        let ciphertext = match self.algorithm {
            CipherAlgorithm::Aes128Cbc => {
                cbc::Encryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                    .map_err(|e| EncodingError::Cipher(e.to_string()))?
                    .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
            CipherAlgorithm::Aes256Cbc => {
                cbc::Encryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                    .map_err(|e| EncodingError::Cipher(e.to_string()))?
                    .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
            }
        };
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypts `IV || ciphertext`.
    ///
    /// # Errors
    /// Fails if the input is shorter than an IV plus one block, is not a whole
    /// number of blocks, or the padding is invalid (usually a wrong key).
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, EncodingError> {
        if data.len() < 2 * IV_LEN || data.len() % IV_LEN != 0 {
            return Err(EncodingError::Cipher(format!(
                "ciphertext length {} is not IV plus whole blocks",
                data.len()
            )));
        }
        let (iv, ciphertext) = data.split_at(IV_LEN);
        let bad_padding = |_: UnpadError| EncodingError::Cipher("invalid padding".into());
        match self.algorithm {
            CipherAlgorithm::Aes128Cbc => {
                cbc::Decryptor::<aes::Aes128>::new_from_slices(&self.key, iv)
                    .map_err(|e| EncodingError::Cipher(e.to_string()))?
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(bad_padding)
            }
            CipherAlgorithm::Aes256Cbc => {
                cbc::Decryptor::<aes::Aes256>::new_from_slices(&self.key, iv)
                    .map_err(|e| EncodingError::Cipher(e.to_string()))?
                    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                    .map_err(bad_padding)
            }
        }
    }
}
