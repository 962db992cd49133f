//! AES-256-GCM sealing for the persisted cache file.
//!
//! On disk the cache is one JSON object:
//! ```json
//! { "nonce": "<base64>", "ciphertext": "<base64>", "version": 1 }
//! ```
//!
//! The key is fixed (SHA-256 of a constant label). This keeps casual
//! readers out of the file; it is not a secret store.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CacheError;

/// Nonce size for AES-GCM (96 bits)
const NONCE_SIZE: usize = 12;

const KEY_LABEL: &[u8] = b"bridgehub/cache/at-rest/v1";

/// Current envelope version
pub const CACHE_FORMAT_VERSION: u8 = 1;

/// Encrypted envelope stored on disk
#[derive(Debug, Serialize, Deserialize)]
pub struct SealedCache {
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext
    pub ciphertext: String,
    /// Format version
    pub version: u8,
}

fn cipher() -> Aes256Gcm {
    let key: [u8; 32] = Sha256::digest(KEY_LABEL).into();
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key))
}

/// Encrypt `plaintext` under the fixed cache key with a random nonce
pub fn seal(plaintext: &[u8]) -> Result<SealedCache, CacheError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher()
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CacheError::Crypto(format!("encryption failed: {e}")))?;

    Ok(SealedCache {
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(ciphertext),
        version: CACHE_FORMAT_VERSION,
    })
}

/// Decrypt an envelope produced by [`seal`]
pub fn open(sealed: &SealedCache) -> Result<Vec<u8>, CacheError> {
    if sealed.version != CACHE_FORMAT_VERSION {
        return Err(CacheError::Crypto(format!(
            "unsupported cache format version {}",
            sealed.version
        )));
    }

    let nonce_bytes = BASE64
        .decode(&sealed.nonce)
        .map_err(|e| CacheError::Crypto(format!("invalid nonce encoding: {e}")))?;
    if nonce_bytes.len() != NONCE_SIZE {
        return Err(CacheError::Crypto(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce_bytes.len()
        )));
    }
    let ciphertext = BASE64
        .decode(&sealed.ciphertext)
        .map_err(|e| CacheError::Crypto(format!("invalid ciphertext encoding: {e}")))?;

    cipher()
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|e| CacheError::Crypto(format!("decryption failed: {e}")))
}
