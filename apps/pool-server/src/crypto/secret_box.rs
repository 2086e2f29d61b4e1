// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! AES-256-GCM sealing under the execution engine's pre-shared secret.
//!
//! Every seal draws a fresh 96-bit nonce from the OS RNG and ships it next
//! to the ciphertext. Associated data binds a ciphertext to what it belongs
//! to, so a credential sealed for one leg cannot be replayed as another's.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64ct::{Base64, Encoding};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use super::{CryptoError, CryptoResult};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Nonce plus ciphertext (with the GCM tag appended).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    #[serde(with = "b64_nonce")]
    pub nonce: [u8; NONCE_LEN],
    #[serde(with = "b64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl SealedSecret {
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }
}

/// Symmetric AEAD keyed by a 32-byte pre-shared secret.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    pub fn from_bytes(key: &[u8]) -> CryptoResult<Self> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "engine secret must be {KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Parse a standard-alphabet base64 key (surrounding whitespace ignored).
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        let key = Base64::decode_vec(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("invalid base64: {e}")))?;
        Self::from_bytes(&key)
    }

    /// Fresh random key, base64 encoded.
    pub fn generate_key_base64() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Base64::encode_string(&key)
    }

    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> CryptoResult<SealedSecret> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(SealedSecret { nonce, ciphertext })
    }

    pub fn open(&self, sealed: &SealedSecret, aad: &[u8]) -> CryptoResult<Vec<u8>> {
        self.cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Open and decode as UTF-8.
    pub fn open_string(&self, sealed: &SealedSecret, aad: &[u8]) -> CryptoResult<String> {
        let bytes = self.open(sealed, aad)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::Decrypt)
    }
}

mod b64_bytes {
    use base64ct::{Base64, Encoding};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Base64::decode_vec(&encoded).map_err(de::Error::custom)
    }
}

mod b64_nonce {
    use super::NONCE_LEN;
    use base64ct::{Base64, Encoding};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        nonce: &[u8; NONCE_LEN],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&Base64::encode_string(nonce))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; NONCE_LEN], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = Base64::decode_vec(&encoded).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("nonce must be 12 bytes"))
    }
}
