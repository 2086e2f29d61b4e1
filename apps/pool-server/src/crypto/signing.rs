// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ed25519 envelope signing keys.
//!
//! The coordinator's private key is stored as a PKCS#8 `PRIVATE KEY` PEM;
//! consumers get the matching SPKI `PUBLIC KEY` PEM.

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use super::{CryptoError, CryptoResult};

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// Parse a PEM block and check its tag.
fn parse_pem(pem_bytes: &[u8], expected_tag: &str) -> CryptoResult<pem::Pem> {
    let pem_str = std::str::from_utf8(pem_bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid UTF-8: {}", e)))?;

    let pem = pem::parse(pem_str)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid PEM: {}", e)))?;

    if pem.tag() != expected_tag {
        return Err(CryptoError::InvalidKey(format!(
            "expected PEM tag {expected_tag:?}, found {:?}",
            pem.tag()
        )));
    }
    Ok(pem)
}

/// Coordinator-side signing key.
#[derive(Clone)]
pub struct EnvelopeSigner {
    key: SigningKey,
}

impl EnvelopeSigner {
    /// Load from a PKCS#8 PEM private key.
    pub fn from_pem(pem_bytes: &[u8]) -> CryptoResult<Self> {
        let pem = parse_pem(pem_bytes, PRIVATE_KEY_TAG)?;
        let key = SigningKey::from_pkcs8_der(pem.contents())
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid key format: {}", e)))?;
        Ok(Self { key })
    }

    /// Fresh random key. Used for local runs and tests.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn to_pem(&self) -> CryptoResult<String> {
        let der = self
            .key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(pem::encode(&pem::Pem::new(PRIVATE_KEY_TAG, der.as_bytes())))
    }

    pub fn verifier(&self) -> EnvelopeVerifier {
        EnvelopeVerifier {
            key: self.key.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Consumer-side public key.
#[derive(Clone)]
pub struct EnvelopeVerifier {
    key: VerifyingKey,
}

impl EnvelopeVerifier {
    /// Load from an SPKI PEM public key.
    pub fn from_pem(pem_bytes: &[u8]) -> CryptoResult<Self> {
        let pem = parse_pem(pem_bytes, PUBLIC_KEY_TAG)?;
        let key = VerifyingKey::from_public_key_der(pem.contents())
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid key format: {}", e)))?;
        Ok(Self { key })
    }

    pub fn to_pem(&self) -> CryptoResult<String> {
        let der = self
            .key
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(pem::encode(&pem::Pem::new(PUBLIC_KEY_TAG, der.as_bytes())))
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
        self.key
            .verify(message, &signature)
            .map_err(|_| CryptoError::BadSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trip_keeps_the_keypair() {
        let signer = EnvelopeSigner::generate();
        let private_pem = signer.to_pem().unwrap();
        let public_pem = signer.verifier().to_pem().unwrap();
        assert!(private_pem.contains("BEGIN PRIVATE KEY"));
        assert!(public_pem.contains("BEGIN PUBLIC KEY"));

        let loaded = EnvelopeSigner::from_pem(private_pem.as_bytes()).unwrap();
        let verifier = EnvelopeVerifier::from_pem(public_pem.as_bytes()).unwrap();

        let sig = loaded.sign(b"payload");
        assert!(verifier.verify(b"payload", &sig).is_ok());
    }

    #[test]
    fn verify_rejects_other_message_and_other_key() {
        let signer = EnvelopeSigner::generate();
        let sig = signer.sign(b"payload");

        assert!(signer.verifier().verify(b"payload!", &sig).is_err());
        assert!(EnvelopeSigner::generate()
            .verifier()
            .verify(b"payload", &sig)
            .is_err());
        assert!(signer.verifier().verify(b"payload", &sig[..10]).is_err());
    }

    #[test]
    fn wrong_pem_tag_is_rejected() {
        let signer = EnvelopeSigner::generate();
        let public_pem = signer.verifier().to_pem().unwrap();
        let result = EnvelopeSigner::from_pem(public_pem.as_bytes());
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
        assert!(EnvelopeVerifier::from_pem(b"garbage").is_err());
    }
}
