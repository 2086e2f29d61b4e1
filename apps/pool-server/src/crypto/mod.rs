// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Envelope Cryptography
//!
//! Key material and primitives shared by the coordinator (which seals
//! withdrawal envelopes) and the execution consumer (which opens them).
//!
//! - [`signing`]: Ed25519 keys loaded from PEM. The coordinator signs, the
//!   consumer verifies.
//! - [`secret_box`]: AES-256-GCM keyed by the execution engine's pre-shared
//!   secret. Seals the per-envelope engine OTP and every leg credential.
//! - [`envelope`]: the canonical binary envelope format and the
//!   seal/open operations built on the two above.

pub mod envelope;
pub mod secret_box;
pub mod signing;

use rand::rngs::OsRng;
use rand::Rng;

pub use envelope::{
    EnvelopeLeg, EnvelopeOpener, EnvelopeSealer, OpenedEnvelope, SealBatch, WithdrawalEnvelope,
    ENVELOPE_SCHEMA_VERSION,
};
pub use secret_box::{SealedSecret, SecretBox};
pub use signing::{EnvelopeSigner, EnvelopeVerifier};

/// Number of digits in a one-time code.
pub const OTP_DIGITS: usize = 6;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("encryption failed")]
    Encrypt,

    /// Wrong key, wrong associated data or tampered ciphertext.
    #[error("decryption failed")]
    Decrypt,

    #[error("signature verification failed")]
    BadSignature,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unsupported envelope schema version {0}")]
    UnsupportedVersion(u16),
}

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Uniformly random zero-padded decimal code from the OS CSPRNG.
pub fn generate_otp() -> String {
    let code: u32 = OsRng.gen_range(0..10u32.pow(OTP_DIGITS as u32));
    format!("{code:0width$}", width = OTP_DIGITS)
}
