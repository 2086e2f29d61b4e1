// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Withdrawal Envelope
//!
//! The signed, partially encrypted message that tells the execution engine
//! which legs to pay out.
//!
//! ## Wire Format
//!
//! All integers are big-endian. Variable-length fields carry a `u32` length
//! prefix.
//!
//! ```text
//! magic "PLWE" | version u16 | transaction_id [16] | customer_id [16]
//! | track u8 | timestamp_ms i64 | idempotency_token [16]
//! | otp_nonce [12] | otp_ciphertext (len-prefixed)
//! | leg_count u32 | legs...
//! | signature (len-prefixed)
//!
//! leg = leg_id [16] | entry_id [16] | amount_cents i64
//!     | credential_nonce [12] | credential_ciphertext (len-prefixed)
//! ```
//!
//! The Ed25519 signature covers every byte before the signature field, so
//! changing any other field invalidates it. Decoding rejects unknown
//! versions and trailing bytes.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::secret_box::{SealedSecret, NONCE_LEN};
use super::signing::{EnvelopeSigner, EnvelopeVerifier};
use super::{generate_otp, CryptoError, CryptoResult, SecretBox};
use crate::models::Track;

pub const ENVELOPE_SCHEMA_VERSION: u16 = 1;

const MAGIC: &[u8; 4] = b"PLWE";

/// Smallest possible encoded leg.
const MIN_LEG_LEN: usize = 16 + 16 + 8 + NONCE_LEN + 4;

/// One leg instruction inside an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeLeg {
    pub leg_id: Uuid,
    /// Ledger entry the execution result is written back to.
    pub entry_id: Uuid,
    /// Positive payout amount.
    pub amount_cents: i64,
    /// Venue credential, sealed under the engine secret with the leg id as
    /// associated data.
    pub credential: SealedSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalEnvelope {
    pub schema_version: u16,
    /// Parent reference of the ledger batch.
    pub transaction_id: Uuid,
    pub customer_id: Uuid,
    pub track: Track,
    /// Millisecond precision.
    pub timestamp: DateTime<Utc>,
    /// Broker dedup token.
    pub idempotency_token: Uuid,
    /// Engine OTP sealed with the transaction id as associated data.
    pub otp: SealedSecret,
    pub legs: Vec<EnvelopeLeg>,
    pub signature: Vec<u8>,
}

impl WithdrawalEnvelope {
    /// Canonical encoding of everything except the signature.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.legs.len() * 96);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&self.schema_version.to_be_bytes());
        buf.extend_from_slice(self.transaction_id.as_bytes());
        buf.extend_from_slice(self.customer_id.as_bytes());
        buf.push(self.track.as_byte());
        buf.extend_from_slice(&self.timestamp.timestamp_millis().to_be_bytes());
        buf.extend_from_slice(self.idempotency_token.as_bytes());
        put_sealed(&mut buf, &self.otp);
        buf.extend_from_slice(&(self.legs.len() as u32).to_be_bytes());
        for leg in &self.legs {
            buf.extend_from_slice(leg.leg_id.as_bytes());
            buf.extend_from_slice(leg.entry_id.as_bytes());
            buf.extend_from_slice(&leg.amount_cents.to_be_bytes());
            put_sealed(&mut buf, &leg.credential);
        }
        buf
    }

    /// Full encoding including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.signable_bytes();
        put_bytes(&mut buf, &self.signature);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let mut r = Reader::new(bytes);

        if r.take(MAGIC.len())? != MAGIC {
            return Err(CryptoError::Malformed("bad magic".into()));
        }
        let schema_version = r.u16()?;
        if schema_version != ENVELOPE_SCHEMA_VERSION {
            return Err(CryptoError::UnsupportedVersion(schema_version));
        }

        let transaction_id = r.uuid()?;
        let customer_id = r.uuid()?;
        let track = Track::from_byte(r.u8()?)
            .ok_or_else(|| CryptoError::Malformed("unknown track".into()))?;
        let timestamp = DateTime::from_timestamp_millis(r.i64()?)
            .ok_or_else(|| CryptoError::Malformed("timestamp out of range".into()))?;
        let idempotency_token = r.uuid()?;
        let otp = r.sealed()?;

        let count = r.u32()? as usize;
        if count > r.remaining() / MIN_LEG_LEN {
            return Err(CryptoError::Malformed("leg count exceeds payload".into()));
        }
        let mut legs = Vec::with_capacity(count);
        for _ in 0..count {
            legs.push(EnvelopeLeg {
                leg_id: r.uuid()?,
                entry_id: r.uuid()?,
                amount_cents: r.i64()?,
                credential: r.sealed()?,
            });
        }

        let signature = r.bytes()?.to_vec();
        if r.remaining() != 0 {
            return Err(CryptoError::Malformed("trailing bytes".into()));
        }

        Ok(Self {
            schema_version,
            transaction_id,
            customer_id,
            track,
            timestamp,
            idempotency_token,
            otp,
            legs,
            signature,
        })
    }

    pub fn total_cents(&self) -> i64 {
        self.legs.iter().map(|l| l.amount_cents).sum()
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn put_sealed(buf: &mut Vec<u8>, sealed: &SealedSecret) {
    buf.extend_from_slice(&sealed.nonce);
    put_bytes(buf, &sealed.ciphertext);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> CryptoResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(CryptoError::Malformed("truncated".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> CryptoResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> CryptoResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> CryptoResult<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> CryptoResult<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> CryptoResult<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn uuid(&mut self) -> CryptoResult<Uuid> {
        Ok(Uuid::from_bytes(self.array()?))
    }

    fn bytes(&mut self) -> CryptoResult<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn sealed(&mut self) -> CryptoResult<SealedSecret> {
        let nonce = self.array()?;
        let ciphertext = self.bytes()?.to_vec();
        Ok(SealedSecret { nonce, ciphertext })
    }
}

// =============================================================================
// Seal / Open
// =============================================================================

/// A committed ledger batch ready to be sealed.
#[derive(Debug, Clone)]
pub struct SealBatch {
    pub transaction_id: Uuid,
    pub customer_id: Uuid,
    pub track: Track,
    pub legs: Vec<EnvelopeLeg>,
}

/// Coordinator side: signs envelopes and encrypts the engine OTP.
pub struct EnvelopeSealer {
    signer: EnvelopeSigner,
    engine_box: SecretBox,
}

impl EnvelopeSealer {
    pub fn new(signer: EnvelopeSigner, engine_box: SecretBox) -> Self {
        Self { signer, engine_box }
    }

    /// Build and sign an envelope for `batch`.
    ///
    /// Each call generates a fresh engine OTP and nonce, so two seals of the
    /// same batch differ byte-wise; the broker dedups them by
    /// `idempotency_token`.
    pub fn seal(
        &self,
        batch: SealBatch,
        idempotency_token: Uuid,
    ) -> CryptoResult<WithdrawalEnvelope> {
        let engine_otp = generate_otp();
        let otp = self
            .engine_box
            .seal(engine_otp.as_bytes(), batch.transaction_id.as_bytes())?;

        let now_ms = Utc::now().timestamp_millis();
        let timestamp = DateTime::from_timestamp_millis(now_ms).unwrap_or_default();

        let mut envelope = WithdrawalEnvelope {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            transaction_id: batch.transaction_id,
            customer_id: batch.customer_id,
            track: batch.track,
            timestamp,
            idempotency_token,
            otp,
            legs: batch.legs,
            signature: Vec::new(),
        };
        envelope.signature = self.signer.sign(&envelope.signable_bytes()).to_vec();
        Ok(envelope)
    }
}

/// A verified envelope plus its decrypted engine OTP.
#[derive(Debug, Clone)]
pub struct OpenedEnvelope {
    pub envelope: WithdrawalEnvelope,
    pub otp: String,
}

/// Consumer side: verifies before trusting any field, then decrypts.
pub struct EnvelopeOpener {
    verifier: EnvelopeVerifier,
    engine_box: SecretBox,
}

impl EnvelopeOpener {
    pub fn new(verifier: EnvelopeVerifier, engine_box: SecretBox) -> Self {
        Self {
            verifier,
            engine_box,
        }
    }

    pub fn open(&self, bytes: &[u8]) -> CryptoResult<OpenedEnvelope> {
        let envelope = WithdrawalEnvelope::from_bytes(bytes)?;
        self.verifier
            .verify(&envelope.signable_bytes(), &envelope.signature)?;
        let otp = self
            .engine_box
            .open_string(&envelope.otp, envelope.transaction_id.as_bytes())?;
        Ok(OpenedEnvelope { envelope, otp })
    }

    /// Decrypt one leg's venue credential.
    pub fn credential(&self, leg: &EnvelopeLeg) -> CryptoResult<String> {
        self.engine_box
            .open_string(&leg.credential, leg.leg_id.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Keys {
        sealer: EnvelopeSealer,
        opener: EnvelopeOpener,
        engine_box: SecretBox,
    }

    fn keys() -> Keys {
        let signer = EnvelopeSigner::generate();
        let verifier = signer.verifier();
        let engine_key = SecretBox::generate_key_base64();
        let engine_box = SecretBox::from_base64(&engine_key).unwrap();
        Keys {
            sealer: EnvelopeSealer::new(signer, engine_box.clone()),
            opener: EnvelopeOpener::new(verifier, engine_box.clone()),
            engine_box,
        }
    }

    fn batch(engine_box: &SecretBox) -> SealBatch {
        let legs = [3000, 7000]
            .into_iter()
            .map(|amount| {
                let leg_id = Uuid::new_v4();
                EnvelopeLeg {
                    leg_id,
                    entry_id: Uuid::new_v4(),
                    amount_cents: amount,
                    credential: engine_box
                        .seal(format!("pass-{amount}").as_bytes(), leg_id.as_bytes())
                        .unwrap(),
                }
            })
            .collect();
        SealBatch {
            transaction_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            track: Track::Real,
            legs,
        }
    }

    #[test]
    fn sealed_envelope_opens_and_decrypts() {
        let k = keys();
        let token = Uuid::new_v4();
        let envelope = k.sealer.seal(batch(&k.engine_box), token).unwrap();

        let opened = k.opener.open(&envelope.to_bytes()).unwrap();
        assert_eq!(opened.envelope, envelope);
        assert_eq!(opened.envelope.idempotency_token, token);
        assert_eq!(opened.otp.len(), 6);
        assert_eq!(opened.envelope.total_cents(), 10_000);
        assert_eq!(
            k.opener.credential(&opened.envelope.legs[1]).unwrap(),
            "pass-7000"
        );
    }

    #[test]
    fn flipping_any_bit_in_the_leg_list_breaks_the_signature() {
        let k = keys();
        let envelope = k.sealer.seal(batch(&k.engine_box), Uuid::new_v4()).unwrap();
        let bytes = envelope.to_bytes();

        // Legs start after the header and the sealed OTP.
        let header = 4 + 2 + 16 + 16 + 1 + 8 + 16;
        let legs_start = header + NONCE_LEN + 4 + envelope.otp.ciphertext.len() + 4;
        let legs_end = bytes.len() - 4 - envelope.signature.len();

        for pos in legs_start..legs_end {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[pos] ^= 1 << bit;
                assert!(
                    k.opener.open(&tampered).is_err(),
                    "bit {bit} at byte {pos} went unnoticed"
                );
            }
        }
    }

    #[test]
    fn amount_change_is_detected() {
        let k = keys();
        let mut envelope = k.sealer.seal(batch(&k.engine_box), Uuid::new_v4()).unwrap();
        envelope.legs[0].amount_cents += 1;
        assert!(matches!(
            k.opener.open(&envelope.to_bytes()),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn foreign_signer_is_rejected() {
        let k = keys();
        let other = EnvelopeSealer::new(EnvelopeSigner::generate(), k.engine_box.clone());
        let envelope = other.seal(batch(&k.engine_box), Uuid::new_v4()).unwrap();
        assert!(matches!(
            k.opener.open(&envelope.to_bytes()),
            Err(CryptoError::BadSignature)
        ));
    }

    #[test]
    fn unknown_version_and_trailing_bytes_are_rejected() {
        let k = keys();
        let envelope = k.sealer.seal(batch(&k.engine_box), Uuid::new_v4()).unwrap();

        let mut bytes = envelope.to_bytes();
        bytes[5] = 9;
        assert!(matches!(
            WithdrawalEnvelope::from_bytes(&bytes),
            Err(CryptoError::UnsupportedVersion(9))
        ));

        let mut bytes = envelope.to_bytes();
        bytes.push(0);
        assert!(matches!(
            WithdrawalEnvelope::from_bytes(&bytes),
            Err(CryptoError::Malformed(_))
        ));

        assert!(WithdrawalEnvelope::from_bytes(b"PLWE").is_err());
    }

    #[test]
    fn credential_is_bound_to_its_leg() {
        let k = keys();
        let envelope = k.sealer.seal(batch(&k.engine_box), Uuid::new_v4()).unwrap();
        let mut swapped = envelope.legs[0].clone();
        swapped.credential = envelope.legs[1].credential.clone();
        assert!(k.opener.credential(&swapped).is_err());
    }

    #[test]
    fn resealing_keeps_the_token_but_changes_the_bytes() {
        let k = keys();
        let b = batch(&k.engine_box);
        let token = Uuid::new_v4();
        let first = k.sealer.seal(b.clone(), token).unwrap();
        let second = k.sealer.seal(b, token).unwrap();
        assert_eq!(first.idempotency_token, second.idempotency_token);
        assert_ne!(first.to_bytes(), second.to_bytes());
    }
}
