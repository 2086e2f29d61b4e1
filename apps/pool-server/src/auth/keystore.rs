// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-customer HMAC secrets for withdrawal request signatures.
//!
//! A withdrawal request carries `base64(HMAC-SHA256(secret, payload))` where
//! the payload is `customer_id:otp:amount`. Binding the OTP and the amount
//! means a signature captured for one request cannot authorize another.
//!
//! Secrets are provisioned out of band. At startup they can be loaded from a
//! JSON file mapping customer id to base64 secret:
//!
//! ```json
//! { "4f1c…": "c2VjcmV0…" }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use base64ct::{Base64, Encoding};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::AuthFailure;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid customer id {0:?}")]
    CustomerId(String),

    #[error("secret for customer {0} is not valid base64")]
    Encoding(Uuid),
}

/// Canonical payload a customer signs to authorize a withdrawal.
pub fn withdrawal_payload(customer_id: Uuid, otp: &str, amount_cents: i64) -> String {
    format!("{customer_id}:{otp}:{amount_cents}")
}

/// `base64(HMAC-SHA256(secret, payload))`.
pub fn compute_signature(secret: &[u8], payload: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(payload.as_bytes());
    Base64::encode_string(&mac.finalize().into_bytes())
}

/// Process-wide map of customer id to HMAC secret.
#[derive(Default)]
pub struct KeyStore {
    keys: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, KeyStoreError> {
        let raw: HashMap<String, String> = serde_json::from_str(json)?;
        let store = Self::new();
        for (customer, secret) in raw {
            let customer_id =
                Uuid::parse_str(&customer).map_err(|_| KeyStoreError::CustomerId(customer))?;
            let secret = Base64::decode_vec(secret.trim())
                .map_err(|_| KeyStoreError::Encoding(customer_id))?;
            store.provision(customer_id, secret);
        }
        Ok(store)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, KeyStoreError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Install or replace a customer's secret.
    pub fn provision(&self, customer_id: Uuid, secret: Vec<u8>) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(customer_id, secret);
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check `signature` (base64) against the customer's secret in constant
    /// time.
    pub fn check(
        &self,
        customer_id: Uuid,
        payload: &str,
        signature: &str,
    ) -> Result<(), AuthFailure> {
        let mut mac = {
            let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
            let secret = keys
                .get(&customer_id)
                .ok_or(AuthFailure::UnknownCustomerKey)?;
            HmacSha256::new_from_slice(secret).map_err(|_| AuthFailure::UnknownCustomerKey)?
        };
        let tag = Base64::decode_vec(signature.trim()).map_err(|_| AuthFailure::MalformedSignature)?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).map_err(|_| AuthFailure::BadSignature)
    }

    pub fn verify(&self, customer_id: Uuid, payload: &str, signature: &str) -> bool {
        self.check(customer_id, payload, signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_verifies() {
        let store = KeyStore::new();
        let customer = Uuid::new_v4();
        store.provision(customer, b"customer-secret".to_vec());

        let payload = withdrawal_payload(customer, "123456", 10_000);
        let sig = compute_signature(b"customer-secret", &payload);
        assert!(store.verify(customer, &payload, &sig));
    }

    #[test]
    fn signature_is_bound_to_otp_and_amount() {
        let store = KeyStore::new();
        let customer = Uuid::new_v4();
        store.provision(customer, b"customer-secret".to_vec());

        let sig = compute_signature(
            b"customer-secret",
            &withdrawal_payload(customer, "123456", 10_000),
        );
        let other_otp = withdrawal_payload(customer, "654321", 10_000);
        let other_amount = withdrawal_payload(customer, "123456", 10_001);

        assert_eq!(
            store.check(customer, &other_otp, &sig),
            Err(AuthFailure::BadSignature)
        );
        assert_eq!(
            store.check(customer, &other_amount, &sig),
            Err(AuthFailure::BadSignature)
        );
    }

    #[test]
    fn unknown_customer_and_garbage_signature() {
        let store = KeyStore::new();
        let customer = Uuid::new_v4();
        assert_eq!(
            store.check(customer, "p", "AAAA"),
            Err(AuthFailure::UnknownCustomerKey)
        );

        store.provision(customer, b"k".to_vec());
        assert_eq!(
            store.check(customer, "p", "%%%"),
            Err(AuthFailure::MalformedSignature)
        );
    }

    #[test]
    fn loads_secrets_from_json() {
        let customer = Uuid::new_v4();
        let json = format!(
            r#"{{"{customer}": "{}"}}"#,
            Base64::encode_string(b"from-file")
        );
        let store = KeyStore::from_json(&json).unwrap();
        assert_eq!(store.len(), 1);

        let payload = withdrawal_payload(customer, "000001", 5);
        assert!(store.verify(customer, &payload, &compute_signature(b"from-file", &payload)));

        assert!(matches!(
            KeyStore::from_json(r#"{"not-a-uuid": "AAAA"}"#),
            Err(KeyStoreError::CustomerId(_))
        ));
    }
}
