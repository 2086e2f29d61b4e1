// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # External Money-Movement Collaborators
//!
//! The pipeline never talks to a venue or a mobile-money network directly.
//! It goes through two narrow interfaces:
//!
//! - [`ExecutionEngine`]: performs one withdrawal leg with the leg's
//!   decrypted venue credential and the engine OTP from the envelope.
//! - [`PaymentRail`]: pushes one deposit leg from the customer's phone and
//!   reports the outcome later as a [`RailResult`].
//!
//! [`sandbox`] provides in-process implementations for the sandbox track
//! and local runs.

pub mod sandbox;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

pub use sandbox::{SandboxEngine, SandboxRail};

/// Result code the payment rail reports for a completed push.
pub const RAIL_SUCCESS_CODE: &str = "0";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("venue rejected the instruction: {0}")]
    Rejected(String),

    #[error("venue unreachable: {0}")]
    Unreachable(String),

    #[error("deadline passed before the venue answered")]
    DeadlineExceeded,
}

#[derive(Debug, thiserror::Error)]
pub enum RailError {
    #[error("payment rail rejected the push: {0}")]
    Rejected(String),

    #[error("payment rail rate limit hit")]
    RateLimited,

    #[error("payment rail request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Move `amount_cents` out of one leg. Returns the venue receipt.
    ///
    /// Implementations should give up at `deadline`; callers enforce it
    /// regardless.
    async fn execute(
        &self,
        credential: &str,
        otp: &str,
        amount_cents: i64,
        deadline: Instant,
    ) -> Result<String, EngineError>;
}

#[async_trait]
pub trait PaymentRail: Send + Sync {
    /// Start a push of `amount_cents` from `phone`. Returns the rail's
    /// tracking id; the outcome arrives later as a [`RailResult`].
    async fn push(
        &self,
        phone: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<String, RailError>;
}

/// Asynchronous outcome of a payment-rail push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RailResult {
    pub tracking_id: String,
    /// Idempotency key the push was made with, when the rail echoes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub result_code: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RailResult {
    pub fn is_success(&self) -> bool {
        self.result_code == RAIL_SUCCESS_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_code_zero_is_success() {
        let mut result = RailResult {
            tracking_id: "TRK".into(),
            idempotency_key: None,
            result_code: "0".into(),
            metadata: Map::new(),
        };
        assert!(result.is_success());
        result.result_code = "1032".into();
        assert!(!result.is_success());
    }

    #[test]
    fn callback_json_without_optional_fields_parses() {
        let result: RailResult =
            serde_json::from_str(r#"{"tracking_id":"ws_CO_1","result_code":"1"}"#).unwrap();
        assert_eq!(result.tracking_id, "ws_CO_1");
        assert!(result.idempotency_key.is_none());
        assert!(result.metadata.is_empty());
    }
}
