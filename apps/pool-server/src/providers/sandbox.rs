// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process engine and rail for the sandbox track and local runs.
//!
//! Neither moves real money. The engine returns a synthetic receipt after an
//! optional latency; the rail answers every push with a tracking id and
//! reports the outcome on an mpsc channel, the way a mobile-money callback
//! would arrive.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{EngineError, ExecutionEngine, PaymentRail, RailError, RailResult, RAIL_SUCCESS_CODE};

/// One call the sandbox engine received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCall {
    pub credential: String,
    pub otp: String,
    pub amount_cents: i64,
}

#[derive(Default)]
pub struct SandboxEngine {
    latency: Duration,
    failing_credentials: HashSet<String>,
    calls: Mutex<Vec<ExecutionCall>>,
}

impl SandboxEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before answering each call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Reject every call made with `credential`.
    pub fn failing_for(mut self, credential: impl Into<String>) -> Self {
        self.failing_credentials.insert(credential.into());
        self
    }

    pub fn calls(&self) -> Vec<ExecutionCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ExecutionEngine for SandboxEngine {
    async fn execute(
        &self,
        credential: &str,
        otp: &str,
        amount_cents: i64,
        deadline: Instant,
    ) -> Result<String, EngineError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ExecutionCall {
                credential: credential.to_string(),
                otp: otp.to_string(),
                amount_cents,
            });

        if !self.latency.is_zero() {
            let ready_at = Instant::now() + self.latency;
            if ready_at > deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(EngineError::DeadlineExceeded);
            }
            tokio::time::sleep_until(ready_at).await;
        }

        if self.failing_credentials.contains(credential) {
            return Err(EngineError::Rejected("sandbox venue declined".to_string()));
        }
        let receipt = format!("SBX-{}", &Uuid::new_v4().simple().to_string()[..12]);
        debug!(amount_cents, receipt = %receipt, "Sandbox execution");
        Ok(receipt)
    }
}

/// One push the sandbox rail received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushCall {
    pub phone: String,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub tracking_id: String,
}

pub struct SandboxRail {
    results: mpsc::UnboundedSender<RailResult>,
    result_code: String,
    refuse_pushes: bool,
    pushes: Mutex<Vec<PushCall>>,
}

impl SandboxRail {
    /// Create a rail and the receiver its callbacks arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RailResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rail = Self {
            results: tx,
            result_code: RAIL_SUCCESS_CODE.to_string(),
            refuse_pushes: false,
            pushes: Mutex::new(Vec::new()),
        };
        (rail, rx)
    }

    /// Report every push with this result code instead of success.
    pub fn with_result_code(mut self, code: impl Into<String>) -> Self {
        self.result_code = code.into();
        self
    }

    /// Fail every push synchronously.
    pub fn refusing(mut self) -> Self {
        self.refuse_pushes = true;
        self
    }

    pub fn pushes(&self) -> Vec<PushCall> {
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PaymentRail for SandboxRail {
    async fn push(
        &self,
        phone: &str,
        amount_cents: i64,
        idempotency_key: &str,
    ) -> Result<String, RailError> {
        if self.refuse_pushes {
            return Err(RailError::Rejected("sandbox rail refusing pushes".to_string()));
        }
        let tracking_id = format!("ws_SBX_{}", Uuid::new_v4().simple());
        self.pushes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PushCall {
                phone: phone.to_string(),
                amount_cents,
                idempotency_key: idempotency_key.to_string(),
                tracking_id: tracking_id.clone(),
            });

        let mut metadata = Map::new();
        if self.result_code == RAIL_SUCCESS_CODE {
            metadata.insert(
                "receipt".to_string(),
                Value::String(format!("SBXR{}", &Uuid::new_v4().simple().to_string()[..8])),
            );
        }
        // A closed receiver only means nobody is listening for callbacks.
        let _ = self.results.send(RailResult {
            tracking_id: tracking_id.clone(),
            idempotency_key: Some(idempotency_key.to_string()),
            result_code: self.result_code.clone(),
            metadata,
        });
        Ok(tracking_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_records_calls_and_returns_receipt() {
        let engine = SandboxEngine::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let receipt = engine.execute("cred", "123456", 500, deadline).await.unwrap();

        assert!(receipt.starts_with("SBX-"));
        assert_eq!(
            engine.calls(),
            vec![ExecutionCall {
                credential: "cred".into(),
                otp: "123456".into(),
                amount_cents: 500,
            }]
        );
    }

    #[tokio::test]
    async fn engine_rejects_configured_credential() {
        let engine = SandboxEngine::new().failing_for("bad");
        let deadline = Instant::now() + Duration::from_secs(5);
        assert!(matches!(
            engine.execute("bad", "1", 1, deadline).await,
            Err(EngineError::Rejected(_))
        ));
        assert!(engine.execute("good", "1", 1, deadline).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_engine_gives_up_at_deadline() {
        let engine = SandboxEngine::new().with_latency(Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            engine.execute("cred", "1", 1, deadline).await,
            Err(EngineError::DeadlineExceeded)
        ));
    }

    #[tokio::test]
    async fn rail_reports_result_on_callback_channel() {
        let (rail, mut results) = SandboxRail::new();
        let tracking = rail.push("+254700000001", 900, "key-1").await.unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.tracking_id, tracking);
        assert_eq!(result.idempotency_key.as_deref(), Some("key-1"));
        assert!(result.is_success());
        assert!(result.metadata.contains_key("receipt"));
        assert_eq!(rail.pushes()[0].amount_cents, 900);
    }

    #[tokio::test]
    async fn rail_can_fail_pushes_or_results() {
        let (rail, _results) = SandboxRail::new();
        let rail = rail.refusing();
        assert!(rail.push("+254700000001", 1, "k").await.is_err());

        let (rail, mut results) = SandboxRail::new();
        let rail = rail.with_result_code("1032");
        rail.push("+254700000001", 1, "k").await.unwrap();
        assert!(!results.recv().await.unwrap().is_success());
    }
}
