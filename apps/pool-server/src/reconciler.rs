// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Dispatch Reconciler
//!
//! Background task that retries batches whose broker publish failed. A
//! committed batch keeps an `unsent` dispatch record until the broker
//! accepts its message, so nothing here depends on the request that created
//! it still being around.
//!
//! It also fails withdrawal legs that were claimed by an execution worker
//! which never reported back (a crash between claim and completion).
//! Redelivery skips claimed entries, so without this sweep such a leg would
//! stay `processing` with its funds debited.
//!
//! ## Strategy
//!
//! Every `interval` the reconciler:
//! 1. Lists all `unsent` dispatch records, oldest first.
//! 2. Skips records still inside their backoff window. The wait after the
//!    n-th attempt is `interval × 2^(n-1)`, capped at 32 intervals.
//! 3. Abandons records that used up `max_attempts`. Their pending entries
//!    fail with reason `dispatch_exhausted` and withdrawals are refunded.
//! 4. Re-dispatches the rest. The dedup token fixed at commit makes a retry
//!    after a lost broker ack harmless.
//! 5. Fails withdrawal entries claimed longer than `stall_timeout` ago with
//!    reason `execution_stalled`, refunding their legs.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`, like the consumers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::{DispatchOutcome, Dispatcher};
use crate::error::PoolError;
use crate::models::DispatchRecord;
use crate::storage::{audit, AuditEvent, AuditEventType, LedgerDb};

/// Reason recorded on entries of an abandoned batch.
pub const DISPATCH_EXHAUSTED: &str = "dispatch_exhausted";

/// Reason recorded on claimed entries that never completed.
pub const EXECUTION_STALLED: &str = "execution_stalled";

/// Claim age after which a `processing` withdrawal leg counts as stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_BACKOFF_FACTOR: u32 = 32;

pub struct DispatchReconciler {
    ledger: Arc<LedgerDb>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    max_attempts: u32,
    stall_timeout: Duration,
}

/// Counts from one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub retried: usize,
    pub published: usize,
    pub abandoned: usize,
    pub expired: usize,
}

impl DispatchReconciler {
    pub fn new(
        ledger: Arc<LedgerDb>,
        dispatcher: Arc<Dispatcher>,
        interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            ledger,
            dispatcher,
            interval,
            max_attempts: max_attempts.max(1),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Run the reconciler loop until the cancellation token is triggered.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            max_attempts = self.max_attempts,
            stall_timeout_secs = self.stall_timeout.as_secs(),
            "Dispatch reconciler starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Dispatch reconciler shutting down");
                return;
            }

            match self.sweep().await {
                Ok(report) if report != SweepReport::default() => info!(
                    retried = report.retried,
                    published = report.published,
                    abandoned = report.abandoned,
                    expired = report.expired,
                    "Dispatch reconciler sweep"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Dispatch reconciler sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Dispatch reconciler shutting down");
                    return;
                }
            }
        }
    }

    /// One pass over every `unsent` dispatch record, then over stalled
    /// withdrawal claims.
    pub async fn sweep(&self) -> Result<SweepReport, PoolError> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for record in self.ledger.unsent_dispatches()? {
            if record.attempts >= self.max_attempts {
                if self.abandon(&record)? {
                    report.abandoned += 1;
                }
                continue;
            }
            if !self.is_due(&record, now) {
                continue;
            }

            report.retried += 1;
            match self.dispatcher.dispatch(record.parent_ref).await {
                Ok(DispatchOutcome::Published { .. }) => report.published += 1,
                Ok(DispatchOutcome::AlreadyHandled) => {}
                // The dispatcher already logged and recorded the failure.
                Err(_) => {}
            }
        }

        report.expired = self.expire_stalled(now)?;
        Ok(report)
    }

    fn expire_stalled(&self, now: DateTime<Utc>) -> Result<usize, PoolError> {
        let Ok(timeout) = chrono::Duration::from_std(self.stall_timeout) else {
            return Ok(0);
        };
        let mut expired = 0;
        for entry in self.ledger.stalled_withdrawals(now - timeout)? {
            let Some(completion) = self
                .ledger
                .expire_stalled_entry(entry.id, EXECUTION_STALLED)?
            else {
                continue;
            };
            expired += 1;
            warn!(
                entry_id = %entry.id,
                parent_ref = %entry.parent_ref,
                claimed_at = ?entry.claimed_at,
                refunded = completion.refund.is_some(),
                "Expiring stalled withdrawal leg"
            );
            audit::record(
                &self.ledger,
                AuditEvent::new(AuditEventType::LegFailed)
                    .with_customer(entry.customer_id)
                    .with_resource("entry", entry.id)
                    .failed(EXECUTION_STALLED),
            );
        }
        Ok(expired)
    }

    fn is_due(&self, record: &DispatchRecord, now: DateTime<Utc>) -> bool {
        let Some(last) = record.last_attempt_at else {
            return true;
        };
        let factor = 2u32
            .saturating_pow(record.attempts.saturating_sub(1))
            .min(MAX_BACKOFF_FACTOR);
        let wait = self.interval.saturating_mul(factor);
        match chrono::Duration::from_std(wait) {
            Ok(wait) => now >= last + wait,
            Err(_) => false,
        }
    }

    fn abandon(&self, record: &DispatchRecord) -> Result<bool, PoolError> {
        let Some(refunds) = self
            .ledger
            .abandon_dispatch(record.parent_ref, DISPATCH_EXHAUSTED)?
        else {
            return Ok(false);
        };

        warn!(
            parent_ref = %record.parent_ref,
            kind = ?record.kind,
            attempts = record.attempts,
            last_error = ?record.last_error,
            refunds = refunds.len(),
            "Abandoning undeliverable batch"
        );
        audit::record(
            &self.ledger,
            AuditEvent::new(AuditEventType::DispatchAbandoned)
                .with_customer(record.customer_id)
                .with_resource("batch", record.parent_ref)
                .with_details(serde_json::json!({
                    "attempts": record.attempts,
                    "refunds": refunds.len(),
                }))
                .failed(record.last_error.clone().unwrap_or_default()),
        );
        Ok(true)
    }
}
