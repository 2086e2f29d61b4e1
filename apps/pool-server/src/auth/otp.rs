// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # One-Time Codes
//!
//! `OtpService` issues a six-digit code per customer, keeps it in an
//! injected [`OtpStore`] for a fixed TTL (five minutes by default) and hands
//! it to an [`OtpSender`] for out-of-band delivery.
//!
//! Verification consumes the code: it succeeds at most once and never after
//! the TTL, whether or not the background sweep has run yet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AuthFailure;
use crate::broker::{ChannelError, MessageChannel, SMS_SUBJECT};
use crate::crypto::generate_otp;
use crate::storage::{audit, AuditEvent, AuditEventType, LedgerDb};

/// Default code lifetime.
pub const DEFAULT_OTP_TTL: Duration = Duration::from_secs(300);

/// Outcome of presenting a code to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpCheck {
    /// Matched and removed.
    Accepted,
    Mismatch,
    /// Present but past its TTL; removed.
    Expired,
    Missing,
}

/// TTL-capable keyed store for outstanding codes.
///
/// `consume` must check and delete atomically so a code can never be
/// accepted twice.
#[async_trait]
pub trait OtpStore: Send + Sync {
    async fn insert(&self, customer_id: Uuid, code: String, ttl: Duration);

    async fn consume(&self, customer_id: Uuid, code: &str) -> OtpCheck;

    /// Drop every expired record and return how many were removed.
    async fn purge_expired(&self) -> usize;
}

/// Out-of-band delivery of a code to the customer.
#[async_trait]
pub trait OtpSender: Send + Sync {
    async fn deliver(&self, customer_id: Uuid, phone: &str, code: &str)
        -> Result<(), ChannelError>;
}

#[derive(Debug, Serialize)]
struct SmsMessage<'a> {
    to: &'a str,
    msg: String,
}

/// Publishes an `sms.send` message for the SMS gateway.
pub struct ChannelOtpSender {
    channel: Arc<dyn MessageChannel>,
}

impl ChannelOtpSender {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl OtpSender for ChannelOtpSender {
    async fn deliver(
        &self,
        customer_id: Uuid,
        phone: &str,
        code: &str,
    ) -> Result<(), ChannelError> {
        let message = SmsMessage {
            to: phone,
            msg: format!("Your withdrawal code is {code}. It expires in 5 minutes."),
        };
        let payload = serde_json::to_vec(&message)?;
        let dedup_key = format!("otp:{customer_id}:{}", Uuid::new_v4());
        self.channel.publish(SMS_SUBJECT, payload, &dedup_key).await?;
        Ok(())
    }
}

pub struct OtpService {
    store: Arc<dyn OtpStore>,
    sender: Arc<dyn OtpSender>,
    ttl: Duration,
    audit: Option<Arc<LedgerDb>>,
}

impl OtpService {
    pub fn new(store: Arc<dyn OtpStore>, sender: Arc<dyn OtpSender>, ttl: Duration) -> Self {
        Self {
            store,
            sender,
            ttl,
            audit: None,
        }
    }

    /// Record issued and rejected codes in the ledger's audit trail.
    pub fn with_audit(mut self, ledger: Arc<LedgerDb>) -> Self {
        self.audit = Some(ledger);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a fresh code, replacing any outstanding one, and send it.
    ///
    /// If delivery fails the code stays valid and the error is returned so
    /// the caller can ask the customer to retry.
    pub async fn send(&self, customer_id: Uuid, phone: &str) -> Result<String, ChannelError> {
        let code = generate_otp();
        self.store.insert(customer_id, code.clone(), self.ttl).await;

        if let Some(ledger) = &self.audit {
            audit::record(
                ledger,
                AuditEvent::new(AuditEventType::OtpIssued).with_customer(customer_id),
            );
        }

        if let Err(e) = self.sender.deliver(customer_id, phone, &code).await {
            warn!(customer_id = %customer_id, error = %e, "OTP delivery failed");
            return Err(e);
        }
        debug!(customer_id = %customer_id, "OTP issued");
        Ok(code)
    }

    /// Consume `code`, reporting why it was refused.
    pub async fn check(&self, customer_id: Uuid, code: &str) -> Result<(), AuthFailure> {
        let result = match self.store.consume(customer_id, code).await {
            OtpCheck::Accepted => Ok(()),
            OtpCheck::Mismatch => Err(AuthFailure::OtpMismatch),
            OtpCheck::Expired => Err(AuthFailure::OtpExpired),
            OtpCheck::Missing => Err(AuthFailure::OtpMissing),
        };
        if let (Err(failure), Some(ledger)) = (&result, &self.audit) {
            audit::record(
                ledger,
                AuditEvent::new(AuditEventType::OtpRejected)
                    .with_customer(customer_id)
                    .failed(failure.reason()),
            );
        }
        result
    }

    pub async fn verify(&self, customer_id: Uuid, code: &str) -> bool {
        self.check(customer_id, code).await.is_ok()
    }

    /// Purge expired codes every `interval` until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "OTP sweeper starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.cancelled() => {
                    info!("OTP sweeper shutting down");
                    return;
                }
            }
            let purged = self.store.purge_expired().await;
            if purged > 0 {
                debug!(purged, "Expired OTPs purged");
            }
        }
    }
}
