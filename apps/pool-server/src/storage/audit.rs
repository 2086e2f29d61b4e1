// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit logging for security-sensitive operations.
//!
//! Authentication decisions, ledger commits, dispatch outcomes and
//! execution results are appended to the ledger's `audit` table, keyed by
//! day so a single date can be read back in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::LedgerDb;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Authentication events
    OtpIssued,
    OtpRejected,
    SignatureRejected,

    // Ledger events
    LegProvisioned,
    WithdrawalCommitted,
    DepositCommitted,
    DepositSettled,

    // Dispatch events
    DispatchPublished,
    DispatchFailed,
    DispatchAbandoned,

    // Execution events
    EnvelopeRejected,
    LegExecuted,
    LegFailed,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Customer the event concerns (if known).
    pub customer_id: Option<Uuid>,
    /// Resource affected (parent ref, entry id, leg id).
    pub resource_id: Option<String>,
    /// Resource type (batch, entry, leg).
    pub resource_type: Option<String>,
    /// Additional details as JSON.
    pub details: Option<serde_json::Value>,
    pub success: bool,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type,
            customer_id: None,
            resource_id: None,
            resource_type: None,
            details: None,
            success: true,
            error: None,
        }
    }

    pub fn with_customer(mut self, customer_id: Uuid) -> Self {
        self.customer_id = Some(customer_id);
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl ToString,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark as failed with error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Day bucket used as the storage key prefix.
    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }
}

/// Append `event`, logging instead of failing if the write does not go
/// through.
pub fn record(ledger: &LedgerDb, event: AuditEvent) {
    if let Err(e) = ledger.append_audit(&event) {
        tracing::warn!(
            event_type = ?event.event_type,
            error = %e,
            "Failed to write audit event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_ledger() -> (LedgerDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = LedgerDb::open(&dir.path().join("ledger.redb")).unwrap();
        (db, dir)
    }

    #[test]
    fn create_audit_event() {
        let customer = Uuid::new_v4();
        let event = AuditEvent::new(AuditEventType::WithdrawalCommitted)
            .with_customer(customer)
            .with_resource("batch", "abc");

        assert_eq!(event.event_type, AuditEventType::WithdrawalCommitted);
        assert_eq!(event.customer_id, Some(customer));
        assert_eq!(event.resource_type.as_deref(), Some("batch"));
        assert_eq!(event.resource_id.as_deref(), Some("abc"));
        assert!(event.success);
    }

    #[test]
    fn failed_event() {
        let event = AuditEvent::new(AuditEventType::SignatureRejected).failed("bad_signature");
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("bad_signature"));
    }

    #[test]
    fn record_and_read_back_in_order() {
        let (ledger, _dir) = temp_ledger();
        let customer = Uuid::new_v4();

        record(
            &ledger,
            AuditEvent::new(AuditEventType::OtpIssued).with_customer(customer),
        );
        record(
            &ledger,
            AuditEvent::new(AuditEventType::WithdrawalCommitted).with_customer(customer),
        );
        record(&ledger, AuditEvent::new(AuditEventType::DispatchPublished));

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let events = ledger.audit_events(&today).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, AuditEventType::OtpIssued);
        assert_eq!(events[1].event_type, AuditEventType::WithdrawalCommitted);

        let mine = ledger.audit_events_for_customer(customer, &today).unwrap();
        assert_eq!(mine.len(), 2);
    }

    #[test]
    fn other_days_are_excluded() {
        let (ledger, _dir) = temp_ledger();
        let mut old = AuditEvent::new(AuditEventType::LegExecuted);
        old.timestamp = Utc::now() - chrono::Duration::days(3);
        ledger.append_audit(&old).unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        assert!(ledger.audit_events(&today).unwrap().is_empty());
        assert_eq!(ledger.audit_events(&old.date()).unwrap().len(), 1);
    }
}
