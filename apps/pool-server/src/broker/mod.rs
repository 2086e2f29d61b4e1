// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Message Channel
//!
//! At-least-once delivery between the coordinators and the background
//! consumers, with publish-side deduplication and explicit acknowledgement.
//!
//! ## Subjects
//!
//! | Subject | Payload | Consumer |
//! |---------|---------|----------|
//! | `withdrawal.secure` | signed [`WithdrawalEnvelope`](crate::crypto::WithdrawalEnvelope) bytes | `ExecutionConsumer` |
//! | `deposit.sequence` | JSON `DepositSequence` | `DepositSequencer` |
//! | `sms.send` | JSON `{ "to", "msg" }` | out-of-process SMS gateway |
//!
//! ## Contract
//!
//! - `publish` returns only after the message is durably stored. A second
//!   publish with the same dedup key inside the dedup window returns the
//!   original sequence with `duplicate = true` and stores nothing.
//! - A delivery that is not acked within the ack wait is redelivered. A
//!   message delivered more than the configured maximum is dead-lettered.

pub mod durable;

use async_trait::async_trait;

pub use durable::{BrokerConfig, DeadLetter, DurableBroker, MessageState, PruneReport};

pub const WITHDRAWAL_SUBJECT: &str = "withdrawal.secure";
pub const DEPOSIT_SUBJECT: &str = "deposit.sequence";
pub const SMS_SUBJECT: &str = "sms.send";

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("broker database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("broker transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("broker table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("broker storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("broker commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("broker record corrupt: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unknown message sequence {0}")]
    UnknownSequence(u64),

    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Durable acknowledgement of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: u64,
    /// The dedup key was seen before; nothing new was stored.
    pub duplicate: bool,
}

/// One delivery attempt of a stored message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub sequence: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub dedup_key: String,
    /// 1 for the first delivery.
    pub attempt: u32,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: &str,
    ) -> ChannelResult<PublishAck>;

    /// Wait for the next deliverable message on `subject`.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn next_delivery(&self, subject: &str) -> ChannelResult<Delivery>;

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()>;

    /// Park a message permanently; it is never redelivered.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> ChannelResult<()>;
}
