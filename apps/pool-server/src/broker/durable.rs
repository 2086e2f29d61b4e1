// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Durable, deduplicating message channel backed by redb.
//!
//! ## Table Layout
//!
//! - `messages`: sequence → serialized StoredMessage (state, delivery count)
//! - `payloads`: sequence → raw payload bytes (dropped on ack)
//! - `pending`: `subject | 0x00 | sequence_be` → sequence, scanned in
//!   publish order per subject
//! - `dedup`: `subject|dedup_key` → serialized DedupEntry
//! - `meta`: key → u64 (sequence counter)
//!
//! Ack deadlines are kept in memory only. After a restart every unacked
//! message is immediately deliverable again.
//!
//! [`DurableBroker::prune`] keeps `dedup` and `messages` bounded: dedup keys
//! go once their window has passed, acked messages once `retention` has.
//! Pending and dead-lettered messages are never pruned.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChannelError, ChannelResult, Delivery, MessageChannel, PublishAck};

// =============================================================================
// Table Definitions
// =============================================================================

const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");
const PAYLOADS: TableDefinition<u64, &[u8]> = TableDefinition::new("payloads");
const PENDING: TableDefinition<&[u8], u64> = TableDefinition::new("pending");
const DEDUP: TableDefinition<&str, &[u8]> = TableDefinition::new("dedup");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQUENCE_KEY: &str = "next_sequence";

/// Tunables for redelivery and deduplication.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// How long a dedup key suppresses republishes.
    pub dedup_window: Duration,
    /// How long a delivery may stay unacked before redelivery.
    pub ack_wait: Duration,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_deliver: u32,
    /// How long an acked message stays queryable after it was published.
    pub retention: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(120),
            ack_wait: Duration::from_secs(30),
            max_deliver: 5,
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Rows removed by one [`DurableBroker::prune`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub dedup_keys: usize,
    pub messages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Acked,
    DeadLettered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    dedup_key: String,
    published_at: DateTime<Utc>,
    state: MessageState,
    deliveries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dead_letter_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DedupEntry {
    sequence: u64,
    published_at: DateTime<Utc>,
}

/// A dead-lettered message as seen by operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub sequence: u64,
    pub subject: String,
    pub reason: Option<String>,
}

struct InFlight {
    subject: String,
    deadline: Instant,
}

fn pending_key(subject: &str, sequence: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(subject.len() + 9);
    key.extend_from_slice(subject.as_bytes());
    key.push(0);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// `[subject|0x00, subject|0x01)` covers every pending key of one subject.
fn subject_bounds(subject: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = subject.as_bytes().to_vec();
    let mut end = start.clone();
    start.push(0);
    end.push(1);
    (start, end)
}

fn dedup_key(subject: &str, key: &str) -> String {
    format!("{subject}|{key}")
}

fn has_aged(now: DateTime<Utc>, since: DateTime<Utc>, limit: Duration) -> bool {
    now.signed_duration_since(since)
        .to_std()
        .is_ok_and(|age| age >= limit)
}

// =============================================================================
// DurableBroker
// =============================================================================

pub struct DurableBroker {
    db: Database,
    config: BrokerConfig,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    notify: Notify,
}

impl DurableBroker {
    /// Open (or create) the broker store at the given path.
    pub fn open(path: &Path, config: BrokerConfig) -> ChannelResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MESSAGES)?;
            let _ = write_txn.open_table(PAYLOADS)?;
            let _ = write_txn.open_table(PENDING)?;
            let _ = write_txn.open_table(DEDUP)?;
            let _ = write_txn.open_table(META)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db,
            config,
            in_flight: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn publish_sync(
        &self,
        subject: &str,
        payload: &[u8],
        key: &str,
    ) -> ChannelResult<PublishAck> {
        let now = Utc::now();
        let dedup = dedup_key(subject, key);

        let write_txn = self.db.begin_write()?;
        let sequence = {
            let mut dedup_table = write_txn.open_table(DEDUP)?;
            let existing = match dedup_table.get(dedup.as_str())? {
                Some(v) => Some(serde_json::from_slice::<DedupEntry>(v.value())?),
                None => None,
            };
            if let Some(entry) = existing {
                let age = now.signed_duration_since(entry.published_at);
                if age.to_std().unwrap_or_default() < self.config.dedup_window {
                    drop(dedup_table);
                    write_txn.abort()?;
                    debug!(subject, sequence = entry.sequence, "Duplicate publish suppressed");
                    return Ok(PublishAck {
                        sequence: entry.sequence,
                        duplicate: true,
                    });
                }
            }

            let mut meta = write_txn.open_table(META)?;
            let sequence = match meta.get(NEXT_SEQUENCE_KEY)? {
                Some(v) => v.value(),
                None => 1,
            };
            meta.insert(NEXT_SEQUENCE_KEY, sequence + 1)?;

            let message = StoredMessage {
                sequence,
                subject: subject.to_string(),
                dedup_key: key.to_string(),
                published_at: now,
                state: MessageState::Pending,
                deliveries: 0,
                dead_letter_reason: None,
            };
            write_txn
                .open_table(MESSAGES)?
                .insert(sequence, serde_json::to_vec(&message)?.as_slice())?;
            write_txn.open_table(PAYLOADS)?.insert(sequence, payload)?;
            write_txn
                .open_table(PENDING)?
                .insert(pending_key(subject, sequence).as_slice(), sequence)?;

            let entry = DedupEntry {
                sequence,
                published_at: now,
            };
            dedup_table.insert(dedup.as_str(), serde_json::to_vec(&entry)?.as_slice())?;
            sequence
        };
        write_txn.commit()?;

        self.notify.notify_waiters();
        Ok(PublishAck {
            sequence,
            duplicate: false,
        })
    }

    /// Claim the oldest deliverable message on `subject`, if any.
    fn try_claim(&self, subject: &str) -> ChannelResult<Option<Delivery>> {
        let now = Instant::now();
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dead_lettered = Vec::new();
        let mut claimed = None;

        let write_txn = self.db.begin_write()?;
        {
            let mut pending = write_txn.open_table(PENDING)?;
            let mut messages = write_txn.open_table(MESSAGES)?;
            let payloads = write_txn.open_table(PAYLOADS)?;

            let (start, end) = subject_bounds(subject);
            let candidates = pending
                .range(start.as_slice()..end.as_slice())?
                .map(|entry| entry.map(|(_, v)| v.value()))
                .collect::<Result<Vec<u64>, _>>()?;

            for sequence in candidates {
                if in_flight
                    .get(&sequence)
                    .is_some_and(|f| f.deadline > now)
                {
                    continue;
                }

                let existing = match messages.get(sequence)? {
                    Some(v) => Some(v.value().to_vec()),
                    None => None,
                };
                let Some(existing) = existing else {
                    pending.remove(pending_key(subject, sequence).as_slice())?;
                    continue;
                };
                let mut message: StoredMessage = serde_json::from_slice(&existing)?;

                if message.deliveries >= self.config.max_deliver {
                    message.state = MessageState::DeadLettered;
                    message.dead_letter_reason = Some("max deliveries exceeded".to_string());
                    messages.insert(sequence, serde_json::to_vec(&message)?.as_slice())?;
                    pending.remove(pending_key(subject, sequence).as_slice())?;
                    dead_lettered.push(sequence);
                    continue;
                }

                message.deliveries += 1;
                messages.insert(sequence, serde_json::to_vec(&message)?.as_slice())?;

                let payload = match payloads.get(sequence)? {
                    Some(v) => v.value().to_vec(),
                    None => Vec::new(),
                };
                claimed = Some(Delivery {
                    sequence,
                    subject: subject.to_string(),
                    payload,
                    dedup_key: message.dedup_key,
                    attempt: message.deliveries,
                });
                break;
            }
        }
        write_txn.commit()?;

        for sequence in dead_lettered {
            in_flight.remove(&sequence);
            warn!(
                subject,
                sequence,
                max_deliver = self.config.max_deliver,
                "Message dead-lettered after repeated unacked deliveries"
            );
        }
        if let Some(delivery) = &claimed {
            in_flight.insert(
                delivery.sequence,
                InFlight {
                    subject: subject.to_string(),
                    deadline: now + self.config.ack_wait,
                },
            );
        }
        Ok(claimed)
    }

    /// Earliest ack deadline among in-flight messages on `subject`.
    fn next_deadline(&self, subject: &str) -> Option<Instant> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|f| f.subject == subject)
            .map(|f| f.deadline)
            .min()
    }

    /// Move a message out of the pending set.
    fn settle(
        &self,
        sequence: u64,
        state: MessageState,
        reason: Option<&str>,
    ) -> ChannelResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut messages = write_txn.open_table(MESSAGES)?;
            let existing = {
                let existing = messages
                    .get(sequence)?
                    .ok_or(ChannelError::UnknownSequence(sequence))?;
                existing.value().to_vec()
            };
            let mut message: StoredMessage = serde_json::from_slice(&existing)?;

            if message.state == MessageState::Pending {
                message.state = state;
                message.dead_letter_reason = reason.map(str::to_string);
                messages.insert(sequence, serde_json::to_vec(&message)?.as_slice())?;
                write_txn
                    .open_table(PENDING)?
                    .remove(pending_key(&message.subject, sequence).as_slice())?;
                if state == MessageState::Acked {
                    write_txn.open_table(PAYLOADS)?.remove(sequence)?;
                }
            }
        }
        write_txn.commit()?;

        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&sequence);
        Ok(())
    }

    pub fn message_state(&self, sequence: u64) -> ChannelResult<Option<MessageState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGES)?;
        match table.get(sequence)? {
            Some(v) => {
                let message: StoredMessage = serde_json::from_slice(v.value())?;
                Ok(Some(message.state))
            }
            None => Ok(None),
        }
    }

    /// Number of unacked, not dead-lettered messages on `subject`.
    pub fn pending_count(&self, subject: &str) -> ChannelResult<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING)?;
        let (start, end) = subject_bounds(subject);
        let mut count = 0;
        for entry in table.range(start.as_slice()..end.as_slice())? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// Remove dedup keys past the dedup window and acked messages past the
    /// retention period.
    pub fn prune(&self) -> ChannelResult<PruneReport> {
        let now = Utc::now();
        let mut report = PruneReport::default();

        let write_txn = self.db.begin_write()?;
        {
            let mut dedup = write_txn.open_table(DEDUP)?;
            let mut stale_keys = Vec::new();
            for item in dedup.iter()? {
                let (key, value) = item?;
                let entry: DedupEntry = serde_json::from_slice(value.value())?;
                if has_aged(now, entry.published_at, self.config.dedup_window) {
                    stale_keys.push(key.value().to_string());
                }
            }
            for key in &stale_keys {
                dedup.remove(key.as_str())?;
            }
            report.dedup_keys = stale_keys.len();

            let mut messages = write_txn.open_table(MESSAGES)?;
            let mut payloads = write_txn.open_table(PAYLOADS)?;
            let mut expired = Vec::new();
            for item in messages.iter()? {
                let (sequence, value) = item?;
                let message: StoredMessage = serde_json::from_slice(value.value())?;
                if message.state == MessageState::Acked
                    && has_aged(now, message.published_at, self.config.retention)
                {
                    expired.push(sequence.value());
                }
            }
            for &sequence in &expired {
                messages.remove(sequence)?;
                payloads.remove(sequence)?;
            }
            report.messages = expired.len();
        }
        if report == PruneReport::default() {
            write_txn.abort()?;
        } else {
            write_txn.commit()?;
        }
        Ok(report)
    }

    /// Prune every `interval` until cancelled.
    pub async fn run_pruner(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Broker pruner starting"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Broker pruner shutting down");
                    return;
                }
            }
            match self.prune() {
                Ok(report) if report != PruneReport::default() => debug!(
                    dedup_keys = report.dedup_keys,
                    messages = report.messages,
                    "Broker tables pruned"
                ),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Broker prune failed"),
            }
        }
    }

    pub fn dead_letters(&self) -> ChannelResult<Vec<DeadLetter>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGES)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let message: StoredMessage = serde_json::from_slice(value.value())?;
            if message.state == MessageState::DeadLettered {
                out.push(DeadLetter {
                    sequence: message.sequence,
                    subject: message.subject,
                    reason: message.dead_letter_reason,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl MessageChannel for DurableBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: &str,
    ) -> ChannelResult<PublishAck> {
        self.publish_sync(subject, &payload, dedup_key)
    }

    async fn next_delivery(&self, subject: &str) -> ChannelResult<Delivery> {
        loop {
            // Register for wakeups before looking, so a publish between the
            // scan and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_claim(subject)? {
                return Ok(delivery);
            }

            match self.next_deadline(subject) {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {},
                        _ = tokio::time::sleep_until(deadline) => {},
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        self.settle(delivery.sequence, MessageState::Acked, None)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> ChannelResult<()> {
        warn!(
            subject = %delivery.subject,
            sequence = delivery.sequence,
            reason,
            "Message dead-lettered"
        );
        self.settle(delivery.sequence, MessageState::DeadLettered, Some(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_broker(config: BrokerConfig) -> (DurableBroker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let broker = DurableBroker::open(&dir.path().join("broker.redb"), config).unwrap();
        (broker, dir)
    }

    async fn no_delivery(broker: &DurableBroker, subject: &str) -> bool {
        tokio::time::timeout(Duration::from_secs(300), broker.next_delivery(subject))
            .await
            .is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn publish_deliver_ack() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());

        let ack = broker.publish("a", b"hello".to_vec(), "k1").await.unwrap();
        assert!(!ack.duplicate);

        let delivery = broker.next_delivery("a").await.unwrap();
        assert_eq!(delivery.sequence, ack.sequence);
        assert_eq!(delivery.payload, b"hello");
        assert_eq!(delivery.attempt, 1);

        broker.ack(&delivery).await.unwrap();
        assert_eq!(
            broker.message_state(ack.sequence).unwrap(),
            Some(MessageState::Acked)
        );
        assert!(no_delivery(&broker, "a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn same_dedup_key_is_stored_once() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());

        let first = broker.publish("a", b"v1".to_vec(), "batch-1").await.unwrap();
        let second = broker.publish("a", b"v2".to_vec(), "batch-1").await.unwrap();
        assert_eq!(first.sequence, second.sequence);
        assert!(second.duplicate);
        assert_eq!(broker.pending_count("a").unwrap(), 1);

        let delivery = broker.next_delivery("a").await.unwrap();
        assert_eq!(delivery.payload, b"v1");
        broker.ack(&delivery).await.unwrap();

        // Still deduplicated after the ack while inside the window.
        let third = broker.publish("a", b"v3".to_vec(), "batch-1").await.unwrap();
        assert!(third.duplicate);
        assert!(no_delivery(&broker, "a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_keys_are_scoped_per_subject() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());
        let a = broker.publish("a", vec![1], "same").await.unwrap();
        let b = broker.publish("b", vec![2], "same").await.unwrap();
        assert!(!b.duplicate);
        assert_ne!(a.sequence, b.sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered_after_ack_wait() {
        let (broker, _dir) = temp_broker(BrokerConfig {
            ack_wait: Duration::from_secs(30),
            ..BrokerConfig::default()
        });
        broker.publish("a", b"x".to_vec(), "k").await.unwrap();

        let first = broker.next_delivery("a").await.unwrap();
        let started = Instant::now();
        let second = broker.next_delivery("a").await.unwrap();

        assert_eq!(first.sequence, second.sequence);
        assert_eq!(second.attempt, 2);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_max_deliver_dead_letters() {
        let (broker, _dir) = temp_broker(BrokerConfig {
            ack_wait: Duration::from_secs(1),
            max_deliver: 2,
            ..BrokerConfig::default()
        });
        let ack = broker.publish("a", b"x".to_vec(), "k").await.unwrap();

        assert_eq!(broker.next_delivery("a").await.unwrap().attempt, 1);
        assert_eq!(broker.next_delivery("a").await.unwrap().attempt, 2);
        assert!(no_delivery(&broker, "a").await);

        assert_eq!(
            broker.message_state(ack.sequence).unwrap(),
            Some(MessageState::DeadLettered)
        );
        assert_eq!(broker.dead_letters().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_dead_letter_keeps_the_reason() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());
        broker.publish("a", b"x".to_vec(), "k").await.unwrap();

        let delivery = broker.next_delivery("a").await.unwrap();
        broker.dead_letter(&delivery, "bad signature").await.unwrap();

        let dead = broker.dead_letters().unwrap();
        assert_eq!(dead[0].reason.as_deref(), Some("bad signature"));
        assert_eq!(broker.pending_count("a").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_consumer_is_woken_by_publish() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());
        let broker = Arc::new(broker);

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next_delivery("a").await })
        };
        tokio::task::yield_now().await;

        broker.publish("a", b"late".to_vec(), "k").await.unwrap();
        let delivery = waiter.await.unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.redb");
        {
            let broker = DurableBroker::open(&path, BrokerConfig::default()).unwrap();
            broker.publish("a", b"durable".to_vec(), "k").await.unwrap();
            let _unacked = broker.next_delivery("a").await.unwrap();
        }

        let broker = DurableBroker::open(&path, BrokerConfig::default()).unwrap();
        let delivery = broker.next_delivery("a").await.unwrap();
        assert_eq!(delivery.payload, b"durable");
        assert_eq!(delivery.attempt, 2);

        // Dedup state is durable too.
        let again = broker.publish("a", b"dup".to_vec(), "k").await.unwrap();
        assert!(again.duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_stale_dedup_keys_and_acked_messages() {
        let (broker, _dir) = temp_broker(BrokerConfig {
            dedup_window: Duration::ZERO,
            retention: Duration::ZERO,
            ..BrokerConfig::default()
        });
        let acked = broker.publish("a", b"done".to_vec(), "k1").await.unwrap();
        let delivery = broker.next_delivery("a").await.unwrap();
        broker.ack(&delivery).await.unwrap();
        let waiting = broker.publish("a", b"waiting".to_vec(), "k2").await.unwrap();
        broker.publish("b", b"bad".to_vec(), "k3").await.unwrap();
        let rejected = broker.next_delivery("b").await.unwrap();
        broker.dead_letter(&rejected, "bad signature").await.unwrap();

        let report = broker.prune().unwrap();
        assert_eq!(
            report,
            PruneReport {
                dedup_keys: 3,
                messages: 1,
            }
        );
        assert_eq!(broker.message_state(acked.sequence).unwrap(), None);
        assert_eq!(
            broker.message_state(waiting.sequence).unwrap(),
            Some(MessageState::Pending)
        );
        assert_eq!(broker.dead_letters().unwrap().len(), 1);
        assert_eq!(broker.prune().unwrap(), PruneReport::default());

        // Sequences keep counting and the pending message is still delivered.
        let again = broker.publish("a", b"again".to_vec(), "k1").await.unwrap();
        assert!(!again.duplicate);
        assert!(again.sequence > waiting.sequence);
        assert_eq!(broker.next_delivery("a").await.unwrap().sequence, waiting.sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_keeps_rows_inside_their_windows() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());
        let ack = broker.publish("a", b"x".to_vec(), "k").await.unwrap();
        let delivery = broker.next_delivery("a").await.unwrap();
        broker.ack(&delivery).await.unwrap();

        assert_eq!(broker.prune().unwrap(), PruneReport::default());
        assert_eq!(
            broker.message_state(ack.sequence).unwrap(),
            Some(MessageState::Acked)
        );
        assert!(broker.publish("a", b"x".to_vec(), "k").await.unwrap().duplicate);
    }

    #[tokio::test(start_paused = true)]
    async fn pruner_stops_on_cancel() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            Arc::new(broker).run_pruner(Duration::from_secs(60), shutdown.clone()),
        );
        tokio::time::sleep(Duration::from_secs(61)).await;
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ack_of_unknown_sequence_fails() {
        let (broker, _dir) = temp_broker(BrokerConfig::default());
        let bogus = Delivery {
            sequence: 42,
            subject: "a".into(),
            payload: Vec::new(),
            dedup_key: "k".into(),
            attempt: 1,
        };
        assert!(matches!(
            broker.ack(&bogus).await,
            Err(ChannelError::UnknownSequence(42))
        ));
    }
}
