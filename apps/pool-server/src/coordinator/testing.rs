// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared fixtures for coordinator, consumer and reconciler tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::dispatch::Dispatcher;
use crate::broker::{
    BrokerConfig, ChannelError, ChannelResult, Delivery, DurableBroker, MessageChannel, PublishAck,
};
use crate::crypto::{EnvelopeSealer, EnvelopeSigner, SecretBox};
use crate::models::{AssetClass, Leg, Track};
use crate::storage::LedgerDb;

pub const CREDENTIAL: &str = "venue-credential";

pub struct Fixture {
    pub customer: Uuid,
    pub ledger: Arc<LedgerDb>,
    pub broker: Arc<DurableBroker>,
    pub signer: EnvelopeSigner,
    pub engine_box: SecretBox,
    _dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerDb::open(&dir.path().join("ledger.redb")).unwrap());
        let broker = Arc::new(
            DurableBroker::open(&dir.path().join("broker.redb"), BrokerConfig::default()).unwrap(),
        );
        Self {
            customer: Uuid::new_v4(),
            ledger,
            broker,
            signer: EnvelopeSigner::generate(),
            engine_box: SecretBox::from_bytes(&[7u8; 32]).unwrap(),
            _dir: dir,
        }
    }

    fn store(&self, leg: Leg) -> Leg {
        let sealed = self
            .engine_box
            .seal(CREDENTIAL.as_bytes(), leg.id.as_bytes())
            .unwrap();
        let leg = leg.with_credential(sealed);
        self.ledger.upsert_leg(&leg).unwrap();
        leg
    }

    /// Active leg holding `real` cents on the real track.
    pub fn funded_leg(&self, real: i64) -> Leg {
        let mut leg = Leg::new(
            self.customer,
            AssetClass::Bookie,
            "Venue",
            "+254700000001",
            0,
            1_000_000,
        )
        .unwrap();
        leg.credit(Track::Real, real);
        self.store(leg)
    }

    /// Empty active leg with deposit scoring signals.
    pub fn leg_with_signals(&self, log_return: f64, volatility: f64) -> Leg {
        let leg = Leg::new(
            self.customer,
            AssetClass::Sports,
            "Venue",
            "+254700000001",
            0,
            1_000_000,
        )
        .unwrap()
        .with_signals(log_return, volatility);
        self.store(leg)
    }

    pub fn dispatcher(&self, channel: Arc<dyn MessageChannel>) -> Dispatcher {
        Dispatcher::new(
            self.ledger.clone(),
            channel,
            EnvelopeSealer::new(self.signer.clone(), self.engine_box.clone()),
        )
    }
}

/// Wraps a channel and fails the first `failures` publishes.
pub struct FlakyChannel {
    inner: Arc<dyn MessageChannel>,
    failures: AtomicU32,
    /// Store the message before reporting the failure (a lost ack).
    forward: bool,
}

impl FlakyChannel {
    pub fn failing(inner: Arc<dyn MessageChannel>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
            forward: false,
        }
    }

    pub fn losing_acks(inner: Arc<dyn MessageChannel>, failures: u32) -> Self {
        Self {
            forward: true,
            ..Self::failing(inner, failures)
        }
    }
}

#[async_trait]
impl MessageChannel for FlakyChannel {
    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
        dedup_key: &str,
    ) -> ChannelResult<PublishAck> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !failing {
            return self.inner.publish(subject, payload, dedup_key).await;
        }
        if self.forward {
            self.inner.publish(subject, payload, dedup_key).await?;
        }
        Err(ChannelError::Unavailable("injected failure".to_string()))
    }

    async fn next_delivery(&self, subject: &str) -> ChannelResult<Delivery> {
        self.inner.next_delivery(subject).await
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        self.inner.ack(delivery).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> ChannelResult<()> {
        self.inner.dead_letter(delivery, reason).await
    }
}
