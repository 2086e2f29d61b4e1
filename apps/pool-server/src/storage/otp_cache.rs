// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! In-process LRU store for outstanding one-time codes.
//!
//! One code per customer; issuing a new code replaces the previous one.
//! Expiry is checked on every read, independent of the periodic sweep.
//! A code is burned after [`MAX_ATTEMPTS`] wrong guesses.
//! A multi-instance deployment needs a shared implementation of
//! [`OtpStore`] instead.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::otp::{OtpCheck, OtpStore};

const DEFAULT_CAPACITY: usize = 100_000;

/// Wrong guesses allowed against one issued code.
pub const MAX_ATTEMPTS: u32 = 5;

struct OtpEntry {
    code: String,
    expires_at: Instant,
    failed_attempts: u32,
}

pub struct InMemoryOtpStore {
    cache: Mutex<LruCache<Uuid, OtpEntry>>,
}

impl Default for InMemoryOtpStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InMemoryOtpStore {
    /// Create a store holding at most `capacity` outstanding codes.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OtpStore for InMemoryOtpStore {
    async fn insert(&self, customer_id: Uuid, code: String, ttl: Duration) {
        let entry = OtpEntry {
            code,
            expires_at: Instant::now() + ttl,
            failed_attempts: 0,
        };
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(customer_id, entry);
    }

    async fn consume(&self, customer_id: Uuid, code: &str) -> OtpCheck {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = cache.peek_mut(&customer_id) else {
            return OtpCheck::Missing;
        };
        if Instant::now() >= entry.expires_at {
            cache.pop(&customer_id);
            return OtpCheck::Expired;
        }
        let matches: bool = entry.code.as_bytes().ct_eq(code.as_bytes()).into();
        if !matches {
            entry.failed_attempts += 1;
            if entry.failed_attempts >= MAX_ATTEMPTS {
                cache.pop(&customer_id);
            }
            return OtpCheck::Mismatch;
        }
        cache.pop(&customer_id);
        OtpCheck::Accepted
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<Uuid> = cache
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            cache.pop(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn code_is_single_use() {
        let store = InMemoryOtpStore::default();
        let customer = Uuid::new_v4();
        store.insert(customer, "123456".into(), TTL).await;

        assert_eq!(store.consume(customer, "123456").await, OtpCheck::Accepted);
        assert_eq!(store.consume(customer, "123456").await, OtpCheck::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_keeps_the_code() {
        let store = InMemoryOtpStore::default();
        let customer = Uuid::new_v4();
        store.insert(customer, "123456".into(), TTL).await;

        assert_eq!(store.consume(customer, "000000").await, OtpCheck::Mismatch);
        assert_eq!(store.consume(customer, "12345").await, OtpCheck::Mismatch);
        assert_eq!(store.consume(customer, "123456").await, OtpCheck::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_checked_on_read() {
        let store = InMemoryOtpStore::default();
        let customer = Uuid::new_v4();
        store.insert(customer, "123456".into(), TTL).await;

        tokio::time::advance(TTL).await;
        assert_eq!(store.consume(customer, "123456").await, OtpCheck::Expired);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reissue_replaces_previous_code() {
        let store = InMemoryOtpStore::default();
        let customer = Uuid::new_v4();
        store.insert(customer, "111111".into(), TTL).await;
        store.insert(customer, "222222".into(), TTL).await;

        assert_eq!(store.consume(customer, "111111").await, OtpCheck::Mismatch);
        assert_eq!(store.consume(customer, "222222").await, OtpCheck::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let store = InMemoryOtpStore::default();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        store.insert(old, "111111".into(), TTL).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        store.insert(fresh, "222222".into(), TTL).await;
        tokio::time::advance(Duration::from_secs(100)).await;

        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.consume(fresh, "222222").await, OtpCheck::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_wrong_guesses_burn_the_code() {
        let store = InMemoryOtpStore::default();
        let customer = Uuid::new_v4();
        store.insert(customer, "123456".into(), TTL).await;

        for guess in 0..MAX_ATTEMPTS {
            let wrong = format!("{guess:06}");
            assert_eq!(store.consume(customer, &wrong).await, OtpCheck::Mismatch);
        }
        assert!(store.is_empty());
        assert_eq!(store.consume(customer, "123456").await, OtpCheck::Missing);
    }

    #[tokio::test(start_paused = true)]
    async fn reissue_resets_the_guess_budget() {
        let store = InMemoryOtpStore::default();
        let customer = Uuid::new_v4();
        store.insert(customer, "123456".into(), TTL).await;
        for _ in 1..MAX_ATTEMPTS {
            assert_eq!(store.consume(customer, "999999").await, OtpCheck::Mismatch);
        }

        store.insert(customer, "654321".into(), TTL).await;
        for _ in 1..MAX_ATTEMPTS {
            assert_eq!(store.consume(customer, "999999").await, OtpCheck::Mismatch);
        }
        assert_eq!(store.consume(customer, "654321").await, OtpCheck::Accepted);
    }
}
