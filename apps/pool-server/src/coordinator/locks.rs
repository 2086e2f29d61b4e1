// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-customer advisory locks.
//!
//! Held from the pot read through the ledger commit so two requests for the
//! same customer cannot both pass the balance check against the same pot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
pub struct CustomerLocks {
    locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl CustomerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `customer_id`.
    pub async fn acquire(&self, customer_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Only this map holds idle locks.
            locks.retain(|id, lock| *id == customer_id || Arc::strong_count(lock) > 1);
            locks.entry(customer_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of customers with a live lock entry.
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_customer_is_serialized() {
        let locks = Arc::new(CustomerLocks::new());
        let customer = Uuid::new_v4();

        let guard = locks.acquire(customer).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire(customer).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_customers_do_not_block() {
        let locks = CustomerLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        let _b = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.tracked(), 2);
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = CustomerLocks::new();
        for _ in 0..10 {
            let _g = locks.acquire(Uuid::new_v4()).await;
        }
        let _g = locks.acquire(Uuid::new_v4()).await;
        assert_eq!(locks.tracked(), 1);
    }
}
