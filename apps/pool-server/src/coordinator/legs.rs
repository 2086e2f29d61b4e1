// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Leg provisioning.
//!
//! A leg's venue credential is sealed with the execution engine's secret
//! and bound to the leg id, so it can only be opened by the engine and only
//! for that leg. The coordinator stores and forwards the ciphertext without
//! ever reading it back.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::crypto::SecretBox;
use crate::error::PoolError;
use crate::models::Leg;
use crate::storage::{audit, AuditEvent, AuditEventType, LedgerDb};

pub struct LegRegistry {
    ledger: Arc<LedgerDb>,
    engine_box: SecretBox,
}

impl LegRegistry {
    pub fn new(ledger: Arc<LedgerDb>, engine_box: SecretBox) -> Self {
        Self { ledger, engine_box }
    }

    /// Seal `credential` onto `leg` and store it.
    pub fn provision(&self, leg: Leg, credential: &str) -> Result<Leg, PoolError> {
        if credential.is_empty() {
            return Err(PoolError::validation("leg credential is required"));
        }
        let sealed = self.engine_box.seal(credential.as_bytes(), leg.id.as_bytes())?;
        let leg = leg.with_credential(sealed);
        self.ledger.upsert_leg(&leg)?;

        info!(
            customer_id = %leg.customer_id,
            leg_id = %leg.id,
            asset_class = ?leg.asset_class,
            "Leg provisioned"
        );
        audit::record(
            &self.ledger,
            AuditEvent::new(AuditEventType::LegProvisioned)
                .with_customer(leg.customer_id)
                .with_resource("leg", leg.id),
        );
        Ok(leg)
    }

    /// Update the scoring signals used by deposit allocation.
    pub fn update_signals(
        &self,
        leg_id: Uuid,
        recent_log_return: f64,
        recent_volatility: f64,
    ) -> Result<Leg, PoolError> {
        let leg = self
            .ledger
            .get_leg(leg_id)?
            .ok_or_else(|| PoolError::not_found(format!("Leg {leg_id}")))?
            .with_signals(recent_log_return, recent_volatility);
        self.ledger.upsert_leg(&leg)?;
        Ok(leg)
    }

    /// Exclude a leg from future allocations. Its balance is kept.
    pub fn deactivate(&self, leg_id: Uuid) -> Result<Leg, PoolError> {
        let mut leg = self
            .ledger
            .get_leg(leg_id)?
            .ok_or_else(|| PoolError::not_found(format!("Leg {leg_id}")))?;
        leg.active = false;
        leg.updated_at = chrono::Utc::now();
        self.ledger.upsert_leg(&leg)?;
        info!(leg_id = %leg_id, "Leg deactivated");
        Ok(leg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetClass;

    fn registry() -> (LegRegistry, Arc<LedgerDb>, SecretBox, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(LedgerDb::open(&dir.path().join("ledger.redb")).unwrap());
        let engine_box = SecretBox::from_bytes(&[9u8; 32]).unwrap();
        (
            LegRegistry::new(ledger.clone(), engine_box.clone()),
            ledger,
            engine_box,
            dir,
        )
    }

    fn leg() -> Leg {
        Leg::new(
            Uuid::new_v4(),
            AssetClass::Forex,
            "FX Desk",
            "acct-001",
            0,
            50_000,
        )
        .unwrap()
    }

    #[test]
    fn credential_is_sealed_to_the_leg() {
        let (registry, ledger, engine_box, _dir) = registry();
        let leg = registry.provision(leg(), "api-key-123").unwrap();

        let stored = ledger.get_leg(leg.id).unwrap().unwrap();
        assert!(!stored.sealed_credential.is_empty());
        assert_eq!(
            engine_box
                .open_string(&stored.sealed_credential, leg.id.as_bytes())
                .unwrap(),
            "api-key-123"
        );
        assert!(engine_box
            .open(&stored.sealed_credential, Uuid::new_v4().as_bytes())
            .is_err());
    }

    #[test]
    fn empty_credential_is_rejected() {
        let (registry, _ledger, _box, _dir) = registry();
        assert!(matches!(
            registry.provision(leg(), ""),
            Err(PoolError::Validation(_))
        ));
    }

    #[test]
    fn deactivated_leg_leaves_the_active_set() {
        let (registry, ledger, _box, _dir) = registry();
        let leg = registry.provision(leg(), "k").unwrap();
        registry.update_signals(leg.id, 0.02, 0.1).unwrap();
        registry.deactivate(leg.id).unwrap();

        let stored = ledger.get_leg(leg.id).unwrap().unwrap();
        assert!(!stored.active);
        assert_eq!(stored.recent_log_return, 0.02);
        assert!(ledger.active_legs(leg.customer_id).unwrap().is_empty());
        assert!(matches!(
            registry.deactivate(Uuid::new_v4()),
            Err(PoolError::NotFound(_))
        ));
    }
}
