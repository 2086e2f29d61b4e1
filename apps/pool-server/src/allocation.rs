// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Allocation Engine
//!
//! Turns a total amount and per-leg weights into individual leg amounts that
//! respect each leg's `[min_amount, max_amount]` window.
//!
//! ## Algorithm
//!
//! 1. `reserve = floor(total × reserve_pct)`, `allocatable = total − reserve`.
//!    Nothing to allocate yields an empty plan.
//! 2. Score every leg (performance/risk blend for deposits, exact balance
//!    proportion for withdrawals) and take `floor(allocatable × score)`.
//! 3. Constraint pass in leg order: round sub-minimum amounts up to the
//!    minimum when the unallocated remainder allows it (otherwise zero),
//!    clamp to the maximum, never exceed the remainder, and drop anything
//!    below the global `min_send` floor.
//! 4. Top-up: hand the remainder to the highest-scoring leg with headroom,
//!    retire that leg, and repeat until the remainder or the headroom runs
//!    out. Whatever is left is dropped.
//!
//! Everything here is pure and deterministic.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Leg;

/// Volatility floor for the inverse-volatility risk weight.
const VOLATILITY_EPSILON: f64 = 1e-6;

/// Tunables for deposit-style allocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AllocationParams {
    /// Fraction of the total held back, in `[0, 1]`.
    pub reserve_pct: f64,
    /// Return-chasing (1.0) versus risk-parity (0.0) blend, in `[0, 1]`.
    pub beta: f64,
    /// Transfers below this amount are skipped.
    pub min_send: i64,
}

impl Default for AllocationParams {
    fn default() -> Self {
        Self {
            reserve_pct: 0.0,
            beta: 0.5,
            min_send: 0,
        }
    }
}

/// One `(leg, amount)` pair of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedLeg {
    pub leg_id: Uuid,
    pub amount: i64,
    /// Normalized score the amount was derived from.
    pub score: f64,
}

/// Ordered allocation result for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub total: i64,
    pub reserve: i64,
    pub allocatable: i64,
    /// One entry per input leg, in input order. Empty when nothing was
    /// allocatable.
    pub legs: Vec<PlannedLeg>,
}

impl AllocationPlan {
    fn empty(total: i64, reserve: i64, allocatable: i64) -> Self {
        Self {
            total,
            reserve,
            allocatable,
            legs: Vec::new(),
        }
    }

    /// Sum of all leg amounts.
    pub fn allocated(&self) -> i64 {
        self.legs.iter().map(|l| l.amount).sum()
    }

    /// Allocatable funds no leg could absorb.
    pub fn undistributed(&self) -> i64 {
        self.allocatable.max(0) - self.allocated()
    }

    /// Legs that receive a non-zero amount.
    pub fn funded(&self) -> impl Iterator<Item = &PlannedLeg> {
        self.legs.iter().filter(|l| l.amount > 0)
    }

    pub fn amount_for(&self, leg_id: Uuid) -> i64 {
        self.legs
            .iter()
            .find(|l| l.leg_id == leg_id)
            .map(|l| l.amount)
            .unwrap_or(0)
    }
}

/// Input row for balance-proportional allocation.
#[derive(Debug, Clone, Copy)]
pub struct ProportionalLeg {
    pub leg_id: Uuid,
    /// Relative weight (a balance). Negative weights count as zero.
    pub weight: i64,
    pub max_amount: i64,
}

struct Slot {
    leg_id: Uuid,
    min: i64,
    max: i64,
    raw: i64,
    score: f64,
}

// =============================================================================
// Public entry points
// =============================================================================

/// Deposit-style allocation scored by recent performance and risk.
///
/// Performance weight is `max(0, recent_log_return)`, risk weight is
/// `1 / max(recent_volatility, ε)`; each vector is normalized (equal weights
/// if it sums to zero) and blended as `β·perf + (1−β)·risk`.
pub fn allocate(total: i64, legs: &[Leg], params: &AllocationParams) -> AllocationPlan {
    let reserve_pct = clamp_unit(params.reserve_pct);
    let reserve = ((total as f64) * reserve_pct).floor() as i64;
    let allocatable = total - reserve;
    if allocatable <= 0 || legs.is_empty() {
        return AllocationPlan::empty(total, reserve, allocatable);
    }

    let perf: Vec<f64> = legs
        .iter()
        .map(|l| finite_or_zero(l.recent_log_return).max(0.0))
        .collect();
    let risk: Vec<f64> = legs
        .iter()
        .map(|l| 1.0 / finite_or_zero(l.recent_volatility).max(VOLATILITY_EPSILON))
        .collect();

    let perf = normalize(&perf);
    let risk = normalize(&risk);
    let beta = clamp_unit(params.beta);
    let blended: Vec<f64> = perf
        .iter()
        .zip(&risk)
        .map(|(p, r)| beta * p + (1.0 - beta) * r)
        .collect();
    let scores = normalize(&blended);

    let slots = legs
        .iter()
        .zip(&scores)
        .map(|(leg, &score)| Slot {
            leg_id: leg.id,
            min: leg.min_amount.max(0),
            max: leg.max_amount.max(0),
            raw: ((allocatable as f64) * score).floor().clamp(0.0, allocatable as f64) as i64,
            score,
        })
        .collect();

    AllocationPlan {
        total,
        reserve,
        allocatable,
        legs: distribute(allocatable, slots, params.min_send),
    }
}

/// Split `total` in exact proportion to integer weights (no reserve).
///
/// Amounts are computed with integer arithmetic so that, for example,
/// balances of 3000 and 7000 split 10000 into exactly 3000 and 7000. Each
/// leg is capped at its `max_amount`.
pub fn allocate_proportional(total: i64, legs: &[ProportionalLeg], min_send: i64) -> AllocationPlan {
    if total <= 0 || legs.is_empty() {
        return AllocationPlan::empty(total, 0, total);
    }

    let weights: Vec<i128> = legs.iter().map(|l| l.weight.max(0) as i128).collect();
    let sum: i128 = weights.iter().sum();
    let count = legs.len() as i128;

    let slots = legs
        .iter()
        .zip(&weights)
        .map(|(leg, &w)| {
            let (raw, score) = if sum == 0 {
                (total as i128 / count, 1.0 / count as f64)
            } else {
                (total as i128 * w / sum, w as f64 / sum as f64)
            };
            Slot {
                leg_id: leg.leg_id,
                min: 0,
                max: leg.max_amount.max(0),
                raw: raw as i64,
                score,
            }
        })
        .collect();

    AllocationPlan {
        total,
        reserve: 0,
        allocatable: total,
        legs: distribute(total, slots, min_send),
    }
}

// =============================================================================
// Constraint and top-up passes
// =============================================================================

fn distribute(allocatable: i64, slots: Vec<Slot>, min_send: i64) -> Vec<PlannedLeg> {
    let mut remaining = allocatable;
    let mut amounts = Vec::with_capacity(slots.len());

    for slot in &slots {
        let mut amount = slot.raw.max(0);
        if amount > 0 && amount < slot.min {
            amount = if remaining >= slot.min { slot.min } else { 0 };
        }
        if amount > slot.max {
            amount = slot.max;
        }
        if amount > remaining {
            amount = remaining;
            if amount < slot.min {
                amount = 0;
            }
        }
        if amount < min_send {
            amount = 0;
        }
        remaining -= amount;
        amounts.push(amount);
    }

    let mut priority: Vec<f64> = slots.iter().map(|s| s.score).collect();
    while remaining > 0 {
        let mut best: Option<usize> = None;
        for (i, slot) in slots.iter().enumerate() {
            if priority[i] == f64::NEG_INFINITY {
                continue;
            }
            let headroom = slot.max - amounts[i];
            if headroom <= 0 {
                continue;
            }
            // An unfunded leg may only be opened if it can reach its floor.
            if amounts[i] == 0 {
                let floor = slot.min.max(min_send).max(1);
                if remaining.min(headroom) < floor {
                    continue;
                }
            }
            if best.map_or(true, |b| priority[i] > priority[b]) {
                best = Some(i);
            }
        }

        let Some(idx) = best else { break };
        let increment = remaining.min(slots[idx].max - amounts[idx]);
        amounts[idx] += increment;
        remaining -= increment;
        priority[idx] = f64::NEG_INFINITY;
    }

    slots
        .into_iter()
        .zip(amounts)
        .map(|(slot, amount)| PlannedLeg {
            leg_id: slot.leg_id,
            amount,
            score: slot.score,
        })
        .collect()
}

/// Scale to unit sum; all-zero input falls back to equal weights.
fn normalize(values: &[f64]) -> Vec<f64> {
    let sum: f64 = values.iter().copied().map(finite_or_zero).sum();
    if values.is_empty() {
        return Vec::new();
    }
    if sum <= 0.0 || !sum.is_finite() {
        let equal = 1.0 / values.len() as f64;
        return vec![equal; values.len()];
    }
    values.iter().map(|v| finite_or_zero(*v) / sum).collect()
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

fn clamp_unit(v: f64) -> f64 {
    finite_or_zero(v).clamp(0.0, 1.0)
}
