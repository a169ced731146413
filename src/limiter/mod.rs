//! Token bucket admission control
//!
//! What this module provides
//! - `TokenBucket { capacity, available, last_refill }` granting at most
//!   `capacity` admissions in a burst and one more per elapsed `refill_period`
//!
//! Implementation strategy
//! - Time is passed in explicitly (`now`) so the bucket is a plain value the
//!   scheduler task owns; no locks, no clock of its own
//! - Refill counts whole elapsed periods and advances `last_refill` by exactly
//!   that many periods, so fractional progress towards the next credit is kept
//!
//! Testing strategy
//! - Deterministic instants built from a fixed origin
//! - Property test: `0 <= available <= capacity` for arbitrary admit/advance sequences

use std::time::Duration;

use tokio::time::Instant;

/// Bounded admission credits refilled over time.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    available: u32,
    refill_period: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket whose refill clock starts at `now`.
    ///
    /// `refill_period` must be non-zero; `SchedulerConfig::validate` enforces it.
    pub fn new(capacity: u32, refill_period: Duration, now: Instant) -> Self {
        Self {
            capacity,
            available: capacity,
            refill_period,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Credit every whole refill period elapsed since the last refill.
    pub fn refill(&mut self, now: Instant) {
        let period = self.refill_period.as_nanos();
        if period == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let units = elapsed / period;
        if units == 0 {
            return;
        }

        let room = u128::from(self.capacity - self.available);
        self.available += units.min(room) as u32;

        let advance = units.saturating_mul(period).min(u128::from(u64::MAX)) as u64;
        self.last_refill += Duration::from_nanos(advance);
    }

    /// Take one credit if there is one.
    pub fn try_admit(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.available > 0 {
            self.available -= 1;
            true
        } else {
            false
        }
    }

    /// When the next credit will be earned.
    pub fn next_refill_at(&self) -> Instant {
        self.last_refill + self.refill_period
    }

    /// Back to full capacity with the refill clock restarted at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.available = self.capacity;
        self.last_refill = now;
    }
}
