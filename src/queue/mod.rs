//! Deduplicating request queue
//!
//! What this module provides
//! - `DedupQueue`: FIFO of `QueuedMutation`s holding at most one entry per key
//! - Last-write-wins merging: a later enqueue for a pending key replaces its
//!   target and payload in place and adds its caller to the entry's waiters
//! - The create/delete conflict rule: deleting a resource whose creation is
//!   still queued cancels both without any transport call
//!
//! Implementation strategy
//! - A `VecDeque` scanned by key; client-side queues stay small and the scan
//!   keeps FIFO position and key identity in one structure
//! - Waiters are `oneshot` senders; `QueuedMutation::resolve` consumes the
//!   entry so every waiter is notified exactly once
//!
//! Testing strategy
//! - Drive the queue directly with `oneshot` channels and assert on both the
//!   queue contents and what each receiver observes

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::error::SyncError;
use crate::mutation::{Operation, Target, TransportRequest};

/// What every `enqueue` caller eventually observes. `Ok(None)` is the empty result.
pub type Outcome = Result<Option<Value>, SyncError>;

/// Completion channel of one caller.
pub type Waiter = oneshot::Sender<Outcome>;

/// One pending mutation per key.
#[derive(Debug)]
pub struct QueuedMutation {
    pub key: String,
    pub target: Target,
    pub payload: Option<Value>,
    /// Arrival sequence number, assigned on creation and kept across merges
    pub order: u64,
    pub retry_count: u32,
    /// Set while the entry waits out a retry backoff
    pub not_before: Option<Instant>,
    waiters: Vec<Waiter>,
}

impl QueuedMutation {
    fn new(key: String, operation: Operation, order: u64, waiter: Waiter) -> Self {
        Self {
            key,
            target: operation.target,
            payload: operation.payload,
            order,
            retry_count: 0,
            not_before: None,
            waiters: vec![waiter],
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    /// Snapshot of what the transport should receive for this entry.
    pub fn request(&self) -> TransportRequest {
        TransportRequest {
            key: self.key.clone(),
            address: self.target.address.clone(),
            method: self.target.method,
            payload: self.payload.clone(),
            attempt: self.retry_count + 1,
        }
    }

    /// Deliver one outcome to every waiter and discard the entry.
    pub fn resolve(self, outcome: Outcome) {
        for waiter in self.waiters {
            // a caller that stopped listening is not an error
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Result of `DedupQueue::push_or_merge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New entry appended at the back
    Queued,
    /// Merged into the pending entry for the key; `waiters` now share it
    Coalesced { waiters: usize },
    /// Create followed by delete: both sides already resolved empty
    Cancelled,
}

/// FIFO queue with one entry per key.
#[derive(Debug, Default)]
pub struct DedupQueue {
    entries: VecDeque<QueuedMutation>,
    next_order: u64,
}

impl DedupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn get(&self, key: &str) -> Option<&QueuedMutation> {
        self.entries.iter().find(|m| m.key == key)
    }

    /// Keys in queue order.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.key.as_str()).collect()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.key == key)
    }

    /// Add `operation` under `key`, merging with or cancelling a pending entry.
    pub fn push_or_merge(&mut self, key: String, operation: Operation, waiter: Waiter) -> Admission {
        let Some(idx) = self.position(&key) else {
            let order = self.next_order;
            self.next_order += 1;
            debug!(key = %key, order, method = %operation.method(), "queued");
            self.entries
                .push_back(QueuedMutation::new(key, operation, order, waiter));
            return Admission::Queued;
        };

        if self.entries[idx].target.method.is_create() && operation.method().is_delete() {
            if let Some(pending) = self.entries.remove(idx) {
                debug!(key = %key, "create cancelled by delete before flush");
                pending.resolve(Ok(None));
            }
            let _ = waiter.send(Ok(None));
            return Admission::Cancelled;
        }

        let entry = &mut self.entries[idx];
        entry.target = operation.target;
        entry.payload = operation.payload;
        entry.waiters.push(waiter);
        debug!(
            key = %key,
            waiters = entry.waiters.len(),
            method = %entry.target.method,
            "coalesced into pending mutation"
        );
        Admission::Coalesced {
            waiters: entry.waiters.len(),
        }
    }

    pub fn pop_front(&mut self) -> Option<QueuedMutation> {
        self.entries.pop_front()
    }

    /// Remove the front-most entry whose backoff has elapsed.
    pub fn take_ready(&mut self, now: Instant) -> Option<QueuedMutation> {
        let idx = self.entries.iter().position(|m| m.is_ready(now))?;
        self.entries.remove(idx)
    }

    pub fn has_ready(&self, now: Instant) -> bool {
        self.entries.iter().any(|m| m.is_ready(now))
    }

    /// Earliest backoff deadline among entries still waiting one out.
    pub fn next_ready_at(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter_map(|m| m.not_before)
            .filter(|t| *t > now)
            .min()
    }

    /// Put a failed mutation back ahead of everything else.
    ///
    /// If the key was enqueued again while the call was in flight, the newer
    /// entry wins: its target and payload are kept, the failed entry's waiters
    /// and retry state are folded into it, and it moves to the front.
    pub fn requeue_front(&mut self, mut failed: QueuedMutation) {
        if let Some(idx) = self.position(&failed.key) {
            if let Some(mut newer) = self.entries.remove(idx) {
                failed.waiters.append(&mut newer.waiters);
                newer.waiters = failed.waiters;
                newer.retry_count = failed.retry_count;
                newer.not_before = failed.not_before;
                newer.order = failed.order;
                self.entries.push_front(newer);
                return;
            }
        }
        self.entries.push_front(failed);
    }

    pub fn remove(&mut self, key: &str) -> Option<QueuedMutation> {
        let idx = self.position(key)?;
        self.entries.remove(idx)
    }

    /// Empty the queue, handing back every pending entry.
    pub fn drain_all(&mut self) -> Vec<QueuedMutation> {
        self.entries.drain(..).collect()
    }
}
