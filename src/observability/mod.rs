//! Observability: tracing and metrics
//!
//! What this module provides
//! - Structured tracing around transport calls and counters for every
//!   scheduler transition
//!
//! Exports
//! - Models
//!   - `SchedulerMetrics` (atomic counters, shared between the flush task and handles)
//!   - `MetricsSnapshot` (serializable point-in-time copy)
//! - Layers
//!   - `TracingLayer<S>` creating a span per transport call with fields: key, method, address, attempt
//!
//! Implementation strategy
//! - The flush task is the only writer; handles read snapshots, so relaxed
//!   atomics are sufficient
//! - `TracingLayer` wraps any transport service and stays `Clone` so the
//!   scheduler can clone it per call
//!
//! Testing strategy
//! - Unit tests on counters; scheduler integration tests assert snapshots

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::Value;
use tower::{BoxError, Layer, Service};
use tracing::{debug, info_span, warn, Instrument};

use crate::mutation::TransportRequest;

/// Counters for one scheduler instance.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub enqueued: AtomicU64,
    pub coalesced: AtomicU64,
    pub cancelled: AtomicU64,
    pub skipped_no_context: AtomicU64,
    pub dispatched: AtomicU64,
    pub succeeded: AtomicU64,
    pub retried: AtomicU64,
    pub exhausted: AtomicU64,
    pub throttled: AtomicU64,
    pub offline_pauses: AtomicU64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueued(&self) {
        Self::bump(&self.enqueued);
    }

    pub fn record_coalesced(&self) {
        Self::bump(&self.coalesced);
    }

    pub fn record_cancelled(&self) {
        Self::bump(&self.cancelled);
    }

    pub fn record_skipped(&self) {
        Self::bump(&self.skipped_no_context);
    }

    pub fn record_dispatched(&self) {
        Self::bump(&self.dispatched);
    }

    pub fn record_succeeded(&self) {
        Self::bump(&self.succeeded);
    }

    pub fn record_retried(&self) {
        Self::bump(&self.retried);
    }

    pub fn record_exhausted(&self) {
        Self::bump(&self.exhausted);
    }

    pub fn record_throttled(&self) {
        Self::bump(&self.throttled);
    }

    pub fn record_offline(&self) {
        Self::bump(&self.offline_pauses);
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            skipped_no_context: self.skipped_no_context.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            offline_pauses: self.offline_pauses.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub coalesced: u64,
    pub cancelled: u64,
    pub skipped_no_context: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub throttled: u64,
    pub offline_pauses: u64,
}

/// Layer that adds a span and outcome logging around transport calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl TracingLayer {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone)]
pub struct Tracing<S> {
    inner: S,
}

impl<S> Layer<S> for TracingLayer {
    type Service = Tracing<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Tracing { inner }
    }
}

impl<S> Service<TransportRequest> for Tracing<S>
where
    S: Service<TransportRequest, Response = Option<Value>, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Option<Value>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: TransportRequest) -> Self::Future {
        let span = info_span!(
            "sync_transport",
            key = %req.key,
            method = %req.method,
            address = %req.address,
            attempt = req.attempt
        );
        let fut = self.inner.call(req).instrument(span.clone());
        Box::pin(async move {
            let out = fut.await;
            let _enter = span.enter();
            match &out {
                Ok(body) => debug!(has_body = body.is_some(), "transport ok"),
                Err(e) => warn!(error = %e, "transport failed"),
            }
            out
        })
    }
}
