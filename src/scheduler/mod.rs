//! Flush cycle: the write-coalescing scheduler
//!
//! What this module provides
//! - `SyncBatcher`: a cheap-clone handle whose `enqueue(key, operation)`
//!   registers a mutation immediately and returns a `MutationFuture`
//! - A single flush task per handle family that owns the dedup queue, the
//!   token bucket and the draining state; nothing else touches them
//! - `tower::Service<Mutation>` for the handle, so it composes with other layers
//!
//! State machine
//! - `Idle --enqueue--> Scheduled` (quiet-period timer armed, restarted on every
//!   enqueue that arrives outside a drain)
//! - `Scheduled --quiet timer--> Draining` when the queue is non-empty
//! - `Draining`: one transport call in flight at a time; entries are taken
//!   front to back, skipping those still in backoff, including ones that
//!   arrive while the drain is running
//! - admission denied, offline, or nothing ready → `Scheduled` (with a wake-up)
//!   or `Idle` once the queue is empty
//! - backoff and refill wake-ups re-arm the quiet timer rather than draining
//!   directly, so bursts that arrive meanwhile still coalesce
//!
//! Implementation strategy
//! - Handles talk to the task over an unbounded mpsc channel; the task
//!   `select!`s over commands, the in-flight call and the next timer deadline
//! - Waiters are `oneshot` senders stored on the queued entry
//! - The transport is any `Clone` Tower service; it is cloned per call so the
//!   in-flight future is `'static`
//!
//! Testing strategy
//! - `#[tokio::test(start_paused = true)]` so quiet periods, backoff and refill
//!   run on the virtual clock
//! - Scripted `service_fn` transports recording every request

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::error::{Result, SyncError};
use crate::limiter::TokenBucket;
use crate::mutation::{Mutation, Operation, TransportRequest};
use crate::observability::{MetricsSnapshot, SchedulerMetrics};
use crate::probe::{Always, Probe};
use crate::queue::{Admission, DedupQueue, Outcome, QueuedMutation, Waiter};
use crate::retry::{RetryDecision, RetryPolicy};

/// Where the flush cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushState {
    /// Nothing queued, no timer armed
    Idle,
    /// Waiting on the quiet period or a backoff/refill wake-up
    Scheduled,
    /// A transport call is in flight
    Draining,
}

/// Point-in-time view of the flush task, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub state: FlushState,
    /// Pending keys in queue order (the in-flight mutation is not listed)
    pub pending: Vec<String>,
    pub in_flight: Option<String>,
    pub available_credits: u32,
}

enum Command {
    Enqueue {
        key: String,
        operation: Operation,
        waiter: Waiter,
    },
    Status {
        reply: oneshot::Sender<QueueStatus>,
    },
    Reset {
        done: oneshot::Sender<()>,
    },
}

/// Resolves with the shared outcome of the mutation it was enqueued into.
#[must_use = "the outcome tells the caller whether to roll back"]
pub struct MutationFuture {
    inner: Pending,
}

enum Pending {
    Ready(Option<Outcome>),
    Waiting(oneshot::Receiver<Outcome>),
}

impl MutationFuture {
    fn ready(outcome: Outcome) -> Self {
        Self {
            inner: Pending::Ready(Some(outcome)),
        }
    }

    fn waiting(rx: oneshot::Receiver<Outcome>) -> Self {
        Self {
            inner: Pending::Waiting(rx),
        }
    }
}

impl Future for MutationFuture {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Pending::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(SyncError::SchedulerClosed)))
            }
            // the sender is only dropped without sending when the task is gone
            Pending::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|res| res.unwrap_or(Err(SyncError::SchedulerClosed))),
        }
    }
}

/// Handle to one write-coalescing scheduler.
///
/// Construct one per client session at startup and pass clones to every
/// state holder; all clones feed the same queue.
#[derive(Clone)]
pub struct SyncBatcher {
    tx: mpsc::UnboundedSender<Command>,
    client_context: Arc<dyn Probe>,
    metrics: Arc<SchedulerMetrics>,
}

impl std::fmt::Debug for SyncBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBatcher")
            .field("closed", &self.tx.is_closed())
            .field("metrics", &self.metrics.snapshot())
            .finish()
    }
}

/// Builder for `SyncBatcher`.
pub struct SyncBatcherBuilder<T> {
    config: SchedulerConfig,
    transport: T,
    client_context: Arc<dyn Probe>,
    connectivity: Arc<dyn Probe>,
}

impl<T> SyncBatcherBuilder<T>
where
    T: Service<TransportRequest, Response = Option<Value>, Error = BoxError>
        + Clone
        + Send
        + 'static,
    T::Future: Send + 'static,
{
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Probe for a live client; when it answers `false`, `enqueue` is a no-op.
    pub fn client_context(mut self, probe: impl Probe) -> Self {
        self.client_context = Arc::new(probe);
        self
    }

    /// Probe for network reachability; when it answers `false`, flushes re-arm.
    pub fn connectivity(mut self, probe: impl Probe) -> Self {
        self.connectivity = Arc::new(probe);
        self
    }

    /// Validate the configuration and start the flush task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self) -> Result<SyncBatcher> {
        self.config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(SchedulerMetrics::new());
        let now = Instant::now();

        let cycle = FlushCycle {
            queue: DedupQueue::new(),
            bucket: TokenBucket::new(
                self.config.bucket_capacity,
                self.config.refill_period,
                now,
            ),
            retry: RetryPolicy::new(self.config.retry.clone()),
            transport: self.transport,
            connectivity: self.connectivity,
            metrics: metrics.clone(),
            quiet_deadline: None,
            wake_at: None,
            in_flight: None,
            config: self.config,
        };
        tokio::spawn(cycle.run(rx).instrument(info_span!("sync_batcher")));

        Ok(SyncBatcher {
            tx,
            client_context: self.client_context,
            metrics,
        })
    }
}

impl SyncBatcher {
    pub fn builder<T>(transport: T) -> SyncBatcherBuilder<T>
    where
        T: Service<TransportRequest, Response = Option<Value>, Error = BoxError>
            + Clone
            + Send
            + 'static,
        T::Future: Send + 'static,
    {
        SyncBatcherBuilder {
            config: SchedulerConfig::default(),
            transport,
            client_context: Arc::new(Always),
            connectivity: Arc::new(Always),
        }
    }

    /// Spawn with the given configuration, always-present context and always-online connectivity.
    pub fn spawn<T>(config: SchedulerConfig, transport: T) -> Result<Self>
    where
        T: Service<TransportRequest, Response = Option<Value>, Error = BoxError>
            + Clone
            + Send
            + 'static,
        T::Future: Send + 'static,
    {
        Self::builder(transport).config(config).spawn()
    }

    /// Queue `operation` under `key`.
    ///
    /// Registration happens before this returns; the future only waits for
    /// the shared outcome. Without a client context the future is already
    /// resolved with the empty result and nothing is queued.
    pub fn enqueue(&self, key: impl Into<String>, operation: Operation) -> MutationFuture {
        let key = key.into();
        if !self.client_context.check() {
            self.metrics.record_skipped();
            debug!(key = %key, "no client context, enqueue skipped");
            return MutationFuture::ready(Ok(None));
        }

        let (waiter, rx) = oneshot::channel();
        let cmd = Command::Enqueue {
            key,
            operation,
            waiter,
        };
        if self.tx.send(cmd).is_err() {
            return MutationFuture::ready(Err(SyncError::SchedulerClosed));
        }
        MutationFuture::waiting(rx)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .map_err(|_| SyncError::SchedulerClosed)?;
        rx.await.map_err(|_| SyncError::SchedulerClosed)
    }

    /// Test-only: reject every pending mutation with `SyncError::Reset`,
    /// cancel timers, and refill the bucket. Not part of production flow.
    #[doc(hidden)]
    pub async fn reset(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Reset { done })
            .map_err(|_| SyncError::SchedulerClosed)?;
        rx.await.map_err(|_| SyncError::SchedulerClosed)
    }
}

impl Service<Mutation> for SyncBatcher {
    type Response = Option<Value>;
    type Error = SyncError;
    type Future = MutationFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        if self.tx.is_closed() {
            Poll::Ready(Err(SyncError::SchedulerClosed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, req: Mutation) -> Self::Future {
        self.enqueue(req.key, req.operation)
    }
}

struct InFlight {
    mutation: QueuedMutation,
    call: BoxFuture<'static, std::result::Result<Option<Value>, BoxError>>,
}

struct FlushCycle<T> {
    queue: DedupQueue,
    bucket: TokenBucket,
    retry: RetryPolicy,
    config: SchedulerConfig,
    transport: T,
    connectivity: Arc<dyn Probe>,
    metrics: Arc<SchedulerMetrics>,
    quiet_deadline: Option<Instant>,
    wake_at: Option<Instant>,
    in_flight: Option<InFlight>,
}

async fn in_flight_result(
    slot: &mut Option<InFlight>,
) -> std::result::Result<Option<Value>, BoxError> {
    match slot {
        Some(flight) => flight.call.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

impl<T> FlushCycle<T>
where
    T: Service<TransportRequest, Response = Option<Value>, Error = BoxError>
        + Clone
        + Send
        + 'static,
    T::Future: Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut open = true;
        loop {
            if !open && self.queue.is_empty() && self.in_flight.is_none() {
                break;
            }
            let deadline = earliest(self.quiet_deadline, self.wake_at);
            let draining = self.in_flight.is_some();

            tokio::select! {
                biased;
                cmd = rx.recv(), if open => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        debug!(pending = self.queue.len(), "all handles dropped, draining what is left");
                        open = false;
                    }
                },
                result = in_flight_result(&mut self.in_flight), if draining => {
                    self.complete(result);
                }
                _ = sleep_opt(deadline), if !draining && deadline.is_some() => {
                    self.on_timer();
                }
                else => break,
            }
        }
        debug!("sync batcher stopped");
    }

    fn state(&self) -> FlushState {
        if self.in_flight.is_some() {
            FlushState::Draining
        } else if self.quiet_deadline.is_some() || self.wake_at.is_some() {
            FlushState::Scheduled
        } else {
            FlushState::Idle
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue {
                key,
                operation,
                waiter,
            } => match self.queue.push_or_merge(key, operation, waiter) {
                Admission::Queued => {
                    self.metrics.record_enqueued();
                    self.after_enqueue();
                }
                Admission::Coalesced { .. } => {
                    self.metrics.record_enqueued();
                    self.metrics.record_coalesced();
                    self.after_enqueue();
                }
                Admission::Cancelled => {
                    self.metrics.record_cancelled();
                }
            },
            Command::Status { reply } => {
                self.bucket.refill(Instant::now());
                let _ = reply.send(QueueStatus {
                    state: self.state(),
                    pending: self.queue.keys().into_iter().map(str::to_owned).collect(),
                    in_flight: self.in_flight.as_ref().map(|f| f.mutation.key.clone()),
                    available_credits: self.bucket.available(),
                });
            }
            Command::Reset { done } => {
                self.reset();
                let _ = done.send(());
            }
        }
    }

    fn reset(&mut self) {
        let now = Instant::now();
        if let Some(flight) = self.in_flight.take() {
            let key = flight.mutation.key.clone();
            flight.mutation.resolve(Err(SyncError::Reset { key }));
        }
        for mutation in self.queue.drain_all() {
            let key = mutation.key.clone();
            mutation.resolve(Err(SyncError::Reset { key }));
        }
        self.quiet_deadline = None;
        self.wake_at = None;
        self.bucket.reset(now);
        info!("sync batcher reset");
    }

    /// A running drain picks new entries up itself; otherwise the quiet
    /// period restarts.
    fn after_enqueue(&mut self) {
        if self.in_flight.is_none() {
            self.arm_quiet(Instant::now());
        }
    }

    /// Restart the quiet-period countdown.
    fn arm_quiet(&mut self, now: Instant) {
        self.quiet_deadline = Some(now + self.config.quiet_period);
    }

    fn schedule_wake(&mut self, at: Instant) {
        self.wake_at = earliest(self.wake_at, Some(at));
    }

    fn on_timer(&mut self) {
        let now = Instant::now();

        if self.quiet_deadline.is_some_and(|t| t <= now) {
            self.quiet_deadline = None;
            if self.queue.is_empty() {
                debug!("quiet period over, nothing queued");
            } else {
                self.start_drain(now);
                return;
            }
        }

        if self.wake_at.is_some_and(|t| t <= now) {
            self.wake_at = None;
            debug!(pending = self.queue.len(), "wake-up, re-arming quiet period");
            self.arm_quiet(now);
        }
    }

    fn start_drain(&mut self, now: Instant) {
        if self.in_flight.is_some() {
            return;
        }
        debug!(pending = self.queue.len(), "draining");
        self.dispatch_next(now);
    }

    /// Admit and send the next ready entry, or end the drain.
    fn dispatch_next(&mut self, now: Instant) {
        if !self.queue.has_ready(now) {
            self.finish_drain(now, false);
            return;
        }

        if !self.connectivity.check() {
            self.metrics.record_offline();
            info!(pending = self.queue.len(), "offline, postponing flush");
            self.arm_quiet(now);
            self.finish_drain(now, false);
            return;
        }

        if !self.bucket.try_admit(now) {
            self.metrics.record_throttled();
            debug!(
                pending = self.queue.len(),
                next_refill_in_ms = self
                    .bucket
                    .next_refill_at()
                    .saturating_duration_since(now)
                    .as_millis() as u64,
                "admission denied, waiting for refill"
            );
            self.finish_drain(now, true);
            return;
        }

        let Some(mutation) = self.queue.take_ready(now) else {
            self.finish_drain(now, false);
            return;
        };

        self.metrics.record_dispatched();
        let req = mutation.request();
        let mut svc = self.transport.clone();
        let call: BoxFuture<'static, std::result::Result<Option<Value>, BoxError>> =
            Box::pin(async move { svc.ready().await?.call(req).await });
        self.in_flight = Some(InFlight { mutation, call });
    }

    fn complete(&mut self, result: std::result::Result<Option<Value>, BoxError>) {
        let now = Instant::now();
        let Some(InFlight { mut mutation, .. }) = self.in_flight.take() else {
            return;
        };

        match result {
            Ok(body) => {
                self.metrics.record_succeeded();
                debug!(
                    key = %mutation.key,
                    waiters = mutation.waiter_count(),
                    "mutation confirmed"
                );
                mutation.resolve(Ok(body));
            }
            Err(err) => {
                let reason = err.to_string();
                match self
                    .retry
                    .on_failure(&mutation.key, mutation.retry_count, &reason)
                {
                    RetryDecision::Retry { retry, delay } => {
                        self.metrics.record_retried();
                        mutation.retry_count = retry;
                        mutation.not_before = Some(now + delay);
                        self.queue.requeue_front(mutation);
                        self.schedule_wake(now + delay);
                    }
                    RetryDecision::GiveUp { attempts } => {
                        self.metrics.record_exhausted();
                        warn!(
                            key = %mutation.key,
                            attempts,
                            waiters = mutation.waiter_count(),
                            "rejecting waiters"
                        );
                        let key = mutation.key.clone();
                        mutation.resolve(Err(SyncError::RetriesExhausted {
                            key,
                            attempts: attempts as usize,
                            reason,
                        }));
                    }
                }
            }
        }

        self.dispatch_next(now);
    }

    /// Leave `Draining`, making sure whatever is still queued has a timer.
    fn finish_drain(&mut self, now: Instant, throttled: bool) {
        if self.queue.is_empty() {
            debug!(state = ?self.state(), "drain finished");
            return;
        }
        if throttled {
            self.schedule_wake(self.bucket.next_refill_at());
        }
        if let Some(at) = self.queue.next_ready_at(now) {
            self.schedule_wake(at);
        }
        if self.quiet_deadline.is_none() && self.wake_at.is_none() {
            self.arm_quiet(now);
        }
        debug!(
            pending = self.queue.len(),
            state = ?self.state(),
            "drain paused"
        );
    }
}
