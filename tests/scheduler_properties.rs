//! End-to-end behavior of the flush cycle against scripted transports.
//!
//! All tests run on tokio's paused clock, so quiet periods, backoff and bucket
//! refills elapse instantly but in a deterministic order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{json, Value};
use sync_batch::{
    ConfigBuilder, Flag, FlushState, Method, Mutation, Operation, SchedulerConfig, SyncBatcher,
    SyncError, TransportRequest,
};
use tokio::time::{sleep, Instant};
use tower::{BoxError, Service, ServiceExt};

/// Transport that records every request, echoes the payload back, and fails
/// a scripted number of times per key.
#[derive(Clone, Default)]
struct Scripted {
    calls: Arc<Mutex<Vec<(Instant, TransportRequest)>>>,
    failures: Arc<Mutex<HashMap<String, usize>>>,
    latency: Duration,
}

impl Scripted {
    fn new() -> Self {
        Self::default()
    }

    fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    fn fail(self, key: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(key.to_owned(), times);
        self
    }

    fn calls(&self) -> Vec<(Instant, TransportRequest)> {
        self.calls.lock().unwrap().clone()
    }

    fn keys(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, req)| req.key).collect()
    }
}

impl Service<TransportRequest> for Scripted {
    type Response = Option<Value>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Option<Value>, BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: TransportRequest) -> Self::Future {
        self.calls.lock().unwrap().push((Instant::now(), req.clone()));
        let fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&req.key) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                sleep(latency).await;
            }
            if fail {
                Err("Request failed: Internal Server Error".into())
            } else {
                Ok(req.payload)
            }
        })
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn put(title: &str) -> Operation {
    Operation::put("/api/chats", json!({ "title": title }))
}

#[tokio::test(start_paused = true)]
async fn same_key_coalesces_into_one_call_with_last_payload() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();
    let start = Instant::now();

    let futures = vec![
        batcher.enqueue("update-chat-1", put("a")),
        batcher.enqueue("update-chat-1", put("b")),
        batcher.enqueue("update-chat-1", put("c")),
    ];
    let outcomes = join_all(futures).await;

    for outcome in outcomes {
        assert_eq!(outcome.unwrap(), Some(json!({ "title": "c" })));
    }
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.payload, Some(json!({ "title": "c" })));
    assert_eq!(calls[0].1.attempt, 1);
    assert!(calls[0].0 - start >= ms(1500));

    let metrics = batcher.metrics();
    assert_eq!(metrics.enqueued, 3);
    assert_eq!(metrics.coalesced, 2);
    assert_eq!(metrics.dispatched, 1);
}

#[tokio::test(start_paused = true)]
async fn every_enqueue_restarts_the_quiet_period() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();
    let start = Instant::now();

    let first = batcher.enqueue("update-chat-1", put("a"));
    sleep(ms(1000)).await;
    assert!(transport.calls().is_empty());
    let second = batcher.enqueue("update-chat-1", put("b"));

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), b.unwrap());
    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].0 - start >= ms(2500));
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_are_sent_separately_in_arrival_order() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();

    let outcomes = join_all(vec![
        batcher.enqueue("update-chat-1", put("one")),
        batcher.enqueue("update-chat-2", put("two")),
        batcher.enqueue("update-folder-1", put("three")),
    ])
    .await;

    assert!(outcomes.iter().all(Result::is_ok));
    assert_eq!(
        transport.keys(),
        vec!["update-chat-1", "update-chat-2", "update-folder-1"]
    );
}

#[tokio::test(start_paused = true)]
async fn delete_of_unsent_create_cancels_both() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();

    let create = batcher.enqueue(
        "delete-folder-f1",
        Operation::post("/api/folders", json!({ "id": "f1", "name": "Work" })),
    );
    let delete = batcher.enqueue("delete-folder-f1", Operation::delete("/api/folders?id=f1"));

    let (create, delete) = tokio::join!(create, delete);
    assert_eq!(create.unwrap(), None);
    assert_eq!(delete.unwrap(), None);

    sleep(ms(5000)).await;
    assert!(transport.calls().is_empty());
    assert_eq!(batcher.metrics().cancelled, 1);
    assert_eq!(batcher.status().await.unwrap().state, FlushState::Idle);
}

#[tokio::test(start_paused = true)]
async fn failure_is_retried_after_backoff_then_succeeds() {
    init_tracing();
    let transport = Scripted::new().fail("update-chat-1", 1);
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();
    let start = Instant::now();

    let outcome = batcher.enqueue("update-chat-1", put("a")).await;
    assert_eq!(outcome.unwrap(), Some(json!({ "title": "a" })));

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1.attempt, 1);
    assert_eq!(calls[1].1.attempt, 2);
    // quiet period plus base^1 * unit
    assert!(calls[1].0 - start >= ms(1500 + 2000));
    assert!(calls[1].0 - calls[0].0 >= ms(2000));
    assert_eq!(batcher.metrics().retried, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_reject_every_sharer() {
    let transport = Scripted::new().fail("update-chat-1", usize::MAX);
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();

    let (a, b) = tokio::join!(
        batcher.enqueue("update-chat-1", put("a")),
        batcher.enqueue("update-chat-1", put("b")),
    );

    for outcome in [a, b] {
        match outcome.unwrap_err() {
            SyncError::RetriesExhausted {
                key,
                attempts,
                reason,
            } => {
                assert_eq!(key, "update-chat-1");
                assert_eq!(attempts, 4);
                assert!(reason.contains("Internal Server Error"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    let attempts: Vec<u32> = transport.calls().iter().map(|(_, r)| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    let status = batcher.status().await.unwrap();
    assert!(status.pending.is_empty());
    assert_eq!(batcher.metrics().exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn zero_retry_budget_fails_on_first_error() {
    let transport = Scripted::new().fail("k", usize::MAX);
    let config = ConfigBuilder::new().max_retries(0).build().unwrap();
    let batcher = SyncBatcher::spawn(config, transport.clone()).unwrap();

    let err = batcher.enqueue("k", put("a")).await.unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { attempts: 1, .. }));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn throttled_mutations_wait_for_refill_and_are_never_dropped() {
    init_tracing();
    let transport = Scripted::new();
    let config = ConfigBuilder::new()
        .bucket_capacity(2)
        .refill_period(ms(2000))
        .build()
        .unwrap();
    let batcher = SyncBatcher::spawn(config, transport.clone()).unwrap();
    let start = Instant::now();

    let futures = (0..5)
        .map(|i| batcher.enqueue(format!("update-chat-{i}"), put("x")))
        .collect::<Vec<_>>();
    let outcomes = join_all(futures).await;
    assert!(outcomes.iter().all(Result::is_ok));

    let calls = transport.calls();
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[0].0, calls[1].0);
    assert!(calls[2].0 - start >= ms(2000));
    let keys: Vec<_> = calls.iter().map(|(_, r)| r.key.clone()).collect();
    let expected: Vec<_> = (0..5).map(|i| format!("update-chat-{i}")).collect();
    assert_eq!(keys, expected);
    assert!(batcher.metrics().throttled >= 1);
}

#[tokio::test(start_paused = true)]
async fn without_client_context_enqueue_is_a_no_op() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::builder(transport.clone())
        .client_context(|| false)
        .spawn()
        .unwrap();

    let outcome = batcher
        .enqueue("update-chat-1", put("a"))
        .now_or_never()
        .expect("resolved immediately");
    assert_eq!(outcome.unwrap(), None);

    sleep(ms(5000)).await;
    assert!(transport.calls().is_empty());
    assert!(batcher.status().await.unwrap().pending.is_empty());
    let metrics = batcher.metrics();
    assert_eq!(metrics.skipped_no_context, 1);
    assert_eq!(metrics.enqueued, 0);
}

#[tokio::test(start_paused = true)]
async fn offline_flushes_re_arm_without_spending_credits() {
    let transport = Scripted::new();
    let online = Flag::new(false);
    let batcher = SyncBatcher::builder(transport.clone())
        .connectivity(online.clone())
        .spawn()
        .unwrap();

    let pending = batcher.enqueue("update-chat-1", put("a"));
    sleep(ms(10_000)).await;

    assert!(transport.calls().is_empty());
    let status = batcher.status().await.unwrap();
    assert_eq!(status.pending, vec!["update-chat-1"]);
    assert_eq!(status.available_credits, 30);
    assert!(batcher.metrics().offline_pauses >= 1);

    online.set(true);
    assert_eq!(pending.await.unwrap(), Some(json!({ "title": "a" })));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn enqueue_during_drain_is_sent_by_the_running_drain() {
    let transport = Scripted::with_latency(ms(500));
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();
    let start = Instant::now();

    let first = batcher.enqueue("update-chat-1", put("a"));
    sleep(ms(1700)).await;

    let status = batcher.status().await.unwrap();
    assert_eq!(status.state, FlushState::Draining);
    assert_eq!(status.in_flight.as_deref(), Some("update-chat-1"));

    let second = batcher.enqueue("update-chat-2", put("b"));
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok() && b.is_ok());

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0 - start, ms(1500));
    // goes out as soon as the first call completes, no fresh quiet period
    let gap = calls[1].0 - calls[0].0;
    assert!(gap >= ms(500) && gap < ms(1500), "second call after {gap:?}");
    assert_eq!(batcher.status().await.unwrap().state, FlushState::Idle);
}

#[tokio::test(start_paused = true)]
async fn same_key_enqueued_while_in_flight_is_sent_again() {
    let transport = Scripted::with_latency(ms(500));
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();

    let first = batcher.enqueue("update-chat-1", put("a"));
    sleep(ms(1700)).await;
    let second = batcher.enqueue("update-chat-1", put("b"));

    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), Some(json!({ "title": "a" })));
    assert_eq!(b.unwrap(), Some(json!({ "title": "b" })));
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn reset_rejects_pending_and_refills_the_bucket() {
    let transport = Scripted::new();
    let config = ConfigBuilder::new().bucket_capacity(1).build().unwrap();
    let batcher = SyncBatcher::spawn(config, transport.clone()).unwrap();

    // spend the only credit
    batcher.enqueue("warm-up", put("w")).await.unwrap();
    assert_eq!(batcher.status().await.unwrap().available_credits, 0);

    let a = batcher.enqueue("update-chat-1", put("a"));
    let b = batcher.enqueue("update-chat-2", put("b"));
    batcher.reset().await.unwrap();

    assert!(matches!(a.await, Err(SyncError::Reset { key }) if key == "update-chat-1"));
    assert!(matches!(b.await, Err(SyncError::Reset { .. })));
    let status = batcher.status().await.unwrap();
    assert_eq!(status.state, FlushState::Idle);
    assert!(status.pending.is_empty());
    assert_eq!(status.available_credits, 1);

    // still usable afterwards
    batcher.enqueue("update-chat-3", put("c")).await.unwrap();
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn status_counts_credits_earned_while_idle() {
    let transport = Scripted::new();
    let config = ConfigBuilder::new()
        .bucket_capacity(1)
        .refill_period(ms(2000))
        .build()
        .unwrap();
    let batcher = SyncBatcher::spawn(config, transport.clone()).unwrap();

    batcher.enqueue("update-chat-1", put("a")).await.unwrap();
    assert_eq!(batcher.status().await.unwrap().available_credits, 0);

    // nothing is admitted in between, yet the credit is back
    sleep(ms(3000)).await;
    let status = batcher.status().await.unwrap();
    assert_eq!(status.state, FlushState::Idle);
    assert_eq!(status.available_credits, 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_still_flushes_the_queue() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();

    let pending = batcher.enqueue("update-chat-1", put("a"));
    drop(batcher);

    assert_eq!(pending.await.unwrap(), Some(json!({ "title": "a" })));
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn batcher_is_a_tower_service() {
    let transport = Scripted::new();
    let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport.clone()).unwrap();

    let mutation = Mutation::new("delete-chat-9", Operation::delete("/api/chats?ids=9"));
    let out = batcher.clone().oneshot(mutation).await.unwrap();
    assert_eq!(out, None);

    let calls = transport.calls();
    assert_eq!(calls[0].1.method, Method::Delete);
    assert_eq!(calls[0].1.address, "/api/chats?ids=9");
}

#[tokio::test]
async fn invalid_config_is_refused_at_spawn() {
    let config = SchedulerConfig {
        bucket_capacity: 0,
        ..SchedulerConfig::default()
    };
    let err = SyncBatcher::spawn(config, Scripted::new()).unwrap_err();
    assert!(matches!(err, SyncError::InvalidConfig(_)));
}
