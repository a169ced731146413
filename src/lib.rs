//! # sync-batch
//!
//! Client-side write coalescing for optimistic UIs.
//!
//! Every user edit is applied to local state immediately and handed to a
//! [`SyncBatcher`], which holds it for a short quiet period, merges repeated
//! edits of the same resource into one request, throttles outgoing requests
//! with a token bucket, and retries failures with exponential backoff. Each
//! caller gets back a future that resolves with the shared outcome, so the
//! caller can reconcile with the server or roll back.
//!
//! ## Core Concepts
//!
//! - **Key**: identity under which mutations are deduplicated (`update-chat-42`)
//! - **Transport**: any Tower service from [`TransportRequest`] to an optional JSON body
//! - **Waiter**: every caller whose mutation was folded into a queued entry
//! - **Collection**: an optimistic list of resources that snapshots, applies,
//!   enqueues, and rolls back on failure
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use serde_json::{json, Value};
//! use sync_batch::{Chat, Collection, SchedulerConfig, SyncBatcher, TransportRequest};
//! use tower::{service_fn, BoxError};
//!
//! # async fn example() -> sync_batch::Result<()> {
//! let transport = service_fn(|req: TransportRequest| async move {
//!     // issue the HTTP call here
//!     Ok::<Option<Value>, BoxError>(req.payload)
//! });
//! let batcher = SyncBatcher::spawn(SchedulerConfig::default(), transport)?;
//!
//! let chats: Collection<Chat> = Collection::new(batcher);
//! chats.set_all(vec![Chat::new("user-1", "Draft")]);
//! let id = chats.items()[0].id.clone();
//!
//! // visible right away; the future settles after the flush
//! let settle = chats.update(&id, json!({ "title": "Final" }));
//! settle.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod limiter;
pub mod mutation;
pub mod observability;
pub mod optimistic;
pub mod probe;
pub mod queue;
pub mod resources;
pub mod retry;
pub mod scheduler;

pub use config::{ConfigBuilder, RetryConfig, SchedulerConfig};
pub use error::{Result, SyncError};
pub use limiter::TokenBucket;
pub use mutation::{keys, Method, Mutation, Operation, Target, TransportRequest};
pub use observability::{MetricsSnapshot, SchedulerMetrics, TracingLayer};
pub use optimistic::{Collection, Resource, Settle};
pub use probe::{Always, Flag, Probe};
pub use resources::{Chat, Folder, Prompt};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{FlushState, MutationFuture, QueueStatus, SyncBatcher, SyncBatcherBuilder};
