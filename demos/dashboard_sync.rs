//! Simulated dashboard session: bursts of edits against a flaky fake API.
//!
//! Run with `RUST_LOG=sync_batch=debug` to watch coalescing, throttling and retries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sync_batch::{
    config, Chat, Collection, Folder, SyncBatcher, TracingLayer, TransportRequest,
};
use tower::{service_fn, BoxError, Layer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sync_batch=info".into()),
        )
        .init();

    // every third request fails, which exercises the retry path
    let counter = Arc::new(AtomicUsize::new(0));
    let api = service_fn(move |req: TransportRequest| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            if n % 3 == 2 {
                return Err::<Option<Value>, BoxError>("Request failed: Service Unavailable".into());
            }
            let mut body = req.payload.unwrap_or_else(|| json!({}));
            if body.is_object() {
                body["updated_at"] = json!(chrono::Utc::now());
            }
            Ok(Some(body))
        }
    });

    let mut cfg = config::from_env()?;
    cfg.quiet_period = Duration::from_millis(300);
    let batcher = SyncBatcher::spawn(cfg, TracingLayer::new().layer(api))?;

    let chats: Collection<Chat> = Collection::new(batcher.clone());
    let folders: Collection<Folder> = Collection::new(batcher.clone());
    chats.set_all((0..5).map(|i| Chat::new("demo-user", format!("Chat {i}"))).collect());

    // typing into a title: ten edits, one request
    let id = chats.items()[0].id.clone();
    let mut pending = Vec::new();
    for len in 1..=10 {
        let title: String = "Renamed!!!".chars().take(len).collect();
        pending.push(chats.update(&id, json!({ "title": title })));
    }

    // a folder created and deleted before the flush costs nothing
    let scratch = Folder::new("demo-user", "Scratch");
    let scratch_id = scratch.id.clone();
    pending.push(folders.create(scratch));
    pending.push(folders.delete(&scratch_id));

    // bulk archive
    for chat in chats.items().iter().skip(1) {
        pending.push(chats.update(&chat.id, json!({ "is_archived": true })));
    }

    for outcome in futures::future::join_all(pending).await {
        if let Err(err) = outcome {
            info!(error = %err, "mutation rolled back");
        }
    }

    info!(metrics = ?batcher.metrics(), "session done");
    println!("{}", serde_json::to_string_pretty(&batcher.metrics())?);
    Ok(())
}
