//! Optimistic collections
//!
//! What this module provides
//! - `Collection<T>`: a shared list of resources plus a selection set, whose
//!   mutations apply locally first and reach the server through a `SyncBatcher`
//! - `Resource`: what a type needs to live in a collection (kind, endpoint, id)
//!
//! Contract of every mutating operation
//! - Snapshot the affected state, apply the change, and enqueue, all before
//!   the call returns; readers see the optimistic value immediately
//! - The returned future settles the change: on success any JSON object the
//!   server answered with is merged into the item; on failure the snapshot is
//!   restored exactly and the error is returned
//!
//! Implementation strategy
//! - State sits behind a `std::sync::Mutex` that is never held across an await
//! - Patches are shallow JSON merges: the item is serialized, the patch keys
//!   overwrite its fields, and the result is deserialized back
//!
//! Testing strategy
//! - Paused-clock tokio tests against scripted transports; rollback tests use a
//!   zero retry budget so rejection is immediate after the quiet period

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{self, BoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::mutation::{keys, Operation};
use crate::scheduler::{MutationFuture, SyncBatcher};

/// A server-backed record addressable by id.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Singular name used in mutation keys, e.g. `chat`
    const KIND: &'static str;
    /// Collection endpoint, e.g. `/api/chats`
    const ENDPOINT: &'static str;
    /// Query parameter naming the id on single deletes
    const DELETE_PARAM: &'static str = "id";

    fn id(&self) -> &str;
}

/// Future settling one optimistic change.
pub type Settle = BoxFuture<'static, Result<()>>;

#[derive(Debug)]
struct State<T> {
    items: Vec<T>,
    selected: HashSet<String>,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            selected: HashSet::new(),
        }
    }
}

/// Pre-mutation copy of whatever the mutation touched.
struct Snapshot<T> {
    items: Vec<T>,
    selected: Option<HashSet<String>>,
}

/// Shared, optimistically updated list of `T`.
pub struct Collection<T> {
    state: Arc<Mutex<State<T>>>,
    batcher: SyncBatcher,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            batcher: self.batcher.clone(),
        }
    }
}

impl<T: Resource> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("Collection")
            .field("kind", &T::KIND)
            .field("items", &state.items.len())
            .field("selected", &state.selected.len())
            .finish()
    }
}

fn lock<T>(state: &Mutex<State<T>>) -> MutexGuard<'_, State<T>> {
    // no writer leaves the state half-updated, so a poisoned guard is still usable
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn restore<T>(state: &Mutex<State<T>>, snapshot: Snapshot<T>) {
    let mut state = lock(state);
    state.items = snapshot.items;
    if let Some(selected) = snapshot.selected {
        state.selected = selected;
    }
}

fn as_object(patch: Value) -> Result<Map<String, Value>> {
    match patch {
        Value::Object(map) => Ok(map),
        other => Err(<serde_json::Error as serde::de::Error>::custom(format!(
            "patch must be a JSON object, got {other}"
        ))
        .into()),
    }
}

/// Shallow merge of `fields` over `item`.
fn merged<T: Resource>(item: &T, fields: &Map<String, Value>) -> Result<T> {
    let mut value = serde_json::to_value(item)?;
    if let Value::Object(obj) = &mut value {
        for (k, v) in fields {
            obj.insert(k.clone(), v.clone());
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Fold an authoritative server body into the item with `id`, if both exist.
fn reconcile<T: Resource>(state: &Mutex<State<T>>, id: &str, body: Option<Value>) {
    let Some(Value::Object(fields)) = body else {
        return;
    };
    let mut state = lock(state);
    let Some(item) = state.items.iter_mut().find(|i| i.id() == id) else {
        return;
    };
    match merged(item, &fields) {
        Ok(updated) => *item = updated,
        Err(err) => warn!(kind = T::KIND, id, error = %err, "server body not applied"),
    }
}

impl<T: Resource> Collection<T> {
    pub fn new(batcher: SyncBatcher) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            batcher,
        }
    }

    /// Replace every item; the selection is left as is.
    pub fn set_all(&self, items: Vec<T>) {
        lock(&self.state).items = items;
    }

    /// Prepend an item locally without telling the server.
    pub fn insert(&self, item: T) {
        lock(&self.state).items.insert(0, item);
    }

    pub fn items(&self) -> Vec<T> {
        lock(&self.state).items.clone()
    }

    pub fn get(&self, id: &str) -> Option<T> {
        lock(&self.state).items.iter().find(|i| i.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).items.is_empty()
    }

    /// Merge `patch` into the item with `id` and `PUT` it as `{id, ...patch}`.
    ///
    /// `patch` must be a JSON object. An `id` not in the collection fails with
    /// `SyncError::NotFound` and nothing is sent.
    pub fn update(&self, id: &str, patch: Value) -> Settle {
        let fields = match as_object(patch) {
            Ok(fields) => fields,
            Err(err) => return Box::pin(future::ready(Err(err))),
        };

        let snapshot = {
            let mut state = lock(&self.state);
            let snapshot = Snapshot {
                items: state.items.clone(),
                selected: None,
            };
            let Some(item) = state.items.iter_mut().find(|i| i.id() == id) else {
                return Box::pin(future::ready(Err(SyncError::NotFound {
                    kind: T::KIND,
                    id: id.to_owned(),
                })));
            };
            match merged(item, &fields) {
                Ok(updated) => *item = updated,
                Err(err) => return Box::pin(future::ready(Err(err))),
            }
            snapshot
        };

        let mut body = Map::with_capacity(fields.len() + 1);
        body.insert("id".to_owned(), Value::String(id.to_owned()));
        body.extend(fields);

        let pending = self.batcher.enqueue(
            keys::update(T::KIND, id),
            Operation::put(T::ENDPOINT, Value::Object(body)),
        );
        let state = self.state.clone();
        let id = id.to_owned();
        Box::pin(async move {
            match pending.await {
                Ok(body) => {
                    reconcile(&state, &id, body);
                    Ok(())
                }
                Err(err) => {
                    warn!(kind = T::KIND, id = %id, error = %err, "update failed, rolling back");
                    restore(&state, snapshot);
                    Err(err)
                }
            }
        })
    }

    /// Prepend `item` and `POST` it.
    pub fn create(&self, item: T) -> Settle {
        let payload = match serde_json::to_value(&item) {
            Ok(payload) => payload,
            Err(err) => return Box::pin(future::ready(Err(err.into()))),
        };
        let id = item.id().to_owned();

        let snapshot = {
            let mut state = lock(&self.state);
            let snapshot = Snapshot {
                items: state.items.clone(),
                selected: None,
            };
            state.items.insert(0, item);
            snapshot
        };

        let pending = self.batcher.enqueue(
            keys::create(T::KIND, &id),
            Operation::post(T::ENDPOINT, payload),
        );
        let state = self.state.clone();
        Box::pin(async move {
            match pending.await {
                Ok(body) => {
                    reconcile(&state, &id, body);
                    Ok(())
                }
                Err(err) => {
                    warn!(kind = T::KIND, id = %id, error = %err, "create failed, rolling back");
                    restore(&state, snapshot);
                    Err(err)
                }
            }
        })
    }

    /// Remove the item and its selection, then `DELETE` it.
    pub fn delete(&self, id: &str) -> Settle {
        let snapshot = {
            let mut state = lock(&self.state);
            let snapshot = Snapshot {
                items: state.items.clone(),
                selected: Some(state.selected.clone()),
            };
            state.items.retain(|i| i.id() != id);
            state.selected.remove(id);
            snapshot
        };

        let address = format!("{}?{}={}", T::ENDPOINT, T::DELETE_PARAM, id);
        let pending = self
            .batcher
            .enqueue(keys::delete(T::KIND, id), Operation::delete(address));
        self.settle_removal(pending, snapshot, id.to_owned())
    }

    /// Remove several items with one bulk `DELETE`. Empty `ids` does nothing.
    pub fn delete_many<S: AsRef<str>>(&self, ids: &[S]) -> Settle {
        if ids.is_empty() {
            return Box::pin(future::ready(Ok(())));
        }
        let doomed: HashSet<&str> = ids.iter().map(AsRef::as_ref).collect();

        let snapshot = {
            let mut state = lock(&self.state);
            let snapshot = Snapshot {
                items: state.items.clone(),
                selected: Some(state.selected.clone()),
            };
            state.items.retain(|i| !doomed.contains(i.id()));
            state.selected.retain(|id| !doomed.contains(id.as_str()));
            snapshot
        };

        let joined = ids.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        let address = format!("{}?ids={}", T::ENDPOINT, joined);
        let pending = self
            .batcher
            .enqueue(keys::delete_many(T::KIND, ids), Operation::delete(address));
        self.settle_removal(pending, snapshot, joined)
    }

    fn settle_removal(
        &self,
        pending: MutationFuture,
        snapshot: Snapshot<T>,
        ids: String,
    ) -> Settle {
        let state = self.state.clone();
        Box::pin(async move {
            match pending.await {
                Ok(_) => {
                    debug!(kind = T::KIND, ids = %ids, "removal confirmed");
                    Ok(())
                }
                Err(err) => {
                    warn!(kind = T::KIND, ids = %ids, error = %err, "delete failed, rolling back");
                    restore(&state, snapshot);
                    Err(err)
                }
            }
        })
    }

    pub fn toggle_selection(&self, id: &str) {
        let mut state = lock(&self.state);
        if !state.selected.remove(id) {
            state.selected.insert(id.to_owned());
        }
    }

    pub fn select_all(&self) {
        let mut state = lock(&self.state);
        state.selected = state.items.iter().map(|i| i.id().to_owned()).collect();
    }

    pub fn deselect_all(&self) {
        lock(&self.state).selected.clear();
    }

    pub fn selected(&self) -> HashSet<String> {
        lock(&self.state).selected.clone()
    }

    pub fn is_selected(&self, id: &str) -> bool {
        lock(&self.state).selected.contains(id)
    }
}
