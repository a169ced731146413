//! Mutation descriptions shared by the queue, the scheduler and the transport.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request method of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// `POST` creates the resource it targets.
    pub fn is_create(self) -> bool {
        matches!(self, Method::Post)
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Method::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a mutation is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
    pub method: Method,
}

/// Desired end state of one resource: a target plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub target: Target,
    pub payload: Option<Value>,
}

impl Operation {
    pub fn new(method: Method, address: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            target: Target {
                address: address.into(),
                method,
            },
            payload,
        }
    }

    pub fn post(address: impl Into<String>, payload: Value) -> Self {
        Self::new(Method::Post, address, Some(payload))
    }

    pub fn put(address: impl Into<String>, payload: Value) -> Self {
        Self::new(Method::Put, address, Some(payload))
    }

    pub fn patch(address: impl Into<String>, payload: Value) -> Self {
        Self::new(Method::Patch, address, Some(payload))
    }

    pub fn delete(address: impl Into<String>) -> Self {
        Self::new(Method::Delete, address, None)
    }

    pub fn method(&self) -> Method {
        self.target.method
    }
}

/// A keyed operation, the request type of the scheduler's `Service` impl.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub key: String,
    pub operation: Operation,
}

impl Mutation {
    pub fn new(key: impl Into<String>, operation: Operation) -> Self {
        Self {
            key: key.into(),
            operation,
        }
    }
}

/// What the transport receives for one admitted mutation.
///
/// `key` is informational (logging, test assertions); the transport must not
/// rely on it for routing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportRequest {
    pub key: String,
    pub address: String,
    pub method: Method,
    pub payload: Option<Value>,
    /// 1 for the first attempt, incremented on every retry
    pub attempt: u32,
}

/// Key builders.
///
/// Keys must stay stable for a resource's logical lifetime so unrelated
/// operations are never coalesced: field edits and existence changes of the
/// same resource live under different keys.
pub mod keys {
    /// `update-<kind>-<id>`
    pub fn update(kind: &str, id: &str) -> String {
        format!("update-{kind}-{id}")
    }

    /// `delete-<kind>-<id>`
    pub fn delete(kind: &str, id: &str) -> String {
        format!("delete-{kind}-{id}")
    }

    /// Creation shares the existence key with deletion, so deleting a
    /// resource whose creation was never sent cancels both.
    pub fn create(kind: &str, id: &str) -> String {
        delete(kind, id)
    }

    /// `delete-<kind>s-<id1>,<id2>,...` for bulk removals
    pub fn delete_many<S: AsRef<str>>(kind: &str, ids: &[S]) -> String {
        let joined = ids.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",");
        format!("delete-{kind}s-{joined}")
    }
}
