//! Coordination store client.
//!
//! The coordination store is a hierarchical, versioned node tree shared by
//! every host in the cluster. It is the single source of truth for desired
//! and actual instance state.
//!
//! ## Model
//!
//! - Nodes are addressed by absolute `/`-separated paths and hold a JSON value.
//! - Every node carries a [`Version`]; writes must present the version they
//!   read and fail with [`CoordError::VersionConflict`] otherwise.
//! - Watched reads return a [`Watch`] that fires at most once on the next
//!   change to the node (or to its child list). Callers re-arm by reading again.
//!
//! [`MemoryConnection`] implements [`Connection`] in-process for tests and
//! single-node development.

mod error;
pub mod memory;
mod node;
pub mod path;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::sync::oneshot;

pub use error::{CoordError, Result};
pub use memory::MemoryConnection;
pub use node::{create_node, get_node, get_node_w, set_node, Node};

/// Opaque optimistic-concurrency token for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(u64);

impl Version {
    /// Version assigned to a freshly created node.
    pub const INITIAL: Self = Self(1);

    /// The version the next successful write will produce.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A node snapshot: its data plus the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNode {
    pub data: serde_json::Value,
    pub version: Version,
}

/// What happened to a watched path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The node was created.
    Created,
    /// The node's data was overwritten.
    Changed,
    /// The node (or one of its ancestors) was deleted.
    Deleted,
    /// A direct child was created or deleted.
    ChildrenChanged,
    /// The store dropped the watch without an event (connection closed).
    Disconnected,
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub path: String,
    pub kind: EventKind,
}

impl Event {
    pub fn is_deleted(&self) -> bool {
        self.kind == EventKind::Deleted
    }
}

/// Single-fire notification for one watched path.
///
/// Resolves with the first [`Event`] on the path. Dropping the watch
/// withdraws interest.
#[derive(Debug)]
pub struct Watch {
    path: String,
    rx: oneshot::Receiver<Event>,
}

impl Watch {
    /// Creates a watch and the sender the store uses to fire it.
    pub fn channel(path: impl Into<String>) -> (oneshot::Sender<Event>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                path: path.into(),
                rx,
            },
        )
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Future for Watch {
    type Output = Event;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Event> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(event)) => Poll::Ready(event),
            Poll::Ready(Err(_)) => Poll::Ready(Event {
                path: self.path.clone(),
                kind: EventKind::Disconnected,
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client contract for the coordination store.
///
/// Implementations must be safe for concurrent use by every instance
/// reconciler on a host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Creates a node, implicitly creating missing parents.
    async fn create(&self, path: &str, data: serde_json::Value) -> Result<Version>;

    /// Reads a node.
    async fn get(&self, path: &str) -> Result<RawNode>;

    /// Reads a node and arms a watch on it.
    async fn get_w(&self, path: &str) -> Result<(RawNode, Watch)>;

    /// Overwrites a node if its current version equals `expected`.
    async fn set(&self, path: &str, data: serde_json::Value, expected: Version) -> Result<Version>;

    /// Deletes a node and all of its descendants.
    async fn delete(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Lists the names of a node's direct children, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Lists children and arms a watch on the child list.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)>;
}
