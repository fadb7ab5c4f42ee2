//! In-memory coordination store.
//!
//! [`MemoryConnection`] keeps the node tree in a `BTreeMap` behind a
//! synchronous mutex that is never held across an await point.
//!
//! ## Limitations
//!
//! - Single-process only: no replication, no durability.
//! - No ephemeral nodes or sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::trace;

use crate::path;
use crate::{Connection, CoordError, Event, EventKind, RawNode, Result, Version, Watch};

#[derive(Debug)]
struct Entry {
    data: serde_json::Value,
    version: Version,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<String, Entry>,
    data_watches: HashMap<String, Vec<oneshot::Sender<Event>>>,
    child_watches: HashMap<String, Vec<oneshot::Sender<Event>>>,
    closed: bool,
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(CoordError::Closed);
        }
        Ok(())
    }

    fn fire(watches: &mut HashMap<String, Vec<oneshot::Sender<Event>>>, path: &str, kind: EventKind) {
        if let Some(senders) = watches.remove(path) {
            trace!(path, ?kind, watchers = senders.len(), "Firing watches");
            for tx in senders {
                let _ = tx.send(Event {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }

    fn arm(
        watches: &mut HashMap<String, Vec<oneshot::Sender<Event>>>,
        path: &str,
    ) -> Watch {
        let (tx, watch) = Watch::channel(path);
        let senders = watches.entry(path.to_string()).or_default();
        senders.retain(|tx| !tx.is_closed());
        senders.push(tx);
        watch
    }

    fn children(&self, parent: &str) -> Vec<String> {
        let prefix = if parent == "/" {
            "/".to_string()
        } else {
            format!("{parent}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn insert(&mut self, path: &str, data: serde_json::Value) {
        self.nodes.insert(
            path.to_string(),
            Entry {
                data,
                version: Version::INITIAL,
            },
        );
        Self::fire(&mut self.data_watches, path, EventKind::Created);
        if let Some(parent) = path::parent(path) {
            Self::fire(&mut self.child_watches, parent, EventKind::ChildrenChanged);
        }
    }
}

/// In-process [`Connection`] implementation.
#[derive(Debug, Default)]
pub struct MemoryConnection {
    tree: Mutex<Tree>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // A panic while holding the lock cannot leave the tree half-written:
        // every mutation completes before watches are fired.
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails every subsequent call with [`CoordError::Closed`] and drops all
    /// outstanding watches.
    pub fn close(&self) {
        let mut tree = self.lock();
        tree.closed = true;
        tree.data_watches.clear();
        tree.child_watches.clear();
    }

    /// Number of nodes currently stored.
    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Number of armed, not-yet-dropped watches on a node's data.
    pub fn watch_count(&self, path: &str) -> usize {
        self.lock()
            .data_watches
            .get(path)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create(&self, path: &str, data: serde_json::Value) -> Result<Version> {
        path::validate(path)?;
        let mut tree = self.lock();
        tree.check_open()?;

        if tree.exists(path) {
            return Err(CoordError::AlreadyExists(path.to_string()));
        }

        let mut missing = Vec::new();
        let mut cursor = path::parent(path);
        while let Some(parent) = cursor {
            if tree.exists(parent) {
                break;
            }
            missing.push(parent.to_string());
            cursor = path::parent(parent);
        }
        for parent in missing.iter().rev() {
            tree.insert(parent, serde_json::Value::Null);
        }

        tree.insert(path, data);
        Ok(Version::INITIAL)
    }

    async fn get(&self, path: &str) -> Result<RawNode> {
        path::validate(path)?;
        let tree = self.lock();
        tree.check_open()?;
        tree.nodes
            .get(path)
            .map(|entry| RawNode {
                data: entry.data.clone(),
                version: entry.version,
            })
            .ok_or_else(|| CoordError::NotFound(path.to_string()))
    }

    async fn get_w(&self, path: &str) -> Result<(RawNode, Watch)> {
        path::validate(path)?;
        let mut tree = self.lock();
        tree.check_open()?;
        let node = tree
            .nodes
            .get(path)
            .map(|entry| RawNode {
                data: entry.data.clone(),
                version: entry.version,
            })
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;
        let watch = Tree::arm(&mut tree.data_watches, path);
        Ok((node, watch))
    }

    async fn set(&self, path: &str, data: serde_json::Value, expected: Version) -> Result<Version> {
        path::validate(path)?;
        let mut tree = self.lock();
        tree.check_open()?;

        let entry = tree
            .nodes
            .get_mut(path)
            .ok_or_else(|| CoordError::NotFound(path.to_string()))?;

        if entry.version != expected {
            return Err(CoordError::VersionConflict {
                path: path.to_string(),
                expected,
                actual: entry.version,
            });
        }

        entry.data = data;
        entry.version = entry.version.next();
        let version = entry.version;

        Tree::fire(&mut tree.data_watches, path, EventKind::Changed);
        Ok(version)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        path::validate(path)?;
        let mut tree = self.lock();
        tree.check_open()?;

        if !tree.nodes.contains_key(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }

        // Descendants sort contiguously after `{path}/`, but not necessarily
        // right after `path` itself ("/a-b" sorts between "/a" and "/a/b").
        let prefix = format!("{path}/");
        let mut removed = vec![path.to_string()];
        removed.extend(
            tree.nodes
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone()),
        );

        for key in &removed {
            tree.nodes.remove(key);
            Tree::fire(&mut tree.data_watches, key, EventKind::Deleted);
            Tree::fire(&mut tree.child_watches, key, EventKind::Deleted);
        }
        if let Some(parent) = path::parent(path) {
            Tree::fire(&mut tree.child_watches, parent, EventKind::ChildrenChanged);
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        path::validate(path)?;
        let tree = self.lock();
        tree.check_open()?;
        Ok(tree.exists(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        path::validate(path)?;
        let tree = self.lock();
        tree.check_open()?;
        if !tree.exists(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        Ok(tree.children(path))
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)> {
        path::validate(path)?;
        let mut tree = self.lock();
        tree.check_open()?;
        if !tree.exists(path) {
            return Err(CoordError::NotFound(path.to_string()));
        }
        let children = tree.children(path);
        let watch = Tree::arm(&mut tree.child_watches, path);
        Ok((children, watch))
    }
}
