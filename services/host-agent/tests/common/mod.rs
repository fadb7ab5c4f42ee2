//! Shared fixtures for host agent integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use corral_coord::{
    create_node, get_node, set_node, Connection, CoordError, MemoryConnection, RawNode, Version,
    Watch,
};
use corral_host_agent::state::paths::{host_state_path, service_path, service_state_path};
use corral_host_agent::state::{DesiredState, HostState, ServiceDefinition, ServiceState};
use corral_id::{HostId, ServiceId};

pub const WAIT: Duration = Duration::from_secs(5);

pub const IMAGE: &str = "registry.local/web:1.0";

/// Creates a service definition node.
pub async fn seed_service(conn: &MemoryConnection) -> ServiceDefinition {
    let mut svc = ServiceDefinition::new(ServiceId::new(), "web", IMAGE);
    create_node(conn, &service_path(&svc.id), &mut svc)
        .await
        .unwrap();
    svc
}

/// Creates the ServiceState and HostState nodes for a new instance, as the
/// scheduler would when assigning it to `host_id`.
pub async fn assign_instance(
    conn: &MemoryConnection,
    host_id: HostId,
    svc: &ServiceDefinition,
    desired: DesiredState,
) -> ServiceState {
    let ss = ServiceState::new(svc.id, host_id);
    assign_existing(conn, ss, desired).await
}

/// Like [`assign_instance`], for a prepared ServiceState.
pub async fn assign_existing(
    conn: &MemoryConnection,
    mut ss: ServiceState,
    desired: DesiredState,
) -> ServiceState {
    create_node(conn, &service_state_path(&ss.service_id, &ss.id), &mut ss)
        .await
        .unwrap();
    let mut hs = HostState::new(&ss).with_desired_state(desired);
    create_node(conn, &host_state_path(&ss.host_id, &ss.id), &mut hs)
        .await
        .unwrap();
    ss
}

pub async fn set_desired(conn: &MemoryConnection, ss: &ServiceState, desired: DesiredState) {
    let path = host_state_path(&ss.host_id, &ss.id);
    let mut hs: HostState = get_node(conn, &path).await.unwrap();
    hs.desired_state = desired;
    set_node(conn, &path, &mut hs).await.unwrap();
}

pub async fn read_state(conn: &MemoryConnection, ss: &ServiceState) -> Option<ServiceState> {
    get_node(conn, &service_state_path(&ss.service_id, &ss.id))
        .await
        .ok()
}

pub async fn instance_exists(conn: &MemoryConnection, ss: &ServiceState) -> bool {
    conn.exists(&host_state_path(&ss.host_id, &ss.id))
        .await
        .unwrap()
        || conn
            .exists(&service_state_path(&ss.service_id, &ss.id))
            .await
            .unwrap()
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn new_conn() -> Arc<MemoryConnection> {
    Arc::new(MemoryConnection::new())
}

/// A connection that can be told to reject writes to one path.
///
/// Everything else is passed through to the wrapped store.
pub struct FailingWrites {
    inner: Arc<MemoryConnection>,
    failing: Mutex<Option<String>>,
}

impl FailingWrites {
    pub fn new(inner: Arc<MemoryConnection>) -> Self {
        Self {
            inner,
            failing: Mutex::new(None),
        }
    }

    /// Rejects every later `set` on `path` with [`CoordError::Closed`].
    pub fn fail_writes_to(&self, path: impl Into<String>) {
        *self.failing.lock().unwrap() = Some(path.into());
    }

    pub fn heal(&self) {
        *self.failing.lock().unwrap() = None;
    }
}

#[async_trait]
impl Connection for FailingWrites {
    async fn create(&self, path: &str, data: serde_json::Value) -> corral_coord::Result<Version> {
        self.inner.create(path, data).await
    }

    async fn get(&self, path: &str) -> corral_coord::Result<RawNode> {
        self.inner.get(path).await
    }

    async fn get_w(&self, path: &str) -> corral_coord::Result<(RawNode, Watch)> {
        self.inner.get_w(path).await
    }

    async fn set(
        &self,
        path: &str,
        data: serde_json::Value,
        expected: Version,
    ) -> corral_coord::Result<Version> {
        if self.failing.lock().unwrap().as_deref() == Some(path) {
            return Err(CoordError::Closed);
        }
        self.inner.set(path, data, expected).await
    }

    async fn delete(&self, path: &str) -> corral_coord::Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> corral_coord::Result<bool> {
        self.inner.exists(path).await
    }

    async fn children(&self, path: &str) -> corral_coord::Result<Vec<String>> {
        self.inner.children(path).await
    }

    async fn children_w(&self, path: &str) -> corral_coord::Result<(Vec<String>, Watch)> {
        self.inner.children_w(path).await
    }
}
