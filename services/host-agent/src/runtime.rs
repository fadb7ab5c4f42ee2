//! Container runtime interface and mock implementation.
//!
//! The runtime handler performs the actual container lifecycle actions for
//! an instance. Start and attach take a [`TerminateFn`] that the runtime
//! invokes exactly once when the bound container process ends.
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use corral_id::InstanceId;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use crate::error::RuntimeAction;
use crate::state::{ServiceDefinition, ServiceState};

/// Single-invocation callback fired when an instance's container exits.
pub type TerminateFn = Box<dyn FnOnce(InstanceId) + Send + 'static>;

/// Image pull failures.
#[derive(Debug, Error)]
pub enum PullError {
    /// The registry has no such image.
    #[error("image {0} not found")]
    NotFound(String),

    /// The pull was abandoned because the agent is shutting down.
    #[error("image pull cancelled")]
    Cancelled,

    #[error("image pull failed: {0}")]
    Failed(#[source] anyhow::Error),
}

/// Container runtime interface.
#[async_trait]
pub trait RuntimeHandler: Send + Sync {
    /// Pulls an image, returning the local image identity.
    ///
    /// `cancel` flips to `true` when the caller gives up; implementations
    /// should then return [`PullError::Cancelled`].
    async fn pull_image(
        &self,
        cancel: watch::Receiver<bool>,
        image_id: &str,
    ) -> Result<String, PullError>;

    /// Launches a new container and records its identity on `state`.
    async fn start_service(
        &self,
        service: &ServiceDefinition,
        state: &mut ServiceState,
        on_terminate: TerminateFn,
    ) -> Result<()>;

    /// Binds to the already-running container named by `state`.
    async fn attach_service(
        &self,
        service: &ServiceDefinition,
        state: &mut ServiceState,
        on_terminate: TerminateFn,
    ) -> Result<()>;

    /// Pausing an already-paused container must succeed.
    async fn pause_service(&self, service: &ServiceDefinition, state: &ServiceState) -> Result<()>;

    /// Resuming a running, unpaused container must succeed.
    async fn resume_service(&self, service: &ServiceDefinition, state: &ServiceState)
        -> Result<()>;

    /// Stops the instance's container. The termination callback, if one is
    /// bound, fires once the process has exited.
    async fn stop_service(&self, state: &ServiceState) -> Result<()>;
}

// =============================================================================
// Mock Runtime
// =============================================================================

/// A call observed by [`MockRuntime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    PullImage { image_id: String },
    Start { instance_id: InstanceId, docker_id: String },
    Attach { instance_id: InstanceId, docker_id: String },
    Pause { instance_id: InstanceId },
    Resume { instance_id: InstanceId },
    Stop { instance_id: InstanceId },
}

impl RuntimeCall {
    pub fn action(&self) -> RuntimeAction {
        match self {
            Self::PullImage { .. } => RuntimeAction::PullImage,
            Self::Start { .. } => RuntimeAction::Start,
            Self::Attach { .. } => RuntimeAction::Attach,
            Self::Pause { .. } => RuntimeAction::Pause,
            Self::Resume { .. } => RuntimeAction::Resume,
            Self::Stop { .. } => RuntimeAction::Stop,
        }
    }
}

struct MockContainer {
    docker_id: String,
    paused: bool,
    on_terminate: Option<TerminateFn>,
}

/// In-process runtime for testing and development.
///
/// Containers never run anything; they exist until stopped or until
/// [`MockRuntime::terminate`] simulates the process exiting.
pub struct MockRuntime {
    /// Counter for generating container IDs.
    container_counter: AtomicU64,

    calls: Mutex<Vec<RuntimeCall>>,
    containers: Mutex<HashMap<InstanceId, MockContainer>>,
    failing: Mutex<HashSet<RuntimeAction>>,
    missing_images: Mutex<HashSet<String>>,

    /// When set, pulls block until cancelled.
    hang_pulls: AtomicBool,

    changed: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            container_counter: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            missing_images: Mutex::new(HashSet::new()),
            hang_pulls: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Makes every subsequent call of `action` fail.
    pub fn fail(&self, action: RuntimeAction) {
        lock(&self.failing).insert(action);
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    /// Makes pulls of `image_id` report [`PullError::NotFound`].
    pub fn missing_image(&self, image_id: impl Into<String>) {
        lock(&self.missing_images).insert(image_id.into());
    }

    /// Makes pulls block until their cancel signal fires.
    pub fn hang_pulls(&self) {
        self.hang_pulls.store(true, Ordering::SeqCst);
    }

    /// Registers a container as already running, as if started by a
    /// previous agent process. Returns its container ID.
    pub fn adopt(&self, instance_id: InstanceId) -> String {
        let docker_id = self.next_docker_id();
        lock(&self.containers).insert(
            instance_id,
            MockContainer {
                docker_id: docker_id.clone(),
                paused: false,
                on_terminate: None,
            },
        );
        docker_id
    }

    /// Simulates the instance's container process exiting on its own.
    ///
    /// Returns false if no container is running for the instance.
    pub fn terminate(&self, instance_id: &InstanceId) -> bool {
        let container = lock(&self.containers).remove(instance_id);
        let Some(container) = container else {
            return false;
        };
        info!(
            instance_id = %instance_id,
            docker_id = %container.docker_id,
            "[MOCK] Container exited"
        );
        if let Some(on_terminate) = container.on_terminate {
            on_terminate(*instance_id);
        }
        self.changed.notify_waiters();
        true
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls of `action`.
    pub fn count(&self, action: RuntimeAction) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.action() == action)
            .count()
    }

    pub fn is_running(&self, instance_id: &InstanceId) -> bool {
        lock(&self.containers).contains_key(instance_id)
    }

    pub fn is_paused(&self, instance_id: &InstanceId) -> bool {
        lock(&self.containers)
            .get(instance_id)
            .is_some_and(|container| container.paused)
    }

    /// Whether a termination callback is bound for the instance.
    pub fn is_attached(&self, instance_id: &InstanceId) -> bool {
        lock(&self.containers)
            .get(instance_id)
            .is_some_and(|container| container.on_terminate.is_some())
    }

    pub fn running_count(&self) -> usize {
        lock(&self.containers).len()
    }

    /// Waits until `predicate` holds over the recorded calls, or `timeout`
    /// elapses. Returns whether the predicate was satisfied.
    pub async fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[RuntimeCall]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if predicate(&self.calls()) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return predicate(&self.calls());
            }
        }
    }

    fn next_docker_id(&self) -> String {
        let counter = self.container_counter.fetch_add(1, Ordering::SeqCst);
        format!("ctr_{:012x}", counter)
    }

    fn record(&self, call: RuntimeCall) {
        debug!(?call, "[MOCK] Runtime call");
        lock(&self.calls).push(call);
        self.changed.notify_waiters();
    }

    fn check(&self, action: RuntimeAction) -> Result<()> {
        if lock(&self.failing).contains(&action) {
            bail!("Mock runtime configured to fail {action}");
        }
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuntimeHandler for MockRuntime {
    async fn pull_image(
        &self,
        mut cancel: watch::Receiver<bool>,
        image_id: &str,
    ) -> Result<String, PullError> {
        self.record(RuntimeCall::PullImage {
            image_id: image_id.to_string(),
        });
        self.check(RuntimeAction::PullImage)
            .map_err(PullError::Failed)?;

        if lock(&self.missing_images).contains(image_id) {
            return Err(PullError::NotFound(image_id.to_string()));
        }

        if self.hang_pulls.load(Ordering::SeqCst) {
            let _ = cancel.wait_for(|cancelled| *cancelled).await;
            return Err(PullError::Cancelled);
        }

        Ok(format!("local/{image_id}"))
    }

    async fn start_service(
        &self,
        service: &ServiceDefinition,
        state: &mut ServiceState,
        on_terminate: TerminateFn,
    ) -> Result<()> {
        if let Err(err) = self.check(RuntimeAction::Start) {
            self.record(RuntimeCall::Start {
                instance_id: state.id,
                docker_id: String::new(),
            });
            return Err(err);
        }

        let docker_id = self.next_docker_id();
        info!(
            instance_id = %state.id,
            service = %service.name,
            image = %state.image_uuid,
            docker_id = %docker_id,
            "[MOCK] Starting container"
        );

        state.docker_id = docker_id.clone();
        state.started_at = Some(Utc::now());
        state.paused = false;

        lock(&self.containers).insert(
            state.id,
            MockContainer {
                docker_id: docker_id.clone(),
                paused: false,
                on_terminate: Some(on_terminate),
            },
        );
        self.record(RuntimeCall::Start {
            instance_id: state.id,
            docker_id,
        });
        Ok(())
    }

    async fn attach_service(
        &self,
        _service: &ServiceDefinition,
        state: &mut ServiceState,
        on_terminate: TerminateFn,
    ) -> Result<()> {
        self.record(RuntimeCall::Attach {
            instance_id: state.id,
            docker_id: state.docker_id.clone(),
        });
        self.check(RuntimeAction::Attach)?;

        let mut containers = lock(&self.containers);
        let container = containers
            .get_mut(&state.id)
            .filter(|container| container.docker_id == state.docker_id)
            .ok_or_else(|| anyhow!("no container {} to attach to", state.docker_id))?;
        container.on_terminate = Some(on_terminate);
        state.paused = container.paused;
        Ok(())
    }

    async fn pause_service(&self, _service: &ServiceDefinition, state: &ServiceState) -> Result<()> {
        self.record(RuntimeCall::Pause {
            instance_id: state.id,
        });
        self.check(RuntimeAction::Pause)?;

        let mut containers = lock(&self.containers);
        let container = containers
            .get_mut(&state.id)
            .ok_or_else(|| anyhow!("instance {} is not running", state.id))?;
        container.paused = true;
        Ok(())
    }

    async fn resume_service(
        &self,
        _service: &ServiceDefinition,
        state: &ServiceState,
    ) -> Result<()> {
        self.record(RuntimeCall::Resume {
            instance_id: state.id,
        });
        self.check(RuntimeAction::Resume)?;

        let mut containers = lock(&self.containers);
        let container = containers
            .get_mut(&state.id)
            .ok_or_else(|| anyhow!("instance {} is not running", state.id))?;
        container.paused = false;
        Ok(())
    }

    async fn stop_service(&self, state: &ServiceState) -> Result<()> {
        self.record(RuntimeCall::Stop {
            instance_id: state.id,
        });
        self.check(RuntimeAction::Stop)?;

        info!(instance_id = %state.id, "[MOCK] Stopping container");
        // Stopping an instance with no container is a successful no-op.
        self.terminate(&state.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_id::{HostId, ServiceId};
    use std::sync::Arc;

    fn service() -> ServiceDefinition {
        ServiceDefinition::new(ServiceId::new(), "web", "registry.local/web:1")
    }

    fn state(service: &ServiceDefinition) -> ServiceState {
        ServiceState::new(service.id, HostId::new())
    }

    fn noop() -> TerminateFn {
        Box::new(|_| {})
    }

    #[tokio::test]
    async fn test_mock_start_sets_container() {
        let runtime = MockRuntime::new();
        let svc = service();
        let mut ss = state(&svc);

        runtime.start_service(&svc, &mut ss, noop()).await.unwrap();
        assert!(ss.docker_id.starts_with("ctr_"));
        assert!(ss.started_at.is_some());
        assert!(runtime.is_running(&ss.id));
    }

    #[tokio::test]
    async fn test_mock_stop_fires_callback_once() {
        let runtime = MockRuntime::new();
        let svc = service();
        let mut ss = state(&svc);
        let fired = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&fired);
        runtime
            .start_service(
                &svc,
                &mut ss,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        runtime.stop_service(&ss).await.unwrap();
        runtime.stop_service(&ss).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!runtime.is_running(&ss.id));
    }

    #[tokio::test]
    async fn test_mock_pause_is_idempotent() {
        let runtime = MockRuntime::new();
        let svc = service();
        let mut ss = state(&svc);
        runtime.start_service(&svc, &mut ss, noop()).await.unwrap();

        runtime.pause_service(&svc, &ss).await.unwrap();
        runtime.pause_service(&svc, &ss).await.unwrap();
        assert!(runtime.is_paused(&ss.id));

        runtime.resume_service(&svc, &ss).await.unwrap();
        assert!(!runtime.is_paused(&ss.id));
    }

    #[tokio::test]
    async fn test_mock_attach_requires_matching_container() {
        let runtime = MockRuntime::new();
        let svc = service();
        let mut ss = state(&svc);
        ss.docker_id = "ctr_missing".to_string();
        assert!(runtime.attach_service(&svc, &mut ss, noop()).await.is_err());

        ss.docker_id = runtime.adopt(ss.id);
        runtime.attach_service(&svc, &mut ss, noop()).await.unwrap();
        assert!(runtime.is_attached(&ss.id));
    }

    #[tokio::test]
    async fn test_mock_failing_start() {
        let runtime = MockRuntime::new();
        runtime.fail(RuntimeAction::Start);
        let svc = service();
        let mut ss = state(&svc);

        assert!(runtime.start_service(&svc, &mut ss, noop()).await.is_err());
        assert!(ss.docker_id.is_empty());
        assert_eq!(runtime.count(RuntimeAction::Start), 1);
    }

    #[tokio::test]
    async fn test_mock_pull_cancelled() {
        let runtime = MockRuntime::new();
        runtime.hang_pulls();
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let pull = runtime.pull_image(cancel_rx, "img");
        cancel_tx.send(true).unwrap();
        assert!(matches!(pull.await, Err(PullError::Cancelled)));
    }

    #[tokio::test]
    async fn test_mock_missing_image() {
        let runtime = MockRuntime::new();
        runtime.missing_image("img");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        assert!(matches!(
            runtime.pull_image(cancel_rx, "img").await,
            Err(PullError::NotFound(_))
        ));
    }
}
