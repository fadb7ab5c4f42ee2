//! Host agent - one reconciler task per instance assigned to this host.
//!
//! The agent watches the host's instance directory in the coordination
//! store. Every child node is an instance assigned here; each gets its own
//! [`InstanceReconciler`] task. When a reconciler exits with an error and
//! its node is still listed, the agent respawns it with backoff until the
//! retry budget for that instance runs out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use corral_coord::{Connection, CoordError, Watch};
use corral_id::{HostId, InstanceId};
use corral_reconcile::{RespawnBackoff, RespawnBudget, DEFAULT_RESPAWN_LIMIT, DEFAULT_RESPAWN_WINDOW};
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::reconciler::{shutdown_signalled, InstanceReconciler, ReconcilerConfig};
use crate::registry::InstanceRegistry;
use crate::runtime::RuntimeHandler;
use crate::state::paths::host_instances_path;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Re-list the instance directory at least this often, even without a
    /// watch event.
    pub resync_interval: Duration,

    /// Respawns allowed per instance inside `respawn_window`.
    pub respawn_max_retries: u32,

    pub respawn_window: Duration,

    /// Delay between respawns of a failing instance.
    pub backoff: RespawnBackoff,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            respawn_max_retries: DEFAULT_RESPAWN_LIMIT,
            respawn_window: DEFAULT_RESPAWN_WINDOW,
            backoff: RespawnBackoff::default(),
        }
    }
}

type TaskOutcome = (InstanceId, Result<(), ReconcileError>);

/// Supervises the instance reconcilers of one host.
pub struct HostAgent {
    conn: Arc<dyn Connection>,
    reconciler: Arc<InstanceReconciler>,
    config: AgentConfig,
}

impl HostAgent {
    pub fn new(
        conn: Arc<dyn Connection>,
        handler: Arc<dyn RuntimeHandler>,
        host_id: HostId,
        reconciler_config: ReconcilerConfig,
        config: AgentConfig,
    ) -> Self {
        let reconciler = InstanceReconciler::new(
            Arc::clone(&conn),
            handler,
            host_id,
            InstanceRegistry::new(),
            reconciler_config,
        );
        Self {
            conn,
            reconciler: Arc::new(reconciler),
            config,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.reconciler.host_id()
    }

    /// Instances currently owned by a live reconciler.
    pub fn registry(&self) -> &InstanceRegistry {
        self.reconciler.registry()
    }

    /// Runs until shutdown, then waits for every reconciler to clean up.
    ///
    /// Returns an error only when the instance directory can no longer be
    /// listed (for example, the store connection closed).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        let root = host_instances_path(&self.host_id());
        info!(
            host_id = %self.host_id(),
            path = %root,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting host agent"
        );

        let mut supervisor = Supervisor::new(&self.config);
        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            let (children, children_watch) = match self.list_instances(&root).await {
                Ok(listed) => listed,
                Err(err) => break Err(err),
            };
            supervisor.sync(&children);
            for instance_id in supervisor.pending(&children, self.registry()) {
                self.spawn_reconciler(&mut supervisor, &shutdown, instance_id);
            }

            tokio::select! {
                event = children_watch => {
                    debug!(path = %event.path, kind = ?event.kind, "Instance directory changed");
                }
                Some(joined) = supervisor.tasks.join_next_with_id(), if !supervisor.tasks.is_empty() => {
                    supervisor.reap(joined);
                }
                _ = resync.tick() => {
                    supervisor.retries.prune();
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    info!(host_id = %self.host_id(), "Host agent shutting down");
                }
            }
        };

        if let Err(err) = &result {
            error!(host_id = %self.host_id(), error = %err, "Host agent stopped watching instances");
        }

        let running = supervisor.tasks.len();
        if running > 0 {
            info!(count = running, "Waiting for instance reconcilers to exit");
        }
        while let Some(joined) = supervisor.tasks.join_next_with_id().await {
            supervisor.reap(joined);
        }

        info!(host_id = %self.host_id(), "Host agent stopped");
        result
    }

    async fn list_instances(
        &self,
        root: &str,
    ) -> Result<(Vec<String>, Watch), ReconcileError> {
        match self.conn.children_w(root).await {
            Ok(listed) => Ok(listed),
            Err(err) if err.is_not_found() => {
                match self.conn.create(root, serde_json::Value::Null).await {
                    Ok(_) => debug!(path = %root, "Created instance directory"),
                    Err(CoordError::AlreadyExists(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                Ok(self.conn.children_w(root).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn spawn_reconciler(
        &self,
        supervisor: &mut Supervisor,
        shutdown: &watch::Receiver<bool>,
        instance_id: InstanceId,
    ) {
        let attempts = supervisor.retries.attempts(&instance_id);
        let delay = match attempts {
            0 => Duration::ZERO,
            n => self.config.backoff.delay(n - 1),
        };

        if attempts > 0 {
            info!(
                instance_id = %instance_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "Respawning instance reconciler"
            );
        } else {
            debug!(instance_id = %instance_id, "Spawning instance reconciler");
        }

        let reconciler = Arc::clone(&self.reconciler);
        let mut shutdown = shutdown.clone();
        let handle = supervisor.tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_signalled(&mut shutdown) => return (instance_id, Ok(())),
                }
            }
            let result = reconciler.spawn(shutdown, instance_id).await;
            (instance_id, result)
        });
        supervisor.active.insert(handle.id(), instance_id);
    }
}

/// Bookkeeping for the reconciler tasks owned by [`HostAgent::run`].
struct Supervisor {
    tasks: JoinSet<TaskOutcome>,
    active: HashMap<task::Id, InstanceId>,
    /// Instances whose retry budget ran out; skipped until they leave the
    /// listing.
    abandoned: HashSet<InstanceId>,
    retries: RespawnBudget<InstanceId>,
}

impl Supervisor {
    fn new(config: &AgentConfig) -> Self {
        Self {
            tasks: JoinSet::new(),
            active: HashMap::new(),
            abandoned: HashSet::new(),
            retries: RespawnBudget::new(config.respawn_max_retries, config.respawn_window),
        }
    }

    /// Forgets abandoned instances that are no longer listed.
    fn sync(&mut self, children: &[String]) {
        let listed: HashSet<&str> = children.iter().map(String::as_str).collect();
        self.abandoned.retain(|id| {
            let keep = listed.contains(id.path_segment().as_str());
            if !keep {
                self.retries.clear(id);
            }
            keep
        });
    }

    /// Listed instances that need a reconciler.
    fn pending(&self, children: &[String], registry: &InstanceRegistry) -> Vec<InstanceId> {
        let running: HashSet<InstanceId> = self.active.values().copied().collect();

        children
            .iter()
            .filter_map(|name| match InstanceId::parse(name) {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(name = %name, error = %err, "Ignoring malformed instance node");
                    None
                }
            })
            .filter(|id| {
                !running.contains(id) && !self.abandoned.contains(id) && !registry.contains(id)
            })
            .collect()
    }

    fn reap(&mut self, joined: Result<(task::Id, TaskOutcome), JoinError>) {
        let (instance_id, result) = match joined {
            Ok((task_id, outcome)) => {
                self.active.remove(&task_id);
                outcome
            }
            Err(err) => {
                let Some(instance_id) = self.active.remove(&err.id()) else {
                    error!(error = %err, "Unknown reconciler task failed");
                    return;
                };
                error!(instance_id = %instance_id, error = %err, "Instance reconciler task failed");
                self.record_failure(instance_id);
                return;
            }
        };

        match result {
            Ok(()) => {
                debug!(instance_id = %instance_id, "Instance reconciler finished");
                self.retries.clear(&instance_id);
            }
            Err(ReconcileError::AlreadyRegistered(_)) => {
                debug!(instance_id = %instance_id, "Instance already has a reconciler");
            }
            Err(err) => {
                warn!(instance_id = %instance_id, error = %err, "Instance reconciler exited with error");
                self.record_failure(instance_id);
            }
        }
    }

    fn record_failure(&mut self, instance_id: InstanceId) {
        if self.retries.record_failure(&instance_id) {
            error!(
                instance_id = %instance_id,
                attempts = self.retries.attempts(&instance_id),
                "Giving up on instance"
            );
            self.abandoned.insert(instance_id);
        }
    }
}
