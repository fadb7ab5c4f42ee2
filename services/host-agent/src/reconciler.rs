//! Instance reconciler - keeps one service instance converged.
//!
//! One reconciler runs per instance assigned to this host. Each pass reads
//! the instance's HostState (intent) and ServiceState (actual) with watches
//! armed, reads the ServiceDefinition, issues at most one runtime action and
//! then waits for whichever comes first:
//!
//! - the bound container exiting,
//! - a change to either watched node,
//! - the shutdown signal.
//!
//! ## State Machine
//!
//! ```text
//!            desired=run            container exits
//! stopped ----------------> starting ------+
//!    ^                         |           |
//!    |                         v           v
//!    |   desired=pause   running-attached  (desired still run: restart)
//!    |   +------------------   |   ^
//!    |   v                     |   | desired=run (resume)
//!    | running-paused ---------+---+
//!    |
//!    +---- terminating <---- desired=stop | node deleted | shutdown
//! ```
//!
//! desired=pause with no running container is a no-op: nothing is paused
//! and the instance stays stopped until desired=run.
//!
//! Every exit runs the same cleanup: stop the container (waiting for its
//! termination callback), delete the instance's nodes and deregister.
//!
//! If writing back the result of a start or attach failed, the store can say
//! "not running" while this reconciler still holds the live container. The
//! next pass notices (the operation slot is still busy) and records the
//! container again instead of starting a second one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use corral_coord::{get_node, get_node_w, Connection, Event};
use corral_id::{HostId, InstanceId};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ReconcileError, RuntimeAction};
use crate::operation::{InFlight, OperationSlot, ProcessDone};
use crate::registry::{InstanceRegistry, RegistryEntry};
use crate::runtime::{PullError, RuntimeHandler, TerminateFn};
use crate::state::paths::{host_state_path, service_path, service_state_path};
use crate::state::{
    remove_instance, update_instance, DesiredState, HostState, ServiceDefinition, ServiceState,
};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on a single image pull.
    pub pull_timeout: Duration,

    /// Attempts for a ServiceState read-modify-write that hits version conflicts.
    pub update_retries: u32,

    /// When set, a missing image is logged and the instance waits for the
    /// next state change instead of aborting the reconciler.
    pub soft_fail_missing_images: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            pull_timeout: Duration::from_secs(600),
            update_retries: 3,
            soft_fail_missing_images: false,
        }
    }
}

/// Why a pass stopped waiting.
#[derive(Debug)]
enum Wake {
    ProcessExited,
    NodeEvent(Event),
    Shutdown,
}

/// Runs instance reconcilers for one host.
pub struct InstanceReconciler {
    conn: Arc<dyn Connection>,
    handler: Arc<dyn RuntimeHandler>,
    host_id: HostId,
    registry: InstanceRegistry,
    config: ReconcilerConfig,
}

impl InstanceReconciler {
    pub fn new(
        conn: Arc<dyn Connection>,
        handler: Arc<dyn RuntimeHandler>,
        host_id: HostId,
        registry: InstanceRegistry,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            conn,
            handler,
            host_id,
            registry,
            config,
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Reconciles one instance until it is stopped, deleted or shut down.
    ///
    /// Blocks the calling task for the instance's whole lifetime; callers
    /// spawn one task per instance. Returns `Ok` for every orderly exit and
    /// the first store or runtime error otherwise. Cleanup has run in both
    /// cases, except when another reconciler already owns the instance.
    pub async fn spawn(
        &self,
        shutdown: watch::Receiver<bool>,
        instance_id: InstanceId,
    ) -> Result<(), ReconcileError> {
        let hs_path = host_state_path(&self.host_id, &instance_id);

        let hs: HostState = match get_node(&*self.conn, &hs_path).await {
            Ok(hs) => hs,
            Err(err) => {
                error!(
                    instance_id = %instance_id,
                    host_id = %self.host_id,
                    error = %err,
                    "Could not load host instance"
                );
                if let Err(del) = self.conn.delete(&hs_path).await {
                    if !del.is_not_found() {
                        warn!(instance_id = %instance_id, error = %del, "Could not delete stray host instance");
                    }
                }
                return Err(err.into());
            }
        };

        let mut registration = self.registry.register(RegistryEntry::new(
            self.host_id,
            hs.service_id,
            instance_id,
        ))?;

        let slot = OperationSlot::new();
        let ss_path = service_state_path(&hs.service_id, &instance_id);
        let result = match get_node::<_, ServiceState>(&*self.conn, &ss_path).await {
            Ok(mut ss) => {
                let result = self.watch_loop(shutdown, &slot, &mut ss).await;
                if let Err(err) = &result {
                    error!(instance_id = %instance_id, error = %err, "Instance reconciler aborted");
                }
                self.stop_instance(&slot, &ss).await;
                result
            }
            Err(err) => {
                error!(
                    instance_id = %instance_id,
                    service_id = %hs.service_id,
                    host_id = %self.host_id,
                    error = %err,
                    "Could not load service instance"
                );
                Err(err.into())
            }
        };

        if let Err(err) =
            remove_instance(&*self.conn, &self.host_id, &hs.service_id, &instance_id).await
        {
            warn!(instance_id = %instance_id, error = %err, "Could not remove instance nodes");
        }
        registration.release();

        info!(instance_id = %instance_id, "Instance reconciler exited");
        result
    }

    async fn watch_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
        slot: &OperationSlot,
        ss: &mut ServiceState,
    ) -> Result<(), ReconcileError> {
        let instance_id = ss.id;
        let hs_path = host_state_path(&self.host_id, &instance_id);
        let mut process_done: Option<ProcessDone> = None;
        // Last known runtime fields of the container bound to `process_done`.
        let mut bound: Option<ServiceState> = None;

        loop {
            let (hs, hs_watch) = match get_node_w::<_, HostState>(&*self.conn, &hs_path).await {
                Ok(found) => found,
                Err(err) if err.is_not_found() => {
                    info!(instance_id = %instance_id, "Host instance removed");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            let ss_path = service_state_path(&hs.service_id, &instance_id);
            let (fresh, ss_watch) = match get_node_w::<_, ServiceState>(&*self.conn, &ss_path).await {
                Ok(found) => found,
                Err(err) if err.is_not_found() => {
                    info!(instance_id = %instance_id, "Service instance removed");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            *ss = fresh;

            let svc: ServiceDefinition = get_node(&*self.conn, &service_path(&hs.service_id)).await?;

            debug!(
                instance_id = %instance_id,
                service = %svc.name,
                service_id = %svc.id,
                desired_state = %hs.desired_state,
                status = ?ss.status(),
                "Processing instance"
            );

            if slot.is_busy() && !ss.is_running() {
                if let Some(view) = bound.as_ref().filter(|view| !ss.exited_since(view.started_at)) {
                    warn!(
                        instance_id = %instance_id,
                        docker_id = %view.docker_id,
                        "Stored state is missing the bound container, recording it again"
                    );
                    ss.copy_runtime_fields(view);
                    self.persist(ss).await;
                }
            }

            match hs.desired_state {
                DesiredState::Run => {
                    if !ss.is_running() {
                        info!(instance_id = %instance_id, service = %svc.name, "Starting a new instance");
                        process_done = self.start_instance(&shutdown, slot, &svc, ss).await?;
                    } else if process_done.is_none() {
                        info!(
                            instance_id = %instance_id,
                            service = %svc.name,
                            docker_id = %ss.docker_id,
                            "Attaching to instance"
                        );
                        process_done = self.attach_instance(&shutdown, slot, &svc, ss).await?;
                    }
                    if ss.is_running() && ss.is_paused() {
                        info!(instance_id = %instance_id, service = %svc.name, "Resuming paused instance");
                        self.resume_instance(&svc, ss).await?;
                    }
                }
                DesiredState::Pause => {
                    if ss.is_paused() {
                        debug!(instance_id = %instance_id, "Already paused");
                    } else if ss.is_running() {
                        self.pause_instance(&svc, ss).await?;
                    } else {
                        debug!(instance_id = %instance_id, "No running container to pause");
                    }
                }
                DesiredState::Stop => {
                    info!(instance_id = %instance_id, service = %svc.name, "Stop requested");
                    return Ok(());
                }
                DesiredState::Unrecognized(value) => {
                    warn!(
                        instance_id = %instance_id,
                        service = %svc.name,
                        desired_state = value,
                        "Unhandled desired state, waiting for the next change"
                    );
                }
            }

            if slot.is_busy() && ss.is_running() {
                bound = Some(ss.clone());
            }

            let wake = tokio::select! {
                _ = process_exited(&mut process_done) => Wake::ProcessExited,
                event = hs_watch => Wake::NodeEvent(event),
                event = ss_watch => Wake::NodeEvent(event),
                _ = shutdown_signalled(&mut shutdown) => Wake::Shutdown,
            };

            match wake {
                Wake::ProcessExited => {
                    info!(instance_id = %instance_id, service = %svc.name, "Process ended for instance");
                    process_done = None;
                    bound = None;
                }
                Wake::NodeEvent(event) => {
                    debug!(instance_id = %instance_id, path = %event.path, kind = ?event.kind, "Received node event");
                    if event.is_deleted() {
                        info!(instance_id = %instance_id, path = %event.path, "Instance node deleted");
                        return Ok(());
                    }
                }
                Wake::Shutdown => {
                    info!(instance_id = %instance_id, "Received signal to shutdown");
                    return Ok(());
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Runtime actions
    // -------------------------------------------------------------------------

    /// Pulls the image and launches a container.
    ///
    /// Returns `None` when no container was started: the image is missing
    /// and missing images soft-fail, or shutdown cancelled the pull.
    async fn start_instance(
        &self,
        shutdown: &watch::Receiver<bool>,
        slot: &OperationSlot,
        svc: &ServiceDefinition,
        ss: &mut ServiceState,
    ) -> Result<Option<ProcessDone>, ReconcileError> {
        let instance_id = ss.id;

        let image_uuid = match self.pull_image(shutdown, svc).await {
            Ok(uuid) => uuid,
            Err(ReconcileError::ImagePull(PullError::NotFound(image)))
                if self.config.soft_fail_missing_images =>
            {
                warn!(
                    instance_id = %instance_id,
                    service = %svc.name,
                    image = %image,
                    "Image not found, not starting instance"
                );
                return Ok(None);
            }
            Err(ReconcileError::ImagePull(PullError::Cancelled)) if *shutdown.borrow() => {
                debug!(instance_id = %instance_id, "Image pull cancelled by shutdown");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        ss.image_repo.clone_from(&svc.image_id);
        ss.image_uuid = image_uuid;

        let Some((token, done)) = claim_slot(shutdown, slot).await else {
            debug!(instance_id = %instance_id, "Shutdown while waiting to start");
            return Ok(None);
        };
        ss.terminated_at = None;
        ss.paused = false;

        let on_terminate = self.terminate_callback(token);
        if let Err(source) = self.handler.start_service(svc, ss, on_terminate).await {
            error!(
                instance_id = %instance_id,
                service = %svc.name,
                error = %source,
                "Error trying to start service instance"
            );
            return Err(ReconcileError::runtime(RuntimeAction::Start, instance_id, source));
        }

        info!(instance_id = %instance_id, docker_id = %ss.docker_id, "Instance started");
        self.persist(ss).await;
        Ok(Some(done))
    }

    async fn pull_image(
        &self,
        shutdown: &watch::Receiver<bool>,
        svc: &ServiceDefinition,
    ) -> Result<String, ReconcileError> {
        let timeout = self.config.pull_timeout;
        let pull = self.handler.pull_image(shutdown.clone(), &svc.image_id);

        match tokio::time::timeout(timeout, pull).await {
            Ok(Ok(uuid)) => Ok(uuid),
            Ok(Err(err)) => {
                error!(
                    service = %svc.name,
                    service_id = %svc.id,
                    image = %svc.image_id,
                    error = %err,
                    "Error trying to pull image"
                );
                Err(err.into())
            }
            Err(_) => Err(ReconcileError::PullTimeout {
                image: svc.image_id.clone(),
                timeout,
            }),
        }
    }

    /// Binds to a container that is already running.
    ///
    /// Returns `None` if shutdown arrives before the slot is free.
    async fn attach_instance(
        &self,
        shutdown: &watch::Receiver<bool>,
        slot: &OperationSlot,
        svc: &ServiceDefinition,
        ss: &mut ServiceState,
    ) -> Result<Option<ProcessDone>, ReconcileError> {
        let instance_id = ss.id;
        let Some((token, done)) = claim_slot(shutdown, slot).await else {
            debug!(instance_id = %instance_id, "Shutdown while waiting to attach");
            return Ok(None);
        };

        let on_terminate = self.terminate_callback(token);
        if let Err(source) = self.handler.attach_service(svc, ss, on_terminate).await {
            error!(
                instance_id = %instance_id,
                service = %svc.name,
                error = %source,
                "Error trying to attach to service instance"
            );
            return Err(ReconcileError::runtime(RuntimeAction::Attach, instance_id, source));
        }

        self.persist(ss).await;
        Ok(Some(done))
    }

    async fn pause_instance(
        &self,
        svc: &ServiceDefinition,
        ss: &mut ServiceState,
    ) -> Result<(), ReconcileError> {
        info!(instance_id = %ss.id, service = %svc.name, "Pausing service instance");

        self.handler
            .pause_service(svc, ss)
            .await
            .map_err(|source| ReconcileError::runtime(RuntimeAction::Pause, ss.id, source))?;

        ss.paused = true;
        self.persist(ss).await;
        Ok(())
    }

    async fn resume_instance(
        &self,
        svc: &ServiceDefinition,
        ss: &mut ServiceState,
    ) -> Result<(), ReconcileError> {
        self.handler
            .resume_service(svc, ss)
            .await
            .map_err(|source| ReconcileError::runtime(RuntimeAction::Resume, ss.id, source))?;

        ss.paused = false;
        self.persist(ss).await;
        Ok(())
    }

    /// Stops the instance's container and waits for its termination callback.
    async fn stop_instance(&self, slot: &OperationSlot, ss: &ServiceState) {
        if !slot.is_busy() && !ss.is_running() {
            debug!(instance_id = %ss.id, "No container to stop");
            return;
        }

        info!(instance_id = %ss.id, docker_id = %ss.docker_id, "Stopping service instance");
        if let Err(err) = self.handler.stop_service(ss).await {
            error!(instance_id = %ss.id, error = %err, "Could not stop service instance");
            return;
        }

        debug!(instance_id = %ss.id, "Waiting for service instance to terminate");
        slot.wait_idle().await;
    }

    // -------------------------------------------------------------------------
    // Store write-back
    // -------------------------------------------------------------------------

    /// Writes the runtime fields of `ss` back to the store.
    ///
    /// The runtime action has already happened and cannot be rolled back, so
    /// a failed write is only logged. While the container stays bound, the
    /// next pass writes its fields again.
    /// If the termination callback has already recorded the container's
    /// exit, that record is kept.
    async fn persist(&self, ss: &mut ServiceState) {
        let local = ss.clone();
        let record = |_: &HostState, stored: &mut ServiceState| {
            if local.terminated_at.is_none() && stored.exited_since(local.started_at) {
                debug!(instance_id = %local.id, "Container already exited, keeping recorded exit");
                return;
            }
            stored.copy_runtime_fields(&local);
        };

        match update_instance(
            &*self.conn,
            &self.host_id,
            &local.id,
            self.config.update_retries,
            record,
        )
        .await
        {
            Ok(stored) => *ss = stored,
            Err(err) => warn!(
                instance_id = %local.id,
                error = %err,
                "Could not update service instance"
            ),
        }
    }

    /// Builds the callback handed to the runtime on start/attach.
    ///
    /// It records the termination on the ServiceState and only then
    /// completes `token`, so a pass woken by the completion always reads a
    /// non-running state.
    fn terminate_callback(&self, token: InFlight) -> TerminateFn {
        let conn = Arc::clone(&self.conn);
        let host_id = self.host_id;
        let retries = self.config.update_retries;
        let runtime = tokio::runtime::Handle::try_current().ok();

        Box::new(move |instance_id: InstanceId| {
            debug!(instance_id = %instance_id, "Received process done signal");
            let terminated = Utc::now();

            let Some(runtime) = runtime else {
                warn!(instance_id = %instance_id, "No async runtime to record termination");
                token.complete();
                return;
            };

            runtime.spawn(async move {
                let set_terminated = |_: &HostState, ss: &mut ServiceState| ss.mark_terminated(terminated);
                if let Err(err) =
                    update_instance(&*conn, &host_id, &instance_id, retries, set_terminated).await
                {
                    warn!(
                        instance_id = %instance_id,
                        terminated_at = %terminated,
                        error = %err,
                        "Could not update instance with the time terminated"
                    );
                }
                token.complete();
            });
        })
    }
}

/// Claims `slot`, giving up if shutdown is requested first.
async fn claim_slot(
    shutdown: &watch::Receiver<bool>,
    slot: &OperationSlot,
) -> Option<(InFlight, ProcessDone)> {
    let mut shutdown = shutdown.clone();
    tokio::select! {
        claimed = slot.begin() => Some(claimed),
        _ = shutdown_signalled(&mut shutdown) => None,
    }
}

async fn process_exited(process_done: &mut Option<ProcessDone>) {
    match process_done {
        Some(done) => done.await,
        None => std::future::pending().await,
    }
}

/// Resolves once shutdown is requested or the signal's sender is gone.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use corral_coord::{create_node, MemoryConnection};
    use corral_id::ServiceId;

    async fn seed(conn: &MemoryConnection, host_id: HostId) -> ServiceState {
        let mut svc = ServiceDefinition::new(ServiceId::new(), "web", "registry/web:1");
        create_node(conn, &service_path(&svc.id), &mut svc).await.unwrap();

        let mut ss = ServiceState::new(svc.id, host_id);
        ss.docker_id = "ctr_000000000001".to_string();
        ss.started_at = Some(Utc::now());
        create_node(conn, &service_state_path(&svc.id, &ss.id), &mut ss)
            .await
            .unwrap();

        let mut hs = HostState::new(&ss);
        create_node(conn, &host_state_path(&host_id, &ss.id), &mut hs)
            .await
            .unwrap();
        ss
    }

    fn reconciler(conn: Arc<MemoryConnection>, host_id: HostId) -> InstanceReconciler {
        InstanceReconciler::new(
            conn,
            Arc::new(MockRuntime::new()),
            host_id,
            InstanceRegistry::new(),
            ReconcilerConfig::default(),
        )
    }

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.pull_timeout, Duration::from_secs(600));
        assert_eq!(config.update_retries, 3);
        assert!(!config.soft_fail_missing_images);
    }

    #[tokio::test]
    async fn test_terminate_callback_records_before_completing() {
        let conn = Arc::new(MemoryConnection::new());
        let host_id = HostId::new();
        let ss = seed(&conn, host_id).await;
        let reconciler = reconciler(Arc::clone(&conn), host_id);

        let slot = OperationSlot::new();
        let (token, done) = slot.begin().await;
        let on_terminate = reconciler.terminate_callback(token);
        on_terminate(ss.id);
        done.await;

        assert!(!slot.is_busy());
        let stored: ServiceState = get_node(&*conn, &service_state_path(&ss.service_id, &ss.id))
            .await
            .unwrap();
        assert!(stored.docker_id.is_empty());
        assert!(stored.terminated_at.is_some());
        assert!(!stored.is_running());
    }

    #[tokio::test]
    async fn test_terminate_callback_completes_when_nodes_are_gone() {
        let conn = Arc::new(MemoryConnection::new());
        let host_id = HostId::new();
        let reconciler = reconciler(Arc::clone(&conn), host_id);

        let slot = OperationSlot::new();
        let (token, done) = slot.begin().await;
        let on_terminate = reconciler.terminate_callback(token);
        on_terminate(InstanceId::new());

        tokio::time::timeout(Duration::from_secs(1), done)
            .await
            .unwrap();
        assert!(!slot.is_busy());
    }

    #[tokio::test]
    async fn test_claim_slot_gives_up_on_shutdown() {
        let slot = OperationSlot::new();
        let (_held, _done) = slot.begin().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let waiting = claim_slot(&shutdown_rx, &slot);
        tokio::pin!(waiting);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut waiting)
            .await
            .is_err());

        shutdown_tx.send(true).unwrap();
        let claimed = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap();
        assert!(claimed.is_none());
        assert!(slot.is_busy());
    }

    #[tokio::test]
    async fn test_spawn_without_host_state_fails() {
        let conn = Arc::new(MemoryConnection::new());
        let host_id = HostId::new();
        let reconciler = reconciler(Arc::clone(&conn), host_id);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = reconciler
            .spawn(shutdown_rx, InstanceId::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Coordination(ref e) if e.is_not_found()));
        assert!(reconciler.registry().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_without_service_state_cleans_up() {
        let conn = Arc::new(MemoryConnection::new());
        let host_id = HostId::new();
        let ss = seed(&conn, host_id).await;
        conn.delete(&service_state_path(&ss.service_id, &ss.id))
            .await
            .unwrap();

        let reconciler = reconciler(Arc::clone(&conn), host_id);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let result = reconciler.spawn(shutdown_rx, ss.id).await;

        assert!(result.is_err());
        assert!(reconciler.registry().is_empty());
        assert!(!conn
            .exists(&host_state_path(&host_id, &ss.id))
            .await
            .unwrap());
    }
}
