use chrono::{DateTime, Utc};
use corral_coord::{Node, Version};
use corral_id::{HostId, InstanceId, ServiceId};
use serde::{Deserialize, Serialize};

/// Observed lifecycle of an instance's container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// No container has ever been started for this instance.
    NeverStarted,
    /// A container is bound and has not terminated.
    Running,
    /// The last container exited.
    Terminated,
}

/// Actual runtime state of one instance. Written only by the host agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    pub id: InstanceId,
    pub service_id: ServiceId,
    pub host_id: HostId,

    /// Container ID assigned by the runtime; empty when no container is bound.
    #[serde(default)]
    pub docker_id: String,

    #[serde(default)]
    pub image_repo: String,

    #[serde(default)]
    pub image_uuid: String,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub paused: bool,

    #[serde(skip)]
    version: Option<Version>,
}

impl ServiceState {
    /// A fresh, never-started instance of `service_id` placed on `host_id`.
    pub fn new(service_id: ServiceId, host_id: HostId) -> Self {
        Self {
            id: InstanceId::new(),
            service_id,
            host_id,
            docker_id: String::new(),
            image_repo: String::new(),
            image_uuid: String::new(),
            started_at: None,
            terminated_at: None,
            paused: false,
            version: None,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        if !self.docker_id.is_empty() && self.terminated_at.is_none() {
            InstanceStatus::Running
        } else if self.started_at.is_some() || self.terminated_at.is_some() {
            InstanceStatus::Terminated
        } else {
            InstanceStatus::NeverStarted
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == InstanceStatus::Running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Copies the fields the agent owns (container binding, image, timestamps,
    /// pause flag) from `other`, leaving identity and version untouched.
    pub fn copy_runtime_fields(&mut self, other: &ServiceState) {
        self.docker_id.clone_from(&other.docker_id);
        self.image_repo.clone_from(&other.image_repo);
        self.image_uuid.clone_from(&other.image_uuid);
        self.started_at = other.started_at;
        self.terminated_at = other.terminated_at;
        self.paused = other.paused;
    }

    /// Whether this record notes an exit at or after `started_at`, i.e. the
    /// container started then has already gone away.
    pub fn exited_since(&self, started_at: Option<DateTime<Utc>>) -> bool {
        match (self.terminated_at, started_at) {
            (Some(terminated), Some(started)) => terminated >= started,
            _ => false,
        }
    }

    /// Records that the bound container exited at `at`.
    pub fn mark_terminated(&mut self, at: DateTime<Utc>) {
        self.terminated_at = Some(at);
        self.docker_id.clear();
    }
}

impl Node for ServiceState {
    fn version(&self) -> Option<Version> {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }
}
