//! Error types for the host agent.

use std::time::Duration;

use corral_coord::CoordError;
use corral_id::InstanceId;
use thiserror::Error;

use crate::runtime::PullError;

/// Runtime handler operation, for error reporting and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeAction {
    PullImage,
    Start,
    Attach,
    Pause,
    Resume,
    Stop,
}

impl std::fmt::Display for RuntimeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::PullImage => "pull image",
            Self::Start => "start",
            Self::Attach => "attach",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Reasons an instance reconciler exits with an error.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reading or writing the coordination store failed.
    #[error("coordination store error: {0}")]
    Coordination(#[from] CoordError),

    /// The runtime handler rejected an operation.
    #[error("{action} failed for instance {instance_id}: {source}")]
    Runtime {
        action: RuntimeAction,
        instance_id: InstanceId,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    ImagePull(#[from] PullError),

    #[error("pulling image {image} timed out after {timeout:?}")]
    PullTimeout { image: String, timeout: Duration },

    /// Another reconciler already manages this instance.
    #[error("instance {0} already has a live reconciler")]
    AlreadyRegistered(InstanceId),
}

impl ReconcileError {
    pub fn runtime(action: RuntimeAction, instance_id: InstanceId, source: anyhow::Error) -> Self {
        Self::Runtime {
            action,
            instance_id,
            source,
        }
    }
}
