use corral_coord::{Node, Version};
use corral_id::{HostId, InstanceId, ServiceId};
use serde::{Deserialize, Serialize};

use super::ServiceState;

/// Desired state of an instance, as written by the scheduler.
///
/// Encoded as an integer. Values this agent does not know are kept as
/// [`DesiredState::Unrecognized`] rather than rejected, so a newer scheduler
/// cannot crash an older agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum DesiredState {
    Stop,
    Run,
    Pause,
    Unrecognized(i32),
}

impl From<i32> for DesiredState {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Stop,
            1 => Self::Run,
            2 => Self::Pause,
            other => Self::Unrecognized(other),
        }
    }
}

impl From<DesiredState> for i32 {
    fn from(state: DesiredState) -> Self {
        match state {
            DesiredState::Stop => 0,
            DesiredState::Run => 1,
            DesiredState::Pause => 2,
            DesiredState::Unrecognized(other) => other,
        }
    }
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Run => write!(f, "run"),
            Self::Pause => write!(f, "pause"),
            Self::Unrecognized(value) => write!(f, "unrecognized({value})"),
        }
    }
}

/// Intent record for one instance on one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub service_state_id: InstanceId,
    pub desired_state: DesiredState,

    #[serde(skip)]
    version: Option<Version>,
}

impl HostState {
    /// Intent to run the instance described by `state` on its host.
    pub fn new(state: &ServiceState) -> Self {
        Self {
            host_id: state.host_id,
            service_id: state.service_id,
            service_state_id: state.id,
            desired_state: DesiredState::Run,
            version: None,
        }
    }

    pub fn with_desired_state(mut self, desired_state: DesiredState) -> Self {
        self.desired_state = desired_state;
        self
    }
}

impl Node for HostState {
    fn version(&self) -> Option<Version> {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, DesiredState::Stop)]
    #[case(1, DesiredState::Run)]
    #[case(2, DesiredState::Pause)]
    #[case(-1, DesiredState::Unrecognized(-1))]
    #[case(7, DesiredState::Unrecognized(7))]
    fn test_desired_state_decoding(#[case] raw: i32, #[case] expected: DesiredState) {
        let decoded: DesiredState = serde_json::from_value(serde_json::json!(raw)).unwrap();
        assert_eq!(decoded, expected);
        assert_eq!(serde_json::to_value(decoded).unwrap(), serde_json::json!(raw));
    }

    #[test]
    fn test_new_host_state_defaults_to_run() {
        let ss = ServiceState::new(ServiceId::new(), HostId::new());
        let hs = HostState::new(&ss);
        assert_eq!(hs.desired_state, DesiredState::Run);
        assert_eq!(hs.service_state_id, ss.id);
        assert_eq!(hs.host_id, ss.host_id);
        assert!(hs.version().is_none());
    }

    #[test]
    fn test_version_not_serialized() {
        let ss = ServiceState::new(ServiceId::new(), HostId::new());
        let mut hs = HostState::new(&ss);
        hs.set_version(Version::INITIAL);
        let json = serde_json::to_value(&hs).unwrap();
        assert!(json.get("version").is_none());
        assert_eq!(json["desired_state"], serde_json::json!(1));
    }
}
