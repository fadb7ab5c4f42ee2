use corral_coord::{Node, Version};
use corral_id::ServiceId;
use serde::{Deserialize, Serialize};

/// Read-only snapshot of a service's definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: ServiceId,
    pub name: String,

    /// Image reference to pull before starting an instance.
    pub image_id: String,

    #[serde(skip)]
    version: Option<Version>,
}

impl ServiceDefinition {
    pub fn new(id: ServiceId, name: impl Into<String>, image_id: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            image_id: image_id.into(),
            version: None,
        }
    }
}

impl Node for ServiceDefinition {
    fn version(&self) -> Option<Version> {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = Some(version);
    }
}
