//! Records stored in the coordination store.
//!
//! - [`HostState`]: the scheduler's intent for one instance on this host.
//! - [`ServiceState`]: what the runtime is actually doing for that instance.
//! - [`ServiceDefinition`]: the service's image and metadata (read-only here).
//!
//! [`paths`] maps identifiers to node paths and [`update_instance`] /
//! [`remove_instance`] are the read-modify-write and teardown helpers.

mod host_state;
pub mod paths;
mod service;
mod service_state;
mod update;

pub use host_state::{DesiredState, HostState};
pub use service::ServiceDefinition;
pub use service_state::{InstanceStatus, ServiceState};
pub use update::{remove_instance, update_instance};
