//! Coordination-store layout.
//!
//! ```text
//! /hosts/<host>/instances/<inst>   HostState
//! /services/<svc>                  ServiceDefinition
//! /services/<svc>/<inst>           ServiceState
//! ```

use corral_coord::path::join;
use corral_id::{HostId, InstanceId, ServiceId};

pub const HOSTS_ROOT: &str = "/hosts";
pub const SERVICES_ROOT: &str = "/services";

/// Parent of every HostState node assigned to `host`.
pub fn host_instances_path(host: &HostId) -> String {
    join(HOSTS_ROOT, [host.path_segment().as_str(), "instances"])
}

pub fn host_state_path(host: &HostId, instance: &InstanceId) -> String {
    join(&host_instances_path(host), [instance.path_segment()])
}

pub fn service_path(service: &ServiceId) -> String {
    join(SERVICES_ROOT, [service.path_segment()])
}

pub fn service_state_path(service: &ServiceId, instance: &InstanceId) -> String {
    join(&service_path(service), [instance.path_segment()])
}
