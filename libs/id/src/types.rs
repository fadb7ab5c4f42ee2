//! Typed ID definitions.

use crate::define_id;

define_id!(
    /// A cluster host running a host agent.
    HostId,
    "host"
);

define_id!(
    /// A service definition (image plus metadata).
    ServiceId,
    "svc"
);

define_id!(
    /// One instance of a service placed on a host. This is also the key of
    /// the instance's service-state record.
    InstanceId,
    "inst"
);
