//! Read-modify-write and teardown helpers for instance records.

use corral_coord::{get_node, set_node, Connection, CoordError};
use corral_id::{HostId, InstanceId, ServiceId};
use tracing::{debug, warn};

use super::paths::{host_state_path, service_state_path};
use super::{HostState, ServiceState};

/// Applies `mutate` to an instance's ServiceState and writes it back.
///
/// The HostState is read first to locate the ServiceState. The write carries
/// the version just read; on a version conflict both records are re-read and
/// `mutate` is applied again, up to `attempts` times in total. The stored
/// record (with its new version) is returned.
pub async fn update_instance<C, F>(
    conn: &C,
    host_id: &HostId,
    instance_id: &InstanceId,
    attempts: u32,
    mut mutate: F,
) -> Result<ServiceState, CoordError>
where
    C: Connection + ?Sized,
    F: FnMut(&HostState, &mut ServiceState),
{
    let hs_path = host_state_path(host_id, instance_id);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let hs: HostState = get_node(conn, &hs_path).await?;
        let ss_path = service_state_path(&hs.service_id, instance_id);
        let mut ss: ServiceState = get_node(conn, &ss_path).await?;

        mutate(&hs, &mut ss);

        match set_node(conn, &ss_path, &mut ss).await {
            Ok(()) => return Ok(ss),
            Err(err) if err.is_version_conflict() && attempt < attempts.max(1) => {
                debug!(
                    instance_id = %instance_id,
                    attempt,
                    error = %err,
                    "Service state changed concurrently, retrying update"
                );
            }
            Err(err) => return Err(err),
        }
    }
}

/// Deletes an instance's HostState and ServiceState nodes.
///
/// Missing nodes are not an error, so calling this twice is harmless.
pub async fn remove_instance<C>(
    conn: &C,
    host_id: &HostId,
    service_id: &ServiceId,
    instance_id: &InstanceId,
) -> Result<(), CoordError>
where
    C: Connection + ?Sized,
{
    let mut first_error = None;

    for path in [
        host_state_path(host_id, instance_id),
        service_state_path(service_id, instance_id),
    ] {
        match conn.delete(&path).await {
            Ok(()) => debug!(path = %path, "Removed instance node"),
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(path = %path, error = %err, "Could not remove instance node");
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
