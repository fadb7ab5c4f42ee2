//! Host-local registry of instances with a live reconciler.
//!
//! A [`Registration`] is held by the reconciler for its whole lifetime and
//! removes its entry when released or dropped, so every exit path
//! deregisters exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use corral_id::{HostId, InstanceId, ServiceId};
use tracing::debug;

use crate::error::ReconcileError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub host_id: HostId,
    pub service_id: ServiceId,
    pub instance_id: InstanceId,
    pub registered_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(host_id: HostId, service_id: ServiceId, instance_id: InstanceId) -> Self {
        Self {
            host_id,
            service_id,
            instance_id,
            registered_at: Utc::now(),
        }
    }
}

/// Shared map of instance ID to registry entry.
#[derive(Debug, Clone, Default)]
pub struct InstanceRegistry {
    entries: Arc<Mutex<HashMap<InstanceId, RegistryEntry>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<InstanceId, RegistryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers an instance, failing if it already has a live reconciler.
    pub fn register(&self, entry: RegistryEntry) -> Result<Registration, ReconcileError> {
        let instance_id = entry.instance_id;
        let mut entries = self.lock();
        if entries.contains_key(&instance_id) {
            return Err(ReconcileError::AlreadyRegistered(instance_id));
        }
        entries.insert(instance_id, entry);
        drop(entries);

        debug!(instance_id = %instance_id, "Registered instance");
        Ok(Registration {
            registry: self.clone(),
            instance_id,
            released: false,
        })
    }

    pub fn contains(&self, instance_id: &InstanceId) -> bool {
        self.lock().contains_key(instance_id)
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<RegistryEntry> {
        self.lock().get(instance_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered instance IDs, sorted.
    pub fn instances(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Scoped registry membership for one instance.
#[derive(Debug)]
pub struct Registration {
    registry: InstanceRegistry,
    instance_id: InstanceId,
    released: bool,
}

impl Registration {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Removes the entry. Returns false if it was already released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.registry.lock().remove(&self.instance_id);
        debug!(instance_id = %self.instance_id, "Deregistered instance");
        true
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> RegistryEntry {
        RegistryEntry::new(HostId::new(), ServiceId::new(), InstanceId::new())
    }

    #[test]
    fn test_register_and_release() {
        let registry = InstanceRegistry::new();
        let entry = entry();
        let id = entry.instance_id;

        let mut registration = registry.register(entry).unwrap();
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        assert!(registration.release());
        assert!(!registry.contains(&id));
        assert!(!registration.release());
    }

    #[test]
    fn test_double_registration_rejected() {
        let registry = InstanceRegistry::new();
        let entry = entry();
        let _registration = registry.register(entry.clone()).unwrap();

        let err = registry.register(entry.clone()).unwrap_err();
        assert!(matches!(err, ReconcileError::AlreadyRegistered(id) if id == entry.instance_id));
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = InstanceRegistry::new();
        let entry = entry();
        let id = entry.instance_id;
        {
            let _registration = registry.register(entry).unwrap();
            assert_eq!(registry.instances(), vec![id]);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_does_not_remove_newer_registration() {
        let registry = InstanceRegistry::new();
        let entry = entry();
        let id = entry.instance_id;

        let mut first = registry.register(entry.clone()).unwrap();
        first.release();
        let _second = registry.register(entry).unwrap();

        drop(first);
        assert!(registry.contains(&id));
    }
}
