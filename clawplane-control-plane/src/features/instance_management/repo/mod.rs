use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{ActionRecord, ClawInstance, DesiredState, InstanceAction, InstanceStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Durable record of instances plus the append-only action audit log.
///
/// `insert` and `update_gateway_port` must reject duplicates (name
/// case-insensitively, and (host, port) pairs) with
/// `ControlPlaneError::UniqueViolation` so the orchestrator can tell a
/// uniqueness race apart from any other storage failure.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// All instances ordered by creation time ascending.
    async fn find_all(&self) -> ControlPlaneResult<Vec<ClawInstance>>;

    async fn find_by_id(&self, instance_id: Uuid) -> ControlPlaneResult<Option<ClawInstance>>;

    async fn exists_by_name_case_insensitive(&self, name: &str) -> ControlPlaneResult<bool>;

    async fn insert(&self, instance: ClawInstance) -> ControlPlaneResult<()>;

    async fn update_state(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        desired_state: DesiredState,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<()>;

    async fn update_gateway_port(
        &self,
        instance_id: Uuid,
        gateway_host_port: u16,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<()>;

    /// Returns the number of rows removed; zero means the instance was
    /// already gone.
    async fn delete_by_id(&self, instance_id: Uuid) -> ControlPlaneResult<u64>;

    async fn insert_action(
        &self,
        instance_id: Uuid,
        action: InstanceAction,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<Uuid>;

    async fn find_allocated_ports_by_host(
        &self,
        host_id: Uuid,
    ) -> ControlPlaneResult<HashSet<u16>>;
}

#[derive(Default)]
struct StoreInner {
    instances: HashMap<Uuid, ClawInstance>,
    actions: Vec<ActionRecord>,
}

/// In-memory implementation of the instance store.
#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit records for one instance, in insertion order. Test support for
    /// asserting on the append-only log.
    pub fn actions_for(&self, instance_id: Uuid) -> Vec<ActionRecord> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .actions
                    .iter()
                    .filter(|record| record.instance_id == instance_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn read(&self) -> ControlPlaneResult<std::sync::RwLockReadGuard<'_, StoreInner>> {
        self.inner
            .read()
            .map_err(|_| ControlPlaneError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> ControlPlaneResult<std::sync::RwLockWriteGuard<'_, StoreInner>> {
        self.inner
            .write()
            .map_err(|_| ControlPlaneError::Storage("lock poisoned".to_string()))
    }
}

fn port_taken_by_other(
    inner: &StoreInner,
    instance_id: Uuid,
    host_id: Uuid,
    port: u16,
) -> bool {
    inner.instances.values().any(|other| {
        other.id != instance_id
            && other.host_id == host_id
            && other.gateway_host_port == Some(port)
    })
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn find_all(&self) -> ControlPlaneResult<Vec<ClawInstance>> {
        let inner = self.read()?;
        let mut instances: Vec<ClawInstance> = inner.instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn find_by_id(&self, instance_id: Uuid) -> ControlPlaneResult<Option<ClawInstance>> {
        let inner = self.read()?;
        Ok(inner.instances.get(&instance_id).cloned())
    }

    async fn exists_by_name_case_insensitive(&self, name: &str) -> ControlPlaneResult<bool> {
        let needle = name.to_lowercase();
        let inner = self.read()?;
        Ok(inner
            .instances
            .values()
            .any(|instance| instance.name.to_lowercase() == needle))
    }

    async fn insert(&self, instance: ClawInstance) -> ControlPlaneResult<()> {
        let mut inner = self.write()?;

        let name = instance.name.to_lowercase();
        if inner
            .instances
            .values()
            .any(|other| other.name.to_lowercase() == name)
        {
            return Err(ControlPlaneError::UniqueViolation(
                "duplicate instance name".to_string(),
            ));
        }

        if let Some(port) = instance.gateway_host_port {
            if port_taken_by_other(&inner, instance.id, instance.host_id, port) {
                return Err(ControlPlaneError::UniqueViolation(
                    "duplicate gateway host port".to_string(),
                ));
            }
        }

        inner.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn update_state(
        &self,
        instance_id: Uuid,
        status: InstanceStatus,
        desired_state: DesiredState,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<()> {
        let mut inner = self.write()?;
        match inner.instances.get_mut(&instance_id) {
            Some(instance) => {
                instance.status = status;
                instance.desired_state = desired_state;
                instance.updated_at = at;
                Ok(())
            }
            None => Err(ControlPlaneError::NotFound(
                "instance not found".to_string(),
            )),
        }
    }

    async fn update_gateway_port(
        &self,
        instance_id: Uuid,
        gateway_host_port: u16,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<()> {
        let mut inner = self.write()?;

        let host_id = match inner.instances.get(&instance_id) {
            Some(instance) => instance.host_id,
            None => {
                return Err(ControlPlaneError::NotFound(
                    "instance not found".to_string(),
                ))
            }
        };

        if port_taken_by_other(&inner, instance_id, host_id, gateway_host_port) {
            return Err(ControlPlaneError::UniqueViolation(
                "duplicate gateway host port".to_string(),
            ));
        }

        if let Some(instance) = inner.instances.get_mut(&instance_id) {
            instance.gateway_host_port = Some(gateway_host_port);
            instance.updated_at = at;
        }
        Ok(())
    }

    async fn delete_by_id(&self, instance_id: Uuid) -> ControlPlaneResult<u64> {
        let mut inner = self.write()?;
        Ok(u64::from(inner.instances.remove(&instance_id).is_some()))
    }

    async fn insert_action(
        &self,
        instance_id: Uuid,
        action: InstanceAction,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<Uuid> {
        let mut inner = self.write()?;
        let action_id = Uuid::new_v4();
        inner.actions.push(ActionRecord {
            id: action_id,
            instance_id,
            action,
            reason,
            accepted_at: at,
        });
        Ok(action_id)
    }

    async fn find_allocated_ports_by_host(
        &self,
        host_id: Uuid,
    ) -> ControlPlaneResult<HashSet<u16>> {
        let inner = self.read()?;
        Ok(inner
            .instances
            .values()
            .filter(|instance| instance.host_id == host_id)
            .filter_map(|instance| instance.gateway_host_port)
            .collect())
    }
}
