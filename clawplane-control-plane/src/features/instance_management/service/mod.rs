use crate::features::instance_management::plane::{ExecutionPlaneClient, PlaneExecutionRecord};
use crate::features::instance_management::repo::InstanceStore;
use crate::shared::config::{GatewayConfig, ImageCatalogConfig, PresetEntry};
use crate::shared::error::{ControlPlaneError, ControlPlaneResult};
use crate::shared::types::{
    AcceptedAction, ClawInstance, CreateInstanceRequest, DesiredState, ImagePreset,
    InstanceAction, InstanceActionRequest, InstanceRuntime, InstanceStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Orchestrator for claw instances: creation, action submission, deletion,
/// gateway port allocation and the retry-on-port-conflict protocol.
///
/// The store is a best-effort mirror of the execution plane; writes around a
/// plane call are not one transaction, and a store write failing after a
/// successful plane call leaves the two inconsistent by design.
pub struct InstanceService {
    store: Arc<dyn InstanceStore>,
    plane: Arc<dyn ExecutionPlaneClient>,
    gateway: GatewayConfig,
    images: ImageCatalogConfig,
}

impl InstanceService {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        plane: Arc<dyn ExecutionPlaneClient>,
        gateway: GatewayConfig,
        images: ImageCatalogConfig,
    ) -> Self {
        Self {
            store,
            plane,
            gateway,
            images,
        }
    }

    /// All instances, creation order, with gateway URLs resolved.
    pub async fn list_instances(&self) -> ControlPlaneResult<Vec<ClawInstance>> {
        Ok(self
            .store
            .find_all()
            .await?
            .into_iter()
            .map(|instance| self.attach_gateway_url(instance))
            .collect())
    }

    /// The configured image catalog, filtered to well-formed presets.
    pub fn list_image_presets(&self) -> Vec<ImagePreset> {
        self.images
            .presets
            .iter()
            .filter(|preset| is_valid_preset(preset))
            .map(|preset| ImagePreset {
                id: preset.id.trim().to_string(),
                name: preset.name.trim().to_string(),
                image: preset.image.trim().to_string(),
                runtime: InstanceRuntime::Zeroclaw,
                description: preset.description.clone(),
                recommended: preset.recommended,
            })
            .collect()
    }

    pub async fn create_instance(
        &self,
        request: CreateInstanceRequest,
    ) -> ControlPlaneResult<ClawInstance> {
        let name = request.name.trim().to_string();
        self.validate_instance_name(&name).await?;

        let image = request.image.trim().to_string();
        self.validate_requested_image(&image)?;

        let host_id = Uuid::parse_str(request.host_id.trim())
            .map_err(|_| ControlPlaneError::Validation("hostId must be a valid UUID".to_string()))?;

        let now = Utc::now();
        let desired_state = request.desired_state.unwrap_or(DesiredState::Running);
        let status = if desired_state == DesiredState::Running {
            InstanceStatus::Creating
        } else {
            InstanceStatus::Stopped
        };
        let gateway_host_port = self.allocate_gateway_port(host_id).await?;

        let instance = ClawInstance::new(
            name,
            host_id,
            image,
            Some(gateway_host_port),
            status,
            desired_state,
            now,
        );

        if let Err(error) = self.store.insert(instance.clone()).await {
            return Err(match error {
                ControlPlaneError::UniqueViolation(_) => ControlPlaneError::Conflict(
                    "gateway host port already allocated".to_string(),
                ),
                other => other,
            });
        }

        info!(instance_id = %instance.id, name = %instance.name, port = gateway_host_port, "instance created");

        if desired_state == DesiredState::Running {
            let (record, final_port) = self
                .execute_with_port_retry(
                    instance.id,
                    instance.host_id,
                    InstanceAction::Start,
                    &instance.image,
                    instance.gateway_host_port,
                    now,
                )
                .await?;
            if !record.succeeded() {
                // Status intentionally stays CREATING so the instance can be
                // repaired or retried externally.
                return Err(ControlPlaneError::UpstreamFailure(format!(
                    "plane execution failed: {}",
                    record.message.as_deref().unwrap_or("")
                )));
            }

            let updated_at = Utc::now();
            self.store
                .update_state(instance.id, InstanceStatus::Running, desired_state, updated_at)
                .await?;

            let mut started = instance;
            started.gateway_host_port = final_port;
            started.status = InstanceStatus::Running;
            started.updated_at = updated_at;
            return Ok(self.attach_gateway_url(started));
        }

        Ok(self.attach_gateway_url(instance))
    }

    pub async fn submit_instance_action(
        &self,
        instance_id: Uuid,
        request: InstanceActionRequest,
    ) -> ControlPlaneResult<AcceptedAction> {
        let instance = self.get_instance(instance_id).await?;
        let now = Utc::now();
        let desired_state = request.action.desired_state();

        let (record, _) = match self
            .execute_with_port_retry(
                instance.id,
                instance.host_id,
                request.action,
                &instance.image,
                instance.gateway_host_port,
                now,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                // The failure audit record survives even though the call
                // reports failure.
                self.store
                    .update_state(instance.id, InstanceStatus::Error, desired_state, now)
                    .await?;
                self.store
                    .insert_action(
                        instance.id,
                        request.action,
                        Some(failure_reason(request.reason.as_deref(), error.detail())),
                        now,
                    )
                    .await?;
                return Err(error);
            }
        };

        let succeeded = record.succeeded();
        let message = record.message.as_deref().unwrap_or("");
        let status = if succeeded {
            request.action.status_on_success()
        } else {
            InstanceStatus::Error
        };
        let reason = if succeeded {
            request.reason.clone()
        } else {
            Some(failure_reason(request.reason.as_deref(), message))
        };

        self.store
            .update_state(instance.id, status, desired_state, now)
            .await?;
        let action_id = self
            .store
            .insert_action(instance.id, request.action, reason, now)
            .await?;

        if !succeeded {
            return Err(ControlPlaneError::UpstreamFailure(format!(
                "plane execution failed: {message}"
            )));
        }

        info!(instance_id = %instance.id, action = request.action.as_str(), "instance action accepted");
        Ok(AcceptedAction {
            task_id: action_id,
            accepted_at: now,
        })
    }

    /// Deletion asks the execution plane first; its failure propagates. A
    /// zero-row store delete means a concurrent delete won the race.
    pub async fn delete_instance(&self, instance_id: Uuid) -> ControlPlaneResult<()> {
        let instance = self.get_instance(instance_id).await?;
        self.plane.delete_instance(instance.id).await?;
        let deleted_rows = self.store.delete_by_id(instance.id).await?;
        if deleted_rows == 0 {
            return Err(ControlPlaneError::NotFound(
                "instance not found".to_string(),
            ));
        }
        info!(instance_id = %instance.id, "instance deleted");
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> ControlPlaneResult<ClawInstance> {
        match self.store.find_by_id(instance_id).await? {
            Some(instance) => Ok(self.attach_gateway_url(instance)),
            None => Err(ControlPlaneError::NotFound(
                "instance not found".to_string(),
            )),
        }
    }

    async fn validate_instance_name(&self, name: &str) -> ControlPlaneResult<()> {
        if name.is_empty() {
            return Err(ControlPlaneError::Validation(
                "name must not be blank".to_string(),
            ));
        }
        if self.store.exists_by_name_case_insensitive(name).await? {
            return Err(ControlPlaneError::Conflict(
                "instance name already exists".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_requested_image(&self, image: &str) -> ControlPlaneResult<()> {
        if self.images.allow_custom_image {
            return Ok(());
        }

        let valid_presets: Vec<&PresetEntry> = self
            .images
            .presets
            .iter()
            .filter(|preset| is_valid_preset(preset))
            .collect();
        if valid_presets.is_empty() {
            return Ok(());
        }

        if valid_presets
            .iter()
            .any(|preset| image == preset.image.trim())
        {
            return Ok(());
        }
        Err(ControlPlaneError::Validation(
            "image must come from configured presets".to_string(),
        ))
    }

    async fn allocate_gateway_port(&self, host_id: Uuid) -> ControlPlaneResult<u16> {
        self.find_next_available_port(host_id, &HashSet::new())
            .await?
            .ok_or_else(|| {
                ControlPlaneError::Conflict("no available gateway host ports".to_string())
            })
    }

    async fn find_next_available_port(
        &self,
        host_id: Uuid,
        excluded: &HashSet<u16>,
    ) -> ControlPlaneResult<Option<u16>> {
        let start = self.gateway.port_range_start;
        let end = self.gateway.port_range_end;
        if start == 0 || end == 0 || start > end {
            return Err(ControlPlaneError::InvalidConfig(
                "invalid gateway port range configuration".to_string(),
            ));
        }

        let allocated = self.store.find_allocated_ports_by_host(host_id).await?;
        Ok((start..=end).find(|port| !allocated.contains(port) && !excluded.contains(port)))
    }

    /// Reconcile with the execution plane, walking the port range while the
    /// plane keeps reporting a bind conflict. The last record is returned
    /// when the call succeeds, the failure is not a port conflict, the range
    /// runs dry, or the retry budget is spent.
    async fn execute_with_port_retry(
        &self,
        instance_id: Uuid,
        host_id: Uuid,
        action: InstanceAction,
        image: &str,
        initial_port: Option<u16>,
        at: DateTime<Utc>,
    ) -> ControlPlaneResult<(PlaneExecutionRecord, Option<u16>)> {
        if !action.requires_gateway_port() {
            let record = self
                .plane
                .reconcile(instance_id, action, image, initial_port)
                .await?;
            return Ok((record, initial_port));
        }

        let mut attempted: HashSet<u16> = HashSet::new();
        let mut port = match initial_port {
            Some(port) => port,
            None => self
                .assign_next_gateway_port(instance_id, host_id, at, &mut attempted)
                .await?
                .ok_or_else(|| {
                    ControlPlaneError::Conflict("no available gateway host ports".to_string())
                })?,
        };

        let mut remaining_retries = u32::from(
            self.gateway
                .port_range_end
                .saturating_sub(self.gateway.port_range_start),
        );
        loop {
            attempted.insert(port);
            let record = self
                .plane
                .reconcile(instance_id, action, image, Some(port))
                .await?;
            let message = record.message.as_deref().unwrap_or("");
            if record.succeeded() || !is_gateway_port_conflict(message) || remaining_retries == 0 {
                return Ok((record, Some(port)));
            }

            warn!(%instance_id, port, "gateway port conflict reported by plane, trying next candidate");
            // The retry must not be blocked by cleanup errors.
            if let Err(error) = self.plane.delete_instance(instance_id).await {
                warn!(%instance_id, %error, "best-effort container cleanup failed");
            }

            match self
                .assign_next_gateway_port(instance_id, host_id, Utc::now(), &mut attempted)
                .await?
            {
                Some(next_port) => {
                    port = next_port;
                    remaining_retries -= 1;
                }
                None => return Ok((record, Some(port))),
            }
        }
    }

    /// Pick and persist the next free port. Candidate selection and
    /// persistence are not atomic; a uniqueness rejection means a concurrent
    /// writer took the candidate, so move on to the next one.
    async fn assign_next_gateway_port(
        &self,
        instance_id: Uuid,
        host_id: Uuid,
        at: DateTime<Utc>,
        attempted: &mut HashSet<u16>,
    ) -> ControlPlaneResult<Option<u16>> {
        loop {
            let Some(candidate) = self.find_next_available_port(host_id, attempted).await? else {
                return Ok(None);
            };
            attempted.insert(candidate);
            match self
                .store
                .update_gateway_port(instance_id, candidate, at)
                .await
            {
                Ok(()) => return Ok(Some(candidate)),
                Err(ControlPlaneError::UniqueViolation(_)) => continue,
                Err(error) => return Err(error),
            }
        }
    }

    fn attach_gateway_url(&self, mut instance: ClawInstance) -> ClawInstance {
        instance.gateway_url = resolve_gateway_url(
            &self.gateway.url_template,
            instance.id,
            instance.gateway_host_port,
        );
        instance
    }
}

fn is_valid_preset(preset: &PresetEntry) -> bool {
    !preset.id.trim().is_empty()
        && !preset.name.trim().is_empty()
        && !preset.image.trim().is_empty()
}

fn is_gateway_port_conflict(message: &str) -> bool {
    if message.trim().is_empty() {
        return false;
    }
    let normalized = message.to_lowercase();
    normalized.contains("port is already allocated")
        || normalized.contains("address already in use")
        || (normalized.contains("bind") && normalized.contains("failed"))
}

fn failure_reason(reason: Option<&str>, execution_message: &str) -> String {
    let fallback = if execution_message.trim().is_empty() {
        "plane execution failed"
    } else {
        execution_message
    };
    match reason {
        Some(reason) if !reason.trim().is_empty() => format!("{reason} | [FAILED] {fallback}"),
        _ => format!("[FAILED] {fallback}"),
    }
}

fn resolve_gateway_url(
    template: &str,
    instance_id: Uuid,
    gateway_host_port: Option<u16>,
) -> Option<String> {
    let port = gateway_host_port?;
    if template.trim().is_empty() {
        return None;
    }
    Some(
        template
            .replace("{port}", &port.to_string())
            .replace("{instanceId}", &instance_id.to_string()),
    )
}
