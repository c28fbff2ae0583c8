use crate::features::container_provider::repo::{ContainerApi, ContainerSpec, HostConfig};
use crate::{ProviderError, ProviderRecord, ProviderResult, RecordPage, RemoteStatus};
use broker_core::{InstanceConfig, ProviderKind, ResourceHandle, WorkflowRequest};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MANAGED_LABEL: &str = "broker.managed";
pub const INSTANCE_LABEL: &str = "broker.instance";
const DEFAULT_NAME_PREFIX: &str = "broker";

pub struct ContainerProviderService {
    api: Arc<dyn ContainerApi>,
}

impl ContainerProviderService {
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self { api }
    }

    /// Creates and starts a container. A container that fails to start is
    /// removed again so nothing is left behind untracked.
    pub async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle> {
        let host = instance.require_str("host")?;
        let spec = build_spec(instance, request)?;

        let id = self.api.create(host, &spec).await?;
        if let Err(error) = self.api.start(host, &id).await {
            warn!(
                instance = %instance.name,
                container_id = %id,
                error = %error,
                "Container failed to start, removing"
            );
            if let Err(cleanup) = self.api.remove(host, &id).await {
                warn!(container_id = %id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(error);
        }

        info!(
            instance = %instance.name,
            container_id = %id,
            name = %spec.name,
            image = %spec.image,
            "Container started"
        );

        Ok(
            ResourceHandle::new(ProviderKind::Container, instance.name.clone(), id)
                .with_reference(json!({
                    "name": spec.name,
                    "image": spec.image,
                    "host": host,
                })),
        )
    }

    pub async fn release(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<()> {
        let host = instance.require_str("host")?;
        match self.api.remove(host, &handle.reference_key).await {
            Ok(()) => Ok(()),
            Err(ProviderError::ResourceNotFound(_)) => {
                debug!(container_id = %handle.reference_key, "Container already removed");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    pub async fn status(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<RemoteStatus> {
        let host = instance.require_str("host")?;
        match self.api.inspect(host, &handle.reference_key).await {
            Ok(inspect) => Ok(map_state(&inspect.state.status)),
            Err(ProviderError::ResourceNotFound(_)) => Ok(RemoteStatus::Unknown),
            Err(error) => Err(error),
        }
    }

    /// The engine API has no cursor, so the listing is always a single page.
    pub async fn list(&self, instance: &InstanceConfig, limit: usize) -> ProviderResult<RecordPage> {
        let host = instance.require_str("host")?;
        let label = format!("{MANAGED_LABEL}=true");
        let containers = self.api.list(host, &label, limit).await?;

        let records = containers
            .into_iter()
            .filter(|c| {
                c.labels
                    .get(INSTANCE_LABEL)
                    .map_or(true, |owner| owner == &instance.name)
            })
            .take(limit)
            .map(|c| {
                let name = c
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| c.id.clone());
                let mut attributes = Map::new();
                attributes.insert("image".to_string(), Value::String(c.image.clone()));
                attributes.insert("state".to_string(), Value::String(c.state.clone()));
                ProviderRecord::new(c.id, name, map_state(&c.state)).with_attributes(attributes)
            })
            .collect();

        Ok(RecordPage::last(records))
    }
}

fn build_spec(instance: &InstanceConfig, request: &WorkflowRequest) -> ProviderResult<ContainerSpec> {
    let image = request.str_param("container_host").ok_or_else(|| {
        ProviderError::InvalidParameters(
            "container checkout requires a 'container_host' image parameter".to_string(),
        )
    })?;

    let env = match request.param("environment") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Object(vars)) => vars
            .iter()
            .map(|(key, value)| match value {
                Value::String(s) => format!("{key}={s}"),
                other => format!("{key}={other}"),
            })
            .collect(),
        Some(other) => {
            return Err(ProviderError::InvalidParameters(format!(
                "environment must be an object, got {other}"
            )))
        }
    };

    let prefix = instance
        .str_setting("name_prefix")
        .unwrap_or(DEFAULT_NAME_PREFIX);
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert(INSTANCE_LABEL.to_string(), instance.name.clone());

    Ok(ContainerSpec {
        name: format!("{prefix}-{suffix}"),
        image: image.to_string(),
        env,
        labels,
        host_config: HostConfig {
            publish_all_ports: instance.bool_setting("auto_map_ports").unwrap_or(false),
            network_mode: instance.str_setting("network").map(str::to_string),
        },
    })
}

fn map_state(state: &str) -> RemoteStatus {
    match state {
        "running" => RemoteStatus::Running,
        "created" | "restarting" => RemoteStatus::Provisioning,
        _ => RemoteStatus::Stopped,
    }
}
