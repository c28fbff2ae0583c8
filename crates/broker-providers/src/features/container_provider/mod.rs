pub mod repo;
pub mod service;

use crate::{ProviderAdapter, ProviderResult, RecordPage, RemoteStatus};
use async_trait::async_trait;
use broker_core::{InstanceConfig, ProviderKind, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use repo::{ContainerApi, DockerEngineApi};
use service::ContainerProviderService;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Container provider talking to a Docker-compatible engine API.
pub struct ContainerAdapter {
    service: ContainerProviderService,
}

impl ContainerAdapter {
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self {
            service: ContainerProviderService::new(api),
        }
    }

    pub fn docker(request_timeout: Option<Duration>) -> ProviderResult<Self> {
        Ok(Self::new(Arc::new(DockerEngineApi::new(request_timeout)?)))
    }
}

#[async_trait]
impl ProviderAdapter for ContainerAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Container
    }

    async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle> {
        self.service.checkout(instance, request).await
    }

    /// Containers carry no remote lease, so the broker's own expiry is all there is.
    async fn extend(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
        new_expiry: DateTime<Utc>,
    ) -> ProviderResult<()> {
        debug!(
            instance = %instance.name,
            container_id = %handle.reference_key,
            %new_expiry,
            "Container lease extended locally"
        );
        Ok(())
    }

    async fn release(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<()> {
        self.service.release(instance, handle).await
    }

    async fn status(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<RemoteStatus> {
        self.service.status(instance, handle).await
    }

    async fn list(
        &self,
        instance: &InstanceConfig,
        limit: usize,
        _cursor: Option<&str>,
    ) -> ProviderResult<RecordPage> {
        self.service.list(instance, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_adapter_kind() {
        let adapter = ContainerAdapter::docker(None).unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Container);
        assert!(!adapter.idempotent_checkout());
    }

    #[tokio::test]
    async fn test_extend_is_acknowledged_without_remote_call() {
        let adapter = ContainerAdapter::docker(None).unwrap();
        let instance = InstanceConfig::new("docker").with_setting("host", "http://127.0.0.1:1");
        let handle = ResourceHandle::new(ProviderKind::Container, "docker", "c1");
        adapter.extend(&instance, &handle, Utc::now()).await.unwrap();
    }
}
