pub mod repo;
pub mod service;

use crate::{ProviderAdapter, ProviderResult, RecordPage, RemoteStatus};
use async_trait::async_trait;
use broker_core::{InstanceConfig, ProviderKind, ProviderOptions, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use repo::{ReqwestTowerApi, TowerApi};
use service::TowerProviderService;
use std::sync::Arc;
use std::time::Duration;

/// AnsibleTower / AWX provider. Every lifecycle verb is a workflow launch.
pub struct TowerAdapter {
    service: TowerProviderService,
}

impl TowerAdapter {
    pub fn new(api: Arc<dyn TowerApi>, options: ProviderOptions) -> Self {
        Self {
            service: TowerProviderService::new(api, options),
        }
    }

    pub fn rest(options: ProviderOptions, request_timeout: Option<Duration>) -> ProviderResult<Self> {
        Ok(Self::new(
            Arc::new(ReqwestTowerApi::new(request_timeout)?),
            options,
        ))
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.service = self.service.with_poll_interval(poll_interval);
        self
    }
}

#[async_trait]
impl ProviderAdapter for TowerAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AnsibleTower
    }

    async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle> {
        self.service.checkout(instance, request).await
    }

    async fn extend(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
        new_expiry: DateTime<Utc>,
    ) -> ProviderResult<()> {
        self.service.extend(instance, handle, new_expiry).await
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
        cursor: Option<&str>,
    ) -> ProviderResult<RecordPage> {
        self.service.list(instance, limit, cursor).await
    }
}
