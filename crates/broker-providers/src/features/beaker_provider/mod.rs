pub mod repo;
pub mod service;

use crate::{ProviderAdapter, ProviderResult, RecordPage, RemoteStatus};
use async_trait::async_trait;
use broker_core::{InstanceConfig, ProviderKind, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use repo::{BeakerCli, ProcessBeakerCli};
use service::BeakerProviderService;
use std::sync::Arc;
use std::time::Duration;

/// Default sweep interval for queue-style providers without `max_job_wait`.
pub const DEFAULT_MAX_JOB_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Beaker job-queue provider driven through the `bkr` client.
pub struct BeakerAdapter {
    service: BeakerProviderService,
}

impl BeakerAdapter {
    pub fn new(cli: Arc<dyn BeakerCli>) -> Self {
        Self {
            service: BeakerProviderService::new(cli),
        }
    }

    pub fn bkr() -> Self {
        Self::new(Arc::new(ProcessBeakerCli))
    }
}

#[async_trait]
impl ProviderAdapter for BeakerAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Beaker
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
