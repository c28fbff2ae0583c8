use crate::features::tower_provider::repo::{TowerApi, TowerTarget};
use crate::{ProviderError, ProviderRecord, ProviderResult, RecordPage, RemoteStatus};
use broker_core::{InstanceConfig, ProviderKind, ProviderOptions, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_WORKFLOW_TIMEOUT: Duration = Duration::from_secs(3600);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct TowerProviderService {
    api: Arc<dyn TowerApi>,
    options: ProviderOptions,
    poll_interval: Duration,
}

impl TowerProviderService {
    pub fn new(api: Arc<dyn TowerApi>, options: ProviderOptions) -> Self {
        Self {
            api,
            options,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle> {
        let target = TowerTarget::from_instance(instance)?;
        let limit = request
            .timeout()?
            .or(self.options.workflow_timeout)
            .unwrap_or(DEFAULT_WORKFLOW_TIMEOUT);

        let job_id = self
            .run_workflow(&target, request.workflow(), &request.remote_params(), limit)
            .await?;
        let artifacts = self.api.artifacts(&target, job_id).await?;

        let vm_name = artifacts
            .get("vm_name")
            .or_else(|| artifacts.get("fqdn"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProviderError::Backend(format!(
                    "workflow job {job_id} finished without a vm_name or fqdn artifact"
                ))
            })?
            .to_string();

        info!(instance = %instance.name, job_id, vm = %vm_name, "Tower checkout complete");

        Ok(
            ResourceHandle::new(ProviderKind::AnsibleTower, instance.name.clone(), vm_name.clone())
                .with_reference(json!({
                    "name": vm_name,
                    "workflow": request.workflow(),
                    "job_id": job_id,
                    "artifacts": artifacts,
                })),
        )
    }

    pub async fn extend(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
        new_expiry: DateTime<Utc>,
    ) -> ProviderResult<()> {
        let target = TowerTarget::from_instance(instance)?;
        let workflow = self.options.extend_workflow.as_deref().ok_or_else(|| {
            ProviderError::InvalidParameters("AnsibleTower has no extend_workflow configured".into())
        })?;

        let offset = (new_expiry - Utc::now()).num_seconds().max(1);
        let mut extra_vars = Map::new();
        extra_vars.insert("target_vm".into(), Value::String(handle.reference_key.clone()));
        extra_vars.insert("new_expire_time".into(), Value::String(format!("+{offset}")));

        let limit = self.options.workflow_timeout.unwrap_or(DEFAULT_WORKFLOW_TIMEOUT);
        self.run_workflow(&target, workflow, &extra_vars, limit)
            .await
            .map(|_| ())
    }

    /// Hosts no longer in the inventory count as released already.
    pub async fn release(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<()> {
        let target = TowerTarget::from_instance(instance)?;
        let workflow = self.options.release_workflow.as_deref().ok_or_else(|| {
            ProviderError::InvalidParameters(
                "AnsibleTower has no release_workflow configured".into(),
            )
        })?;

        if self
            .api
            .find_host(&target, &handle.reference_key)
            .await?
            .is_none()
        {
            debug!(vm = %handle.reference_key, "Host already gone, nothing to release");
            return Ok(());
        }

        let mut extra_vars = Map::new();
        extra_vars.insert("source_vm".into(), Value::String(handle.reference_key.clone()));

        let limit = self.options.workflow_timeout.unwrap_or(DEFAULT_WORKFLOW_TIMEOUT);
        self.run_workflow(&target, workflow, &extra_vars, limit)
            .await
            .map(|_| ())
    }

    pub async fn status(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<RemoteStatus> {
        let target = TowerTarget::from_instance(instance)?;
        Ok(match self.api.find_host(&target, &handle.reference_key).await? {
            Some(host) if host.enabled => RemoteStatus::Running,
            Some(_) => RemoteStatus::Stopped,
            None => RemoteStatus::Unknown,
        })
    }

    /// Cursor is the next page number.
    pub async fn list(
        &self,
        instance: &InstanceConfig,
        limit: usize,
        cursor: Option<&str>,
    ) -> ProviderResult<RecordPage> {
        let target = TowerTarget::from_instance(instance)?;
        let page = match cursor {
            None => 1,
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                ProviderError::InvalidParameters(format!("invalid host page cursor '{raw}'"))
            })?,
        };

        let hosts = self.api.list_hosts(&target, limit, page).await?;
        let records = hosts
            .results
            .into_iter()
            .map(|host| {
                let status = if host.enabled {
                    RemoteStatus::Running
                } else {
                    RemoteStatus::Stopped
                };
                let mut attributes = Map::new();
                attributes.insert("host_id".into(), json!(host.id));
                attributes.insert("description".into(), Value::String(host.description));
                ProviderRecord::new(host.name.clone(), host.name, status)
                    .with_attributes(attributes)
            })
            .collect();

        Ok(RecordPage {
            records,
            next_cursor: hosts.next.map(|_| (page + 1).to_string()),
        })
    }

    /// Launches a workflow by template name and waits for it to finish.
    async fn run_workflow(
        &self,
        target: &TowerTarget,
        workflow: &str,
        extra_vars: &Map<String, Value>,
        limit: Duration,
    ) -> ProviderResult<u64> {
        let template = self
            .api
            .find_workflow(target, workflow)
            .await?
            .ok_or_else(|| {
                ProviderError::InvalidParameters(format!("workflow '{workflow}' not found"))
            })?;

        let job_id = self.api.launch_workflow(target, template, extra_vars).await?;
        info!(workflow = %workflow, job_id, "Workflow launched");

        let deadline = Instant::now() + limit;
        loop {
            let job = self.api.workflow_job(target, job_id).await?;
            if job.is_finished() {
                if job.succeeded() {
                    return Ok(job_id);
                }
                warn!(workflow = %workflow, job_id, status = %job.status, "Workflow did not succeed");
                return Err(ProviderError::Backend(format!(
                    "workflow '{workflow}' job {job_id} ended with status '{}'",
                    job.status
                )));
            }
            if Instant::now() >= deadline {
                return Err(ProviderError::Timeout(format!(
                    "workflow '{workflow}' job {job_id} still '{}' after {}s",
                    job.status,
                    limit.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
