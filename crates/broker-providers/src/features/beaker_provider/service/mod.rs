use crate::features::beaker_provider::repo::{BeakerCli, BeakerHub};
use crate::{ProviderError, ProviderRecord, ProviderResult, RecordPage, RemoteStatus};
use broker_core::{InstanceConfig, ProviderKind, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub struct BeakerProviderService {
    cli: Arc<dyn BeakerCli>,
}

impl BeakerProviderService {
    pub fn new(cli: Arc<dyn BeakerCli>) -> Self {
        Self { cli }
    }

    pub async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle> {
        let job_xml = request.str_param("job_xml").ok_or_else(|| {
            ProviderError::InvalidParameters(
                "beaker checkout requires a 'job_xml' parameter".to_string(),
            )
        })?;
        let hub = BeakerHub::from_instance(instance);

        let stdout = self
            .cli
            .run(&hub, "job-submit", &[job_xml.to_string()])
            .await?
            .check("job-submit")?;
        let job_id = parse_submitted_job(&stdout).ok_or_else(|| {
            ProviderError::Backend(format!("no job id in job-submit output: {stdout}"))
        })?;

        info!(instance = %instance.name, %job_id, "Beaker job submitted");

        Ok(
            ResourceHandle::new(ProviderKind::Beaker, instance.name.clone(), job_id.clone())
                .with_reference(json!({
                    "job_id": job_id,
                    "job_xml": job_xml,
                    "workflow": request.workflow(),
                })),
        )
    }

    pub async fn extend(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
        new_expiry: DateTime<Utc>,
    ) -> ProviderResult<()> {
        let by = (new_expiry - Utc::now()).num_seconds().max(1);
        let hub = BeakerHub::from_instance(instance);
        let output = self
            .cli
            .run(
                &hub,
                "watchdog-extend",
                &[format!("--by={by}"), handle.reference_key.clone()],
            )
            .await?;
        if !output.success && is_missing(&output.stderr) {
            return Err(ProviderError::ResourceNotFound(handle.reference_key.clone()));
        }
        output.check("watchdog-extend").map(|_| ())
    }

    /// Jobs that already finished or no longer exist count as released.
    pub async fn release(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<()> {
        let hub = BeakerHub::from_instance(instance);
        let output = self
            .cli
            .run(&hub, "job-cancel", &[handle.reference_key.clone()])
            .await?;
        if !output.success && (is_missing(&output.stderr) || is_finished(&output.stderr)) {
            debug!(job_id = %handle.reference_key, "Beaker job already finished");
            return Ok(());
        }
        output.check("job-cancel").map(|_| ())
    }

    pub async fn status(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<RemoteStatus> {
        let hub = BeakerHub::from_instance(instance);
        let output = self
            .cli
            .run(&hub, "job-results", &[handle.reference_key.clone()])
            .await?;
        if !output.success && is_missing(&output.stderr) {
            return Ok(RemoteStatus::Unknown);
        }
        let stdout = output.check("job-results")?;
        let status = parse_job_status(&stdout).ok_or_else(|| {
            ProviderError::Backend(format!(
                "no job status in job-results for {}",
                handle.reference_key
            ))
        })?;
        Ok(map_status(status))
    }

    /// Unfinished jobs owned by the configured user, oldest first. The
    /// cursor is the numeric id of the last job already returned.
    pub async fn list(
        &self,
        instance: &InstanceConfig,
        limit: usize,
        cursor: Option<&str>,
    ) -> ProviderResult<RecordPage> {
        let hub = BeakerHub::from_instance(instance);
        let mut args = vec![
            "--mine".to_string(),
            "--unfinished".to_string(),
            "--format=json".to_string(),
            format!("--limit={limit}"),
        ];
        if let Some(after) = cursor {
            let after: u64 = after.parse().map_err(|_| {
                ProviderError::InvalidParameters(format!("invalid job cursor '{after}'"))
            })?;
            args.push(format!("--min-id={}", after + 1));
        }

        let stdout = self
            .cli
            .run(&hub, "job-list", &args)
            .await?
            .check("job-list")?;
        let mut ids: Vec<u64> = if stdout.is_empty() {
            Vec::new()
        } else {
            let listed: Vec<String> = serde_json::from_str(&stdout)?;
            listed.iter().filter_map(|id| job_number(id)).collect()
        };
        ids.sort_unstable();
        ids.truncate(limit);

        let next_cursor = (ids.len() == limit)
            .then(|| ids.last().map(u64::to_string))
            .flatten();
        let records = ids
            .into_iter()
            .map(|id| {
                let key = format!("J:{id}");
                ProviderRecord::new(key.clone(), key, RemoteStatus::Running)
            })
            .collect();

        Ok(RecordPage {
            records,
            next_cursor,
        })
    }
}

/// `Submitted: ['J:1234']` -> `J:1234`
fn parse_submitted_job(stdout: &str) -> Option<String> {
    let start = stdout.find("J:")?;
    let digits: String = stdout[start + 2..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    (!digits.is_empty()).then(|| format!("J:{digits}"))
}

fn job_number(id: &str) -> Option<u64> {
    id.trim().strip_prefix("J:").unwrap_or(id.trim()).parse().ok()
}

/// Status attribute of the root `<job>` element of `job-results` XML.
fn parse_job_status(xml: &str) -> Option<&str> {
    let job = &xml[xml.find("<job")?..];
    let tag = &job[..job.find('>')?];
    let start = tag.find(" status=\"")? + " status=\"".len();
    let len = tag[start..].find('"')?;
    Some(&tag[start..start + len])
}

fn map_status(status: &str) -> RemoteStatus {
    match status {
        "Running" => RemoteStatus::Running,
        "New" | "Processed" | "Queued" | "Scheduled" | "Waiting" | "Installing" => {
            RemoteStatus::Provisioning
        }
        _ => RemoteStatus::Stopped,
    }
}

fn is_missing(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("not found") || lowered.contains("invalid job") || lowered.contains("no such")
}

fn is_finished(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("already finished")
        || lowered.contains("cannot cancel")
        || lowered.contains("is finished")
}
