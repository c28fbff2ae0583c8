pub mod locks;
pub mod registry;

use crate::features::inventory::repo::InventoryRepository;
use crate::shared::error::{EngineError, EngineResult, Operation, OperationContext};
use crate::shared::retry::{ignore_not_found, RetryPolicy};
use crate::shared::types::{ExpiryAction, ReclaimOutcome, ReleaseOutcome, ReleaseSelection};
use broker_core::{
    CoreError, EventRecorder, Filter, LifecycleEvent, LifecycleEventKind, ProviderKind,
    ProviderOptions, ResourceHandle, ResourceState, WorkflowRequest,
};
use broker_providers::{
    list_page, records_with, ProviderError, ProviderRecord, ProviderResult, RemoteStatus,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::BoxStream;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use locks::HandleLocks;
use registry::{ProviderRegistry, ResolvedProvider};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    /// Retries for transient errors inside one engine operation. Also drives
    /// the delay before the expiry path retries a failed release.
    pub retry: RetryPolicy,
    /// Per adapter call when neither the request nor the provider sets one.
    pub default_deadline: Duration,
    /// Failed expiry releases tolerated before a handle is orphaned.
    pub max_release_attempts: u32,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_deadline: DEFAULT_DEADLINE,
            max_release_attempts: 5,
        }
    }
}

/// Drives checkout, extend and release across adapters and keeps the
/// inventory in step with what the providers confirmed.
pub struct LifecycleEngine {
    registry: Arc<ProviderRegistry>,
    inventory: Arc<dyn InventoryRepository>,
    locks: HandleLocks,
    events: Mutex<EventRecorder>,
    policy: LifecyclePolicy,
}

impl LifecycleEngine {
    pub fn new(registry: Arc<ProviderRegistry>, inventory: Arc<dyn InventoryRepository>) -> Self {
        Self::with_policy(registry, inventory, LifecyclePolicy::default())
    }

    pub fn with_policy(
        registry: Arc<ProviderRegistry>,
        inventory: Arc<dyn InventoryRepository>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            registry,
            inventory,
            locks: HandleLocks::new(),
            events: Mutex::new(EventRecorder::new()),
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    /// Provisions a resource and records it as `Active`.
    ///
    /// Transient failures are retried only for adapters whose checkout is
    /// idempotent. Otherwise a checkout that times out is reported as
    /// `Indeterminate`: the resource may exist remotely without a handle.
    pub async fn checkout(
        &self,
        provider: ProviderKind,
        instance: Option<&str>,
        request: WorkflowRequest,
    ) -> EngineResult<ResourceHandle> {
        let resolved = self.registry.resolve(provider, instance)?;
        let deadline = self.deadline(Some(&request), &resolved.options)?;
        let lease = request
            .expire_offset()?
            .or(resolved.options.new_expire_time);
        let context =
            OperationContext::new(provider, resolved.instance.name.clone(), Operation::Checkout);

        let idempotent = resolved.adapter.idempotent_checkout();
        let retry = if idempotent {
            self.policy.retry.clone()
        } else {
            RetryPolicy::none()
        };

        let adapter = resolved.adapter.clone();
        let result = retry
            .run(Operation::Checkout.as_str(), |_| {
                with_deadline(deadline, adapter.checkout(&resolved.instance, &request))
            })
            .await;

        let mut handle = match result {
            Ok(handle) => handle,
            Err(ProviderError::Timeout(message)) if !idempotent => {
                warn!(
                    provider = %provider,
                    instance = %resolved.instance.name,
                    workflow = %request.workflow(),
                    "Checkout outcome unknown, resource may exist remotely"
                );
                self.record(
                    LifecycleEvent::new(
                        LifecycleEventKind::Indeterminate,
                        provider,
                        resolved.instance.name.clone(),
                    )
                    .with_detail("workflow", request.workflow())
                    .with_detail("cause", message.clone()),
                );
                return Err(EngineError::Indeterminate { context, message });
            }
            Err(source) => {
                warn!(
                    provider = %provider,
                    instance = %resolved.instance.name,
                    error = %source,
                    "Checkout failed"
                );
                return Err(EngineError::provider(context, source));
            }
        };

        let now = Utc::now();
        handle.provider = provider;
        handle.instance = resolved.instance.name.clone();
        handle.created_at = now;
        handle.expires_at = match lease {
            Some(offset) => Some(offset.apply(now)?),
            None => None,
        };
        handle.request = Some(request);
        handle.transition(ResourceState::Active)?;

        if let Err(storage) = self.inventory.put(handle.clone()).await {
            error!(
                provider = %provider,
                instance = %handle.instance,
                reference_key = %handle.reference_key,
                error = %storage,
                "Checked out resource could not be recorded"
            );
            self.record(
                LifecycleEvent::new(LifecycleEventKind::Indeterminate, provider, handle.instance.clone())
                    .for_resource(handle.id.clone())
                    .with_detail("reference_key", handle.reference_key.clone())
                    .with_detail("cause", storage.to_string()),
            );
            return Err(storage);
        }

        info!(
            resource_id = %handle.id,
            provider = %provider,
            instance = %handle.instance,
            reference_key = %handle.reference_key,
            expires_at = ?handle.expires_at,
            "Resource checked out"
        );
        self.record(
            LifecycleEvent::new(LifecycleEventKind::CheckedOut, provider, handle.instance.clone())
                .for_resource(handle.id.clone())
                .with_detail("reference_key", handle.reference_key.clone()),
        );
        Ok(handle)
    }

    /// Pushes the expiry out by `delta`. On failure the stored handle keeps
    /// its previous expiry.
    pub async fn extend(&self, id: &str, delta: Duration) -> EngineResult<ResourceHandle> {
        let _guard = self.locks.acquire(id).await;
        let handle = self.load(id).await?;

        let mut working = handle.clone();
        working.transition(ResourceState::Extending)?;
        let new_expiry = handle.extended_expiry(delta, Utc::now())?;

        let resolved = self.registry.resolve(handle.provider, Some(&handle.instance))?;
        let deadline = self.deadline(handle.request.as_ref(), &resolved.options)?;
        let adapter = resolved.adapter.clone();

        self.policy
            .retry
            .run(Operation::Extend.as_str(), |_| {
                with_deadline(deadline, adapter.extend(&resolved.instance, &handle, new_expiry))
            })
            .await
            .map_err(|source| {
                warn!(resource_id = %id, error = %source, "Extend failed, keeping previous expiry");
                EngineError::provider(self.context(&handle, Operation::Extend), source)
            })?;

        working.expires_at = Some(new_expiry);
        working.transition(ResourceState::Active)?;
        self.inventory.put(working.clone()).await?;

        info!(resource_id = %id, expires_at = %new_expiry, "Resource extended");
        self.record(
            LifecycleEvent::new(LifecycleEventKind::Extended, handle.provider, handle.instance.clone())
                .for_resource(id)
                .with_detail("expires_at", new_expiry.to_rfc3339()),
        );
        Ok(working)
    }

    /// Returns the resource and drops the handle. Releasing a handle the
    /// inventory no longer holds succeeds without contacting any provider.
    pub async fn release(&self, id: &str) -> EngineResult<()> {
        let _guard = self.locks.acquire(id).await;
        match self.inventory.get(id).await? {
            Some(handle) => self.release_locked(handle).await,
            None => {
                debug!(resource_id = %id, "Release of unknown handle treated as done");
                Ok(())
            }
        }
    }

    pub async fn get(&self, id: &str) -> EngineResult<ResourceHandle> {
        self.load(id).await
    }

    /// Provider-side state of a stored handle.
    pub async fn status(&self, id: &str) -> EngineResult<RemoteStatus> {
        let handle = self.load(id).await?;
        self.remote_status(&handle).await
    }

    /// Snapshot of the inventory, optionally narrowed by a filter expression.
    pub async fn inventory(&self, filter: Option<&str>) -> EngineResult<Vec<ResourceHandle>> {
        let filter = filter.map(Filter::parse).transpose()?;
        let handles = self.inventory.list().await?;
        Ok(match filter {
            Some(filter) => handles
                .into_iter()
                .filter(|handle| filter.matches_handle(handle))
                .collect(),
            None => handles,
        })
    }

    /// Releases every selected handle. One failure does not stop the rest.
    pub async fn release_matching(
        &self,
        selection: ReleaseSelection,
    ) -> EngineResult<Vec<ReleaseOutcome>> {
        let ids: Vec<String> = match selection {
            ReleaseSelection::Ids(ids) => ids,
            ReleaseSelection::Filter(expression) => self
                .inventory(Some(&expression))
                .await?
                .into_iter()
                .map(|handle| handle.id)
                .collect(),
            ReleaseSelection::All => self
                .inventory(None)
                .await?
                .into_iter()
                .map(|handle| handle.id)
                .collect(),
        };

        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let error = self.release(&id).await.err().map(Into::into);
            ReleaseOutcome {
                resource_id: id,
                error,
            }
        }))
        .await;

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(total = outcomes.len(), failed, "Batch release finished");
        Ok(outcomes)
    }

    /// Checks out a new resource with the request that produced `id`.
    pub async fn duplicate(&self, id: &str) -> EngineResult<ResourceHandle> {
        let handle = self.load(id).await?;
        let request = handle.request.clone().ok_or_else(|| {
            CoreError::InvalidParameters(format!("resource {id} has no stored request to repeat"))
        })?;
        self.checkout(handle.provider, Some(&handle.instance), request)
            .await
    }

    /// Flags an `Active` handle whose provider-side resource cannot be confirmed.
    pub async fn mark_orphaned(&self, id: &str, reason: &str) -> EngineResult<ResourceHandle> {
        let _guard = self.locks.acquire(id).await;
        let handle = self.load(id).await?;
        self.orphan_locked(handle, reason).await
    }

    /// Events an operator still has to look at.
    pub fn attention(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .attention()
            .to_vec()
    }

    pub fn acknowledge(&self, id: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .acknowledge(id)
    }

    pub fn history(&self, id: &str) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events_for_resource(id)
            .cloned()
            .collect()
    }

    /// Expiry path for one handle: release it if it is due, reschedule on
    /// failure, orphan it once attempts are exhausted.
    pub async fn expire(&self, id: &str, now: DateTime<Utc>) -> EngineResult<ExpiryAction> {
        let _guard = self.locks.acquire(id).await;
        let Some(handle) = self.inventory.get(id).await? else {
            return Ok(ExpiryAction::Skipped);
        };
        if !handle.is_expired_at(now) || !handle.release_due_at(now) {
            return Ok(ExpiryAction::Skipped);
        }

        if handle.release_attempts >= self.policy.max_release_attempts {
            let reason = format!(
                "release failed {} times after expiry",
                handle.release_attempts
            );
            self.orphan_locked(handle, &reason).await?;
            return Ok(ExpiryAction::Orphaned);
        }

        info!(
            resource_id = %id,
            expires_at = ?handle.expires_at,
            attempt = handle.release_attempts + 1,
            "Releasing expired resource"
        );
        match self.release_locked(handle).await {
            Ok(()) => Ok(ExpiryAction::Released),
            Err(EngineError::Provider { .. }) => {
                let attempts = self
                    .inventory
                    .get(id)
                    .await?
                    .map(|h| h.release_attempts)
                    .unwrap_or_default();
                if attempts >= self.policy.max_release_attempts {
                    if let Some(handle) = self.inventory.get(id).await? {
                        let reason = format!("release failed {attempts} times after expiry");
                        self.orphan_locked(handle, &reason).await?;
                    }
                    Ok(ExpiryAction::Orphaned)
                } else {
                    Ok(ExpiryAction::Retrying { attempts })
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Orphans a handle the reconciler could not find remotely and tries to
    /// release it.
    pub async fn reclaim_missing(&self, id: &str) -> EngineResult<ReclaimOutcome> {
        let _guard = self.locks.acquire(id).await;
        let Some(mut handle) = self.inventory.get(id).await? else {
            return Ok(ReclaimOutcome::Gone);
        };

        // The listing can lag behind; only trust an explicit "unknown".
        let status = self.remote_status(&handle).await?;
        if status.is_present() {
            debug!(resource_id = %id, ?status, "Resource missing from listing but present remotely");
            return Ok(ReclaimOutcome::Present);
        }

        if handle.state == ResourceState::Active {
            handle = self
                .orphan_locked(handle, "not reported by provider")
                .await?;
        }
        match self.release_locked(handle).await {
            Ok(()) => Ok(ReclaimOutcome::Removed),
            Err(EngineError::Provider { source, .. }) => {
                warn!(resource_id = %id, error = %source, "Release of orphaned resource failed");
                Ok(ReclaimOutcome::Orphaned)
            }
            Err(other) => Err(other),
        }
    }

    /// Every record of one provider instance, fetched page by page. Each page
    /// is bounded by the provider deadline and retried on transient errors.
    pub fn remote_records<'a>(
        &'a self,
        resolved: &'a ResolvedProvider,
        limit: usize,
    ) -> BoxStream<'a, ProviderResult<ProviderRecord>> {
        let deadline = resolved
            .options
            .workflow_timeout
            .unwrap_or(self.policy.default_deadline);

        records_with(move |cursor| async move {
            self.policy
                .retry
                .run(Operation::List.as_str(), |_| {
                    with_deadline(
                        deadline,
                        list_page(
                            resolved.adapter.as_ref(),
                            &resolved.instance,
                            limit,
                            cursor.as_deref(),
                        ),
                    )
                })
                .await
        })
    }

    /// Records a provider resource without a handle. Each one is reported once.
    pub fn report_unknown(
        &self,
        provider: ProviderKind,
        instance: &str,
        record: &ProviderRecord,
    ) -> bool {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = events.attention().iter().any(|event| {
            event.kind == LifecycleEventKind::UnknownRemoteRecord
                && event.provider == provider
                && event.instance == instance
                && event.details.get("reference_key") == Some(&record.key)
        });
        if seen {
            return false;
        }
        warn!(
            provider = %provider,
            instance = %instance,
            reference_key = %record.key,
            name = %record.name,
            "Provider resource not tracked by the broker"
        );
        events.record(
            LifecycleEvent::new(LifecycleEventKind::UnknownRemoteRecord, provider, instance)
                .with_detail("reference_key", record.key.clone())
                .with_detail("name", record.name.clone()),
        );
        true
    }

    async fn release_locked(&self, mut handle: ResourceHandle) -> EngineResult<()> {
        let mut working = handle.clone();
        working.transition(ResourceState::Releasing)?;

        let resolved = self.registry.resolve(handle.provider, Some(&handle.instance))?;
        let deadline = self.deadline(handle.request.as_ref(), &resolved.options)?;
        let adapter = resolved.adapter.clone();

        let result = self
            .policy
            .retry
            .run(Operation::Release.as_str(), |_| {
                let call = adapter.release(&resolved.instance, &handle);
                async move { ignore_not_found(with_deadline(deadline, call).await) }
            })
            .await;

        match result {
            Ok(()) => {
                working.transition(ResourceState::Released)?;
                self.inventory.remove(&handle.id).await?;
                info!(
                    resource_id = %handle.id,
                    provider = %handle.provider,
                    instance = %handle.instance,
                    "Resource released"
                );
                self.record(
                    LifecycleEvent::new(
                        LifecycleEventKind::Released,
                        handle.provider,
                        handle.instance.clone(),
                    )
                    .for_resource(handle.id.clone()),
                );
                Ok(())
            }
            Err(source) => {
                let attempt = handle.release_attempts.saturating_add(1);
                let retry_at = chrono::Duration::from_std(self.policy.retry.delay_for(attempt))
                    .ok()
                    .and_then(|delay| Utc::now().checked_add_signed(delay))
                    .unwrap_or_else(Utc::now);
                handle.record_release_failure(retry_at);
                self.inventory.put(handle.clone()).await?;

                warn!(
                    resource_id = %handle.id,
                    attempts = handle.release_attempts,
                    next_attempt = %retry_at,
                    error = %source,
                    "Release failed"
                );
                self.record(
                    LifecycleEvent::new(
                        LifecycleEventKind::ReleaseFailed,
                        handle.provider,
                        handle.instance.clone(),
                    )
                    .for_resource(handle.id.clone())
                    .with_detail("cause", source.to_string()),
                );
                Err(EngineError::provider(
                    self.context(&handle, Operation::Release),
                    source,
                ))
            }
        }
    }

    async fn orphan_locked(
        &self,
        mut handle: ResourceHandle,
        reason: &str,
    ) -> EngineResult<ResourceHandle> {
        handle.transition(ResourceState::Orphaned)?;
        self.inventory.put(handle.clone()).await?;

        warn!(
            resource_id = %handle.id,
            provider = %handle.provider,
            instance = %handle.instance,
            reference_key = %handle.reference_key,
            %reason,
            "Resource orphaned"
        );
        self.record(
            LifecycleEvent::new(LifecycleEventKind::Orphaned, handle.provider, handle.instance.clone())
                .for_resource(handle.id.clone())
                .with_detail("reference_key", handle.reference_key.clone())
                .with_detail("reason", reason),
        );
        Ok(handle)
    }

    async fn remote_status(&self, handle: &ResourceHandle) -> EngineResult<RemoteStatus> {
        let resolved = self.registry.resolve(handle.provider, Some(&handle.instance))?;
        let deadline = self.deadline(handle.request.as_ref(), &resolved.options)?;
        let adapter = resolved.adapter.clone();

        self.policy
            .retry
            .run(Operation::Status.as_str(), |_| {
                with_deadline(deadline, adapter.status(&resolved.instance, handle))
            })
            .await
            .map_err(|source| EngineError::provider(self.context(handle, Operation::Status), source))
    }

    async fn load(&self, id: &str) -> EngineResult<ResourceHandle> {
        self.inventory
            .get(id)
            .await?
            .ok_or_else(|| EngineError::ResourceNotFound(id.to_string()))
    }

    /// Request `timeout`, else provider `workflow_timeout`, else the policy default.
    fn deadline(
        &self,
        request: Option<&WorkflowRequest>,
        options: &ProviderOptions,
    ) -> EngineResult<Duration> {
        let requested = match request {
            Some(request) => request.timeout()?,
            None => None,
        };
        Ok(requested
            .or(options.workflow_timeout)
            .unwrap_or(self.policy.default_deadline))
    }

    fn context(&self, handle: &ResourceHandle, operation: Operation) -> OperationContext {
        OperationContext::new(handle.provider, handle.instance.clone(), operation)
            .for_resource(handle.id.clone())
    }

    fn record(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(event);
    }
}

/// Aborts the remote call once `deadline` passes.
async fn with_deadline<T>(
    deadline: Duration,
    call: impl Future<Output = ProviderResult<T>>,
) -> ProviderResult<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "no response within {}s",
            deadline.as_secs_f64()
        ))),
    }
}
