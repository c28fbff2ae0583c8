use crate::features::lifecycle::service::LifecycleEngine;
use crate::shared::error::{EngineError, EngineResult, Operation, OperationContext};
use crate::shared::types::{ReclaimOutcome, ReconcileReport};
use broker_core::{InstanceConfig, ProviderKind, ResourceState};
use futures::future::join_all;
use futures::TryStreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Page size used when a provider does not configure `results_limit`.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Diffs the inventory against what each provider instance reports.
pub struct ReconcileService {
    engine: Arc<LifecycleEngine>,
}

impl ReconcileService {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }

    /// Reconciles every configured instance in parallel. An instance that
    /// cannot be listed is logged and skipped; the others still run.
    pub async fn reconcile_all(&self) -> Vec<EngineResult<ReconcileReport>> {
        let instances = self.engine.registry().instances();
        let results = join_all(
            instances
                .iter()
                .map(|(kind, instance)| self.reconcile_instance(*kind, instance)),
        )
        .await;

        for ((kind, instance), result) in instances.iter().zip(&results) {
            match result {
                Ok(report) if report.has_drift() || report.has_failures() => info!(
                    provider = %kind,
                    instance = %instance.name,
                    listed = report.listed,
                    orphaned = report.orphaned.len(),
                    removed = report.removed.len(),
                    unknown = report.unknown.len(),
                    failed = report.failed.len(),
                    "Inventory drift found"
                ),
                Ok(_) => {}
                Err(error) => warn!(
                    provider = %kind,
                    instance = %instance.name,
                    error = %error,
                    "Reconcile failed"
                ),
            }
        }
        results
    }

    /// Reconciles one (provider, instance) pair.
    ///
    /// The full listing is drained before anything changes, so a listing
    /// that fails halfway never orphans a handle. A handle that cannot be
    /// examined is reported as failed and the pass moves on.
    pub async fn reconcile_instance(
        &self,
        kind: ProviderKind,
        instance: &InstanceConfig,
    ) -> EngineResult<ReconcileReport> {
        let resolved = self.engine.registry().resolve(kind, Some(&instance.name))?;
        let limit = resolved.options.results_limit.unwrap_or(DEFAULT_PAGE_SIZE);

        let listed: Vec<_> = self
            .engine
            .remote_records(&resolved, limit)
            .try_collect()
            .await
            .map_err(|source| {
                EngineError::provider(
                    OperationContext::new(kind, instance.name.clone(), Operation::List),
                    source,
                )
            })?;

        let mut report = ReconcileReport::new(kind, instance.name.clone());
        report.listed = listed.len();
        let remote_keys: HashSet<&str> = listed.iter().map(|r| r.key.as_str()).collect();

        let handles: Vec<_> = self
            .engine
            .inventory(None)
            .await?
            .into_iter()
            .filter(|h| h.provider == kind && h.instance == instance.name)
            .collect();
        let local_keys: HashSet<&str> = handles.iter().map(|h| h.reference_key.as_str()).collect();

        for handle in handles
            .iter()
            .filter(|h| matches!(h.state, ResourceState::Active | ResourceState::Orphaned))
            .filter(|h| !remote_keys.contains(h.reference_key.as_str()))
        {
            match self.engine.reclaim_missing(&handle.id).await {
                Ok(ReclaimOutcome::Removed) => {
                    report.orphaned.push(handle.id.clone());
                    report.removed.push(handle.id.clone());
                }
                Ok(ReclaimOutcome::Orphaned) => report.orphaned.push(handle.id.clone()),
                Ok(ReclaimOutcome::Present | ReclaimOutcome::Gone) => {}
                Err(error) => {
                    warn!(
                        resource_id = %handle.id,
                        reference_key = %handle.reference_key,
                        error = %error,
                        "Missing resource could not be examined"
                    );
                    report.failed.push(handle.id.clone());
                }
            }
        }

        for record in listed
            .iter()
            .filter(|r| !local_keys.contains(r.key.as_str()))
        {
            self.engine.report_unknown(kind, &instance.name, record);
            report.unknown.push(record.key.clone());
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::inventory::repo::{InMemoryInventoryRepository, InventoryRepository};
    use crate::features::lifecycle::service::registry::ProviderRegistry;
    use crate::features::lifecycle::service::LifecyclePolicy;
    use crate::shared::retry::RetryPolicy;
    use broker_core::{LifecycleEventKind, ProviderConfig, ProviderOptions, WorkflowRequest};
    use broker_providers::generic_provider::Verb;
    use broker_providers::{GenericAdapter, ProviderError};
    use std::time::{Duration, Instant};

    struct Fixture {
        service: ReconcileService,
        engine: Arc<LifecycleEngine>,
        adapter: Arc<GenericAdapter>,
        inventory: Arc<InMemoryInventoryRepository>,
    }

    fn fixture(results_limit: Option<usize>) -> Fixture {
        fixture_with_policy(results_limit, LifecyclePolicy::default())
    }

    fn fixture_with_policy(results_limit: Option<usize>, policy: LifecyclePolicy) -> Fixture {
        let adapter = Arc::new(GenericAdapter::new());
        let config = ProviderConfig::new(ProviderKind::Generic)
            .with_instance(InstanceConfig::new("test1").as_default())
            .with_instance(InstanceConfig::new("test2"))
            .with_options(ProviderOptions {
                results_limit,
                ..Default::default()
            });
        let registry = ProviderRegistry::new()
            .with_provider(config, adapter.clone())
            .unwrap();
        let inventory = Arc::new(InMemoryInventoryRepository::new());
        let engine = Arc::new(LifecycleEngine::with_policy(
            Arc::new(registry),
            inventory.clone(),
            policy,
        ));
        Fixture {
            service: ReconcileService::new(engine.clone()),
            engine,
            adapter,
            inventory,
        }
    }

    async fn checkout(f: &Fixture, instance: &str) -> broker_core::ResourceHandle {
        f.engine
            .checkout(
                ProviderKind::Generic,
                Some(instance),
                WorkflowRequest::new("deploy"),
            )
            .await
            .unwrap()
    }

    fn test1() -> InstanceConfig {
        InstanceConfig::new("test1").as_default()
    }

    #[tokio::test]
    async fn test_no_drift() {
        let f = fixture(None);
        checkout(&f, "test1").await;
        checkout(&f, "test1").await;

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.listed, 2);
        assert!(!report.has_drift());
    }

    #[tokio::test]
    async fn test_missing_resource_is_orphaned_and_removed() {
        let f = fixture(None);
        let kept = checkout(&f, "test1").await;
        let lost = checkout(&f, "test1").await;
        f.adapter.remove_remote("test1", &lost.reference_key).unwrap();

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.orphaned, vec![lost.id.clone()]);
        assert_eq!(report.removed, vec![lost.id.clone()]);
        assert!(f.inventory.get(&lost.id).await.unwrap().is_none());
        assert!(f.inventory.get(&kept.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_release_keeps_orphaned_handle() {
        let f = fixture(None);
        let lost = checkout(&f, "test1").await;
        f.adapter.remove_remote("test1", &lost.reference_key).unwrap();
        f.adapter
            .inject_fault(Verb::Release, ProviderError::AuthenticationFailed("denied".into()));

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.orphaned, vec![lost.id.clone()]);
        assert!(report.removed.is_empty());

        let stored = f.inventory.get(&lost.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ResourceState::Orphaned);

        // The next pass retries the release.
        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.removed, vec![lost.id.clone()]);
    }

    #[tokio::test]
    async fn test_unknown_records_reported_not_adopted() {
        let f = fixture(None);
        f.adapter.insert_remote("test1", "stray").unwrap();

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.unknown, vec!["stray".to_string()]);
        assert!(f.inventory.list().await.unwrap().is_empty());
        assert_eq!(f.adapter.remote_count("test1").unwrap(), 1);

        f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        let unknown: Vec<_> = f
            .engine
            .attention()
            .into_iter()
            .filter(|e| e.kind == LifecycleEventKind::UnknownRemoteRecord)
            .collect();
        assert_eq!(unknown.len(), 1);
    }

    #[tokio::test]
    async fn test_listing_failure_orphans_nothing() {
        let f = fixture(Some(2));
        let handles = [
            checkout(&f, "test1").await,
            checkout(&f, "test1").await,
            checkout(&f, "test1").await,
        ];
        f.adapter
            .inject_fault(Verb::List, ProviderError::Backend("boom".into()));

        let result = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await;
        assert!(matches!(result, Err(EngineError::Provider { .. })));
        for handle in &handles {
            assert_eq!(
                f.inventory.get(&handle.id).await.unwrap().unwrap().state,
                ResourceState::Active
            );
        }
    }

    fn fast_policy() -> LifecyclePolicy {
        LifecyclePolicy {
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            default_deadline: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hung_listing_is_cut_off_at_deadline() {
        let f = fixture_with_policy(None, fast_policy());
        let handle = checkout(&f, "test1").await;
        f.adapter.set_latency(Some(Duration::from_secs(3)));

        let started = Instant::now();
        let result = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        match result {
            Err(EngineError::Provider { context, source }) => {
                assert_eq!(context.operation, Operation::List);
                assert!(matches!(source, ProviderError::Timeout(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Both attempts timed out; nothing was orphaned.
        assert_eq!(f.adapter.call_count(Verb::List), 2);
        assert_eq!(
            f.inventory.get(&handle.id).await.unwrap().unwrap().state,
            ResourceState::Active
        );
    }

    #[tokio::test]
    async fn test_transient_listing_error_is_retried() {
        let f = fixture_with_policy(None, fast_policy());
        checkout(&f, "test1").await;
        f.adapter
            .inject_fault(Verb::List, ProviderError::RateLimited("slow down".into()));

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.listed, 1);
        assert!(!report.has_drift());
        assert_eq!(f.adapter.call_count(Verb::List), 2);
    }

    #[tokio::test]
    async fn test_failed_status_does_not_stop_the_pass() {
        let f = fixture(None);
        let first = checkout(&f, "test1").await;
        let second = checkout(&f, "test1").await;
        f.adapter.remove_remote("test1", &first.reference_key).unwrap();
        f.adapter.remove_remote("test1", &second.reference_key).unwrap();
        f.adapter.insert_remote("test1", "stray").unwrap();
        f.adapter
            .inject_fault(Verb::Status, ProviderError::AuthenticationFailed("denied".into()));

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.removed.len(), 1);
        assert_ne!(report.failed[0], report.removed[0]);
        assert_eq!(report.unknown, vec!["stray".to_string()]);
        assert!(f
            .engine
            .attention()
            .iter()
            .any(|e| e.kind == LifecycleEventKind::UnknownRemoteRecord));

        let remaining = f.inventory.list().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, report.failed[0]);
        assert_eq!(remaining[0].state, ResourceState::Active);

        // The next pass picks up the handle that failed.
        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.removed.len(), 1);
        assert!(f.inventory.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paged_listing_sees_every_record() {
        let f = fixture(Some(2));
        for _ in 0..5 {
            checkout(&f, "test1").await;
        }

        let report = f.service.reconcile_instance(ProviderKind::Generic, &test1()).await.unwrap();
        assert_eq!(report.listed, 5);
        assert!(!report.has_drift());
        assert_eq!(f.adapter.call_count(Verb::List), 3);
    }

    #[tokio::test]
    async fn test_reconcile_all_covers_every_instance() {
        let f = fixture(None);
        let lost = checkout(&f, "test2").await;
        f.adapter.remove_remote("test2", &lost.reference_key).unwrap();
        f.adapter.insert_remote("test1", "stray").unwrap();

        let reports: Vec<_> = f
            .service
            .reconcile_all()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(reports.len(), 2);
        let test1 = reports.iter().find(|r| r.instance == "test1").unwrap();
        let test2 = reports.iter().find(|r| r.instance == "test2").unwrap();
        assert_eq!(test1.unknown, vec!["stray".to_string()]);
        assert_eq!(test2.removed, vec![lost.id]);
    }
}
