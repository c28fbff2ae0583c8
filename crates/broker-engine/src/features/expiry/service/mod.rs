use crate::features::lifecycle::service::LifecycleEngine;
use crate::shared::error::EngineResult;
use crate::shared::types::{ExpiryAction, SweepReport};
use broker_core::{BrokerSettings, ProviderConfig, ProviderKind};
use broker_providers::features::beaker_provider::DEFAULT_MAX_JOB_WAIT;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between sweeps: the explicit override, else the shortest cadence
/// any configured provider needs. Queue-style providers sweep at their
/// `max_job_wait`, every other provider at [`DEFAULT_SWEEP_INTERVAL`].
pub fn sweep_interval(settings: &BrokerSettings, override_interval: Option<Duration>) -> Duration {
    if let Some(interval) = override_interval {
        return interval;
    }
    settings
        .providers
        .values()
        .map(provider_sweep_interval)
        .min()
        .unwrap_or(DEFAULT_SWEEP_INTERVAL)
}

fn provider_sweep_interval(config: &ProviderConfig) -> Duration {
    let wait = match (config.kind, config.options.max_job_wait) {
        (_, Some(wait)) => wait,
        (ProviderKind::Beaker, None) => DEFAULT_MAX_JOB_WAIT,
        _ => DEFAULT_SWEEP_INTERVAL,
    };
    if wait.is_zero() {
        DEFAULT_SWEEP_INTERVAL
    } else {
        wait
    }
}

pub struct ExpiryService {
    engine: Arc<LifecycleEngine>,
}

impl ExpiryService {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }

    /// Releases every `Active` handle whose expiry is at or before `now`.
    ///
    /// Handles are processed concurrently; each goes through the engine's
    /// per-handle lock, so a sweep never blocks on unrelated handles.
    pub async fn sweep(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let candidates: Vec<String> = self
            .engine
            .inventory(None)
            .await?
            .into_iter()
            .filter(|handle| handle.is_expired_at(now) && handle.release_due_at(now))
            .map(|handle| handle.id)
            .collect();

        if candidates.is_empty() {
            debug!("No expired resources");
            return Ok(SweepReport::default());
        }
        info!(candidates = candidates.len(), "Sweeping expired resources");

        let results = join_all(candidates.into_iter().map(|id| async move {
            let action = self.engine.expire(&id, now).await;
            (id, action)
        }))
        .await;

        let mut report = SweepReport::default();
        for (id, action) in results {
            match action {
                Ok(ExpiryAction::Released) => report.released.push(id),
                Ok(ExpiryAction::Retrying { .. }) => report.retrying.push(id),
                Ok(ExpiryAction::Orphaned) => report.orphaned.push(id),
                Ok(ExpiryAction::Skipped) => {}
                Err(error) => {
                    warn!(resource_id = %id, error = %error, "Expiry release failed");
                    report.failed.push(id);
                }
            }
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
    use broker_core::{
        ExpiryOffset, InstanceConfig, ProviderConfig, ProviderOptions, ResourceState,
        WorkflowRequest,
    };
    use broker_providers::generic_provider::Verb;
    use broker_providers::{GenericAdapter, ProviderError};
    use proptest::prelude::*;

    struct Fixture {
        service: ExpiryService,
        engine: Arc<LifecycleEngine>,
        adapter: Arc<GenericAdapter>,
        inventory: Arc<InMemoryInventoryRepository>,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(GenericAdapter::new());
        let config = ProviderConfig::new(ProviderKind::Generic)
            .with_instance(InstanceConfig::new("test1").as_default())
            .with_options(ProviderOptions {
                new_expire_time: Some(ExpiryOffset::from_secs(60)),
                ..Default::default()
            });
        let registry = ProviderRegistry::new()
            .with_provider(config, adapter.clone())
            .unwrap();
        let inventory = Arc::new(InMemoryInventoryRepository::new());
        let policy = LifecyclePolicy {
            retry: RetryPolicy::new(1, Duration::from_secs(30), Duration::from_secs(30)),
            max_release_attempts: 3,
            ..Default::default()
        };
        let engine = Arc::new(LifecycleEngine::with_policy(
            Arc::new(registry),
            inventory.clone(),
            policy,
        ));
        Fixture {
            service: ExpiryService::new(engine.clone()),
            engine,
            adapter,
            inventory,
        }
    }

    async fn checkout(f: &Fixture, lease_secs: Option<u64>) -> String {
        let mut request = WorkflowRequest::new("deploy");
        if let Some(secs) = lease_secs {
            request = request.with_param("new_expire_time", format!("+{secs}"));
        }
        f.engine
            .checkout(ProviderKind::Generic, None, request)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_sweep_releases_only_expired() {
        let f = fixture();
        let short = checkout(&f, Some(10)).await;
        let long = checkout(&f, Some(3600)).await;

        let report = f
            .service
            .sweep(Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        assert_eq!(report.released, vec![short.clone()]);
        assert!(f.inventory.get(&short).await.unwrap().is_none());
        assert!(f.inventory.get(&long).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_backs_off_then_orphans() {
        let f = fixture();
        let id = checkout(&f, Some(10)).await;
        for _ in 0..3 {
            f.adapter
                .inject_fault(Verb::Release, ProviderError::AuthenticationFailed("denied".into()));
        }

        let first = Utc::now() + chrono::Duration::seconds(20);
        let report = f.service.sweep(first).await.unwrap();
        assert_eq!(report.retrying, vec![id.clone()]);

        // Still inside the 30s backoff window.
        let report = f
            .service
            .sweep(first + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(report.is_empty());

        let later = first + chrono::Duration::hours(1);
        let report = f.service.sweep(later).await.unwrap();
        assert_eq!(report.retrying, vec![id.clone()]);
        let report = f
            .service
            .sweep(later + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.orphaned, vec![id.clone()]);

        let handle = f.inventory.get(&id).await.unwrap().unwrap();
        assert_eq!(handle.state, ResourceState::Orphaned);
        assert_eq!(handle.release_attempts, 3);

        // Orphaned handles are left for an operator.
        let report = f
            .service
            .sweep(later + chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_ignores_handles_without_expiry() {
        let f = fixture();
        let id = checkout(&f, None).await;
        let mut handle = f.inventory.get(&id).await.unwrap().unwrap();
        handle.expires_at = None;
        f.inventory.put(handle).await.unwrap();

        let report = f
            .service
            .sweep(Utc::now() + chrono::Duration::days(365))
            .await
            .unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn test_sweep_interval_sources() {
        assert_eq!(sweep_interval(&BrokerSettings::new(), None), DEFAULT_SWEEP_INTERVAL);

        let generic = ProviderConfig::new(ProviderKind::Generic)
            .with_instance(InstanceConfig::new("test1").as_default());
        let settings = BrokerSettings::new().with_provider(generic);
        assert_eq!(sweep_interval(&settings, None), DEFAULT_SWEEP_INTERVAL);

        let beaker_only = BrokerSettings::new().with_provider(ProviderConfig::new(ProviderKind::Beaker));
        assert_eq!(sweep_interval(&beaker_only, None), DEFAULT_MAX_JOB_WAIT);

        let tower = ProviderConfig::new(ProviderKind::AnsibleTower).with_options(ProviderOptions {
            max_job_wait: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let settings = beaker_only.with_provider(tower);
        assert_eq!(sweep_interval(&settings, None), Duration::from_secs(30));
        assert_eq!(
            sweep_interval(&settings, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_beaker_does_not_slow_down_other_providers() {
        let tower = ProviderConfig::new(ProviderKind::AnsibleTower).with_options(ProviderOptions {
            new_expire_time: Some(ExpiryOffset::from_secs(3600)),
            ..Default::default()
        });
        let settings = BrokerSettings::new()
            .with_provider(ProviderConfig::new(ProviderKind::Beaker))
            .with_provider(tower);
        assert_eq!(sweep_interval(&settings, None), DEFAULT_SWEEP_INTERVAL);

        let container = ProviderConfig::new(ProviderKind::Container);
        let settings = BrokerSettings::new()
            .with_provider(ProviderConfig::new(ProviderKind::Beaker))
            .with_provider(container);
        assert_eq!(sweep_interval(&settings, None), DEFAULT_SWEEP_INTERVAL);
    }

    proptest! {
        // A sweep never touches a handle whose expiry is still ahead of `now`.
        #[test]
        fn prop_sweep_never_releases_future_expiry(lease in 1u64..10_000, probe in 0u64..20_000) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(async {
                let f = fixture();
                let id = checkout(&f, Some(lease)).await;
                let handle = f.inventory.get(&id).await.unwrap().unwrap();
                let now = handle.created_at + chrono::Duration::seconds(probe as i64);

                let report = f.service.sweep(now).await.unwrap();
                let released = report.released.contains(&id);
                prop_assert_eq!(released, probe >= lease);
                prop_assert_eq!(f.inventory.get(&id).await.unwrap().is_none(), released);
                Ok(())
            })?;
        }
    }
}
