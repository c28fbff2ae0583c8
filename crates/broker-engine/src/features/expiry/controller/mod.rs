use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::features::expiry::service::ExpiryService;
use crate::shared::error::EngineResult;
use crate::shared::types::SweepReport;

#[derive(Clone)]
pub struct ExpiryController {
    service: Arc<ExpiryService>,
    interval: Duration,
}

impl ExpiryController {
    pub fn new(service: Arc<ExpiryService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn spawn_periodic_sweep(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                match self.sweep_now().await {
                    Ok(report) if report.is_empty() => debug!("Expiry sweep found nothing to do"),
                    Ok(report) => info!(
                        released = report.released.len(),
                        retrying = report.retrying.len(),
                        orphaned = report.orphaned.len(),
                        failed = report.failed.len(),
                        "Expiry sweep finished"
                    ),
                    Err(error) => warn!(error = %error, "Expiry sweep failed"),
                }
            }
        })
    }

    pub async fn sweep_now(&self) -> EngineResult<SweepReport> {
        self.service.sweep(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::inventory::repo::{InMemoryInventoryRepository, InventoryRepository};
    use crate::features::lifecycle::service::registry::ProviderRegistry;
    use crate::features::lifecycle::service::LifecycleEngine;
    use broker_core::{InstanceConfig, ProviderConfig, ProviderKind, WorkflowRequest};
    use broker_providers::GenericAdapter;

    #[tokio::test]
    async fn test_periodic_sweep_releases_expired_handle() {
        let config = ProviderConfig::new(ProviderKind::Generic)
            .with_instance(InstanceConfig::new("test1").as_default());
        let registry = ProviderRegistry::new()
            .with_provider(config, Arc::new(GenericAdapter::new()))
            .unwrap();
        let inventory = Arc::new(InMemoryInventoryRepository::new());
        let engine = Arc::new(LifecycleEngine::new(Arc::new(registry), inventory.clone()));

        let handle = engine
            .checkout(ProviderKind::Generic, None, WorkflowRequest::new("deploy"))
            .await
            .unwrap();
        let mut expired = handle.clone();
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        inventory.put(expired).await.unwrap();

        let controller = Arc::new(ExpiryController::new(
            Arc::new(ExpiryService::new(engine)),
            Duration::from_millis(10),
        ));
        let task = controller.clone().spawn_periodic_sweep();

        let mut released = false;
        for _ in 0..50 {
            if inventory.get(&handle.id).await.unwrap().is_none() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();
        assert!(released);
    }
}
