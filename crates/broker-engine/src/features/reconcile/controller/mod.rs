use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::features::reconcile::service::ReconcileService;
use crate::shared::error::EngineResult;
use crate::shared::types::ReconcileReport;

#[derive(Clone)]
pub struct ReconcileController {
    service: Arc<ReconcileService>,
    interval: Duration,
}

impl ReconcileController {
    pub fn new(service: Arc<ReconcileService>, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub fn spawn_periodic_reconcile(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; give startup checkouts a full period.
            ticker.tick().await;
            loop {
                ticker.tick().await;

                let results = self.reconcile_now().await;
                let failed = results.iter().filter(|r| r.is_err()).count();
                debug!(instances = results.len(), failed, "Reconcile pass finished");
            }
        })
    }

    pub async fn reconcile_now(&self) -> Vec<EngineResult<ReconcileReport>> {
        self.service.reconcile_all().await
    }
}
