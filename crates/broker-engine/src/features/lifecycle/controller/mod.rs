use crate::features::lifecycle::service::LifecycleEngine;
use crate::shared::types::{
    CheckoutRequest, ErrorResponse, ExtendRequest, LifecycleEvent, ReleaseOutcome,
    ReleaseSelection, RemoteStatus, ResourceHandle,
};
use std::sync::Arc;
use tracing::info;

/// Operator-facing entry points. Thin wrapper that delegates to the engine
/// and turns engine errors into error responses.
#[derive(Clone)]
pub struct LifecycleController {
    engine: Arc<LifecycleEngine>,
}

impl LifecycleController {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }

    pub async fn checkout(&self, request: CheckoutRequest) -> Result<ResourceHandle, ErrorResponse> {
        info!(
            provider = %request.provider,
            instance = ?request.instance,
            workflow = %request.request.workflow(),
            "Received checkout request"
        );

        self.engine
            .checkout(request.provider, request.instance.as_deref(), request.request)
            .await
            .map_err(|e| e.into())
    }

    pub async fn extend(&self, request: ExtendRequest) -> Result<ResourceHandle, ErrorResponse> {
        info!(
            resource_id = %request.resource_id,
            delta_secs = request.delta_secs,
            "Received extend request"
        );

        self.engine
            .extend(&request.resource_id, request.delta())
            .await
            .map_err(|e| e.into())
    }

    pub async fn release(&self, resource_id: &str) -> Result<(), ErrorResponse> {
        info!(resource_id = %resource_id, "Received release request");

        self.engine.release(resource_id).await.map_err(|e| e.into())
    }

    pub async fn release_matching(
        &self,
        selection: ReleaseSelection,
    ) -> Result<Vec<ReleaseOutcome>, ErrorResponse> {
        info!(selection = ?selection, "Received batch release request");

        self.engine
            .release_matching(selection)
            .await
            .map_err(|e| e.into())
    }

    pub async fn get(&self, resource_id: &str) -> Result<ResourceHandle, ErrorResponse> {
        self.engine.get(resource_id).await.map_err(|e| e.into())
    }

    pub async fn status(&self, resource_id: &str) -> Result<RemoteStatus, ErrorResponse> {
        info!(resource_id = %resource_id, "Received status request");

        self.engine.status(resource_id).await.map_err(|e| e.into())
    }

    pub async fn inventory(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<ResourceHandle>, ErrorResponse> {
        info!(filter = ?filter, "Received inventory request");

        self.engine.inventory(filter).await.map_err(|e| e.into())
    }

    pub async fn duplicate(&self, resource_id: &str) -> Result<ResourceHandle, ErrorResponse> {
        info!(resource_id = %resource_id, "Received duplicate request");

        self.engine.duplicate(resource_id).await.map_err(|e| e.into())
    }

    pub async fn mark_orphaned(
        &self,
        resource_id: &str,
        reason: &str,
    ) -> Result<ResourceHandle, ErrorResponse> {
        info!(resource_id = %resource_id, %reason, "Received mark orphaned request");

        self.engine
            .mark_orphaned(resource_id, reason)
            .await
            .map_err(|e| e.into())
    }

    pub fn attention(&self) -> Vec<LifecycleEvent> {
        self.engine.attention()
    }

    pub fn acknowledge(&self, resource_id: &str) -> usize {
        info!(resource_id = %resource_id, "Acknowledging attention events");
        self.engine.acknowledge(resource_id)
    }
}
