pub use broker_core::{
    ErrorResponse, LifecycleEvent, LifecycleEventKind, ProviderKind, ResourceHandle,
    ResourceState, WorkflowRequest,
};
pub use broker_providers::RemoteStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub provider: ProviderKind,
    /// Falls back to the provider's default instance.
    #[serde(default)]
    pub instance: Option<String>,
    pub request: WorkflowRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub resource_id: String,
    pub delta_secs: u64,
}

impl ExtendRequest {
    pub fn new(resource_id: impl Into<String>, delta: Duration) -> Self {
        Self {
            resource_id: resource_id.into(),
            delta_secs: delta.as_secs(),
        }
    }

    pub fn delta(&self) -> Duration {
        Duration::from_secs(self.delta_secs)
    }
}

/// Which handles a batch release targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseSelection {
    Ids(Vec<String>),
    /// Inventory filter expression, e.g. `provider=Container,instance=docker`.
    Filter(String),
    All,
}

/// Result of releasing one handle in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseOutcome {
    pub resource_id: String,
    pub error: Option<ErrorResponse>,
}

impl ReleaseOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// What the expiry path did with one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryAction {
    /// Not expired, already gone, or waiting out a release backoff.
    Skipped,
    Released,
    /// Release failed; another attempt is scheduled.
    Retrying { attempts: u32 },
    /// Release attempts are exhausted and the handle awaits an operator.
    Orphaned,
}

/// What happened to a handle the provider listing did not mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimOutcome {
    /// Status still reports the resource; the listing was stale.
    Present,
    /// Orphaned, but the release attempt failed so the handle is kept.
    Orphaned,
    /// Orphaned, released and removed from the inventory.
    Removed,
    /// The handle disappeared before it could be examined.
    Gone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub released: Vec<String>,
    pub retrying: Vec<String>,
    pub orphaned: Vec<String>,
    pub failed: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.retrying.is_empty()
            && self.orphaned.is_empty()
            && self.failed.is_empty()
    }
}

/// Drift found for one (provider, instance) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub provider: ProviderKind,
    pub instance: String,
    pub listed: usize,
    /// Handles confirmed missing on the provider and orphaned.
    pub orphaned: Vec<String>,
    /// Orphaned handles whose release succeeded and were removed.
    pub removed: Vec<String>,
    /// Provider records with no handle; reported, never adopted.
    pub unknown: Vec<String>,
    /// Missing handles that could not be examined this pass.
    #[serde(default)]
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn new(provider: ProviderKind, instance: impl Into<String>) -> Self {
        Self {
            provider,
            instance: instance.into(),
            listed: 0,
            orphaned: Vec::new(),
            removed: Vec::new(),
            unknown: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn has_drift(&self) -> bool {
        !self.orphaned.is_empty() || !self.unknown.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}
