use crate::config::ProviderKind;
use crate::workflow::WorkflowRequest;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a leased resource.
///
/// ```text
/// Requested -> Active <-> Extending
///    |          |  \
///    v          |   Orphaned -> Releasing
///  Failed       v
///            Releasing -> Released
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Requested,
    Active,
    Extending,
    Releasing,
    Released,
    Orphaned,
    Failed,
}

impl ResourceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Released | ResourceState::Failed)
    }

    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, next),
            (Requested, Active)
                | (Requested, Failed)
                | (Active, Extending)
                | (Extending, Active)
                | (Active, Releasing)
                | (Active, Orphaned)
                | (Orphaned, Releasing)
                | (Releasing, Released)
                | (Releasing, Active)
                | (Releasing, Orphaned)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceState::Requested => "requested",
            ResourceState::Active => "active",
            ResourceState::Extending => "extending",
            ResourceState::Releasing => "releasing",
            ResourceState::Released => "released",
            ResourceState::Orphaned => "orphaned",
            ResourceState::Failed => "failed",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The broker's view of one leased resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub id: String,
    pub provider: ProviderKind,
    pub instance: String,
    pub created_at: DateTime<Utc>,
    /// `None` means the resource never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
    pub state: ResourceState,
    /// Provider-native identifier: VM name, container id, job id.
    pub reference_key: String,
    /// Extra provider-specific data needed to address the resource again.
    #[serde(default)]
    pub reference: Value,
    #[serde(default)]
    pub release_attempts: u32,
    #[serde(default)]
    pub next_release_at: Option<DateTime<Utc>>,
    /// Request that produced this resource, kept so it can be duplicated.
    #[serde(default)]
    pub request: Option<WorkflowRequest>,
}

impl ResourceHandle {
    pub fn new(
        provider: ProviderKind,
        instance: impl Into<String>,
        reference_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider,
            instance: instance.into(),
            created_at: Utc::now(),
            expires_at: None,
            state: ResourceState::Requested,
            reference_key: reference_key.into(),
            reference: Value::Null,
            release_attempts: 0,
            next_release_at: None,
            request: None,
        }
    }

    pub fn with_reference(mut self, reference: Value) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn transition(&mut self, next: ResourceState) -> CoreResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                resource_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Active and past its deadline. Handles without a deadline never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ResourceState::Active
            && self.expires_at.is_some_and(|deadline| deadline <= now)
    }

    /// Expiry after extending by `delta`. Never earlier than the current expiry.
    /// A handle without an expiry has nothing to extend.
    pub fn extended_expiry(
        &self,
        delta: std::time::Duration,
        now: DateTime<Utc>,
    ) -> CoreResult<DateTime<Utc>> {
        if delta.is_zero() {
            return Err(CoreError::InvalidParameters(
                "extension delta must be positive".to_string(),
            ));
        }
        let current = self.expires_at.ok_or_else(|| {
            CoreError::InvalidParameters(format!(
                "resource {} does not expire and cannot be extended",
                self.id
            ))
        })?;
        crate::config::ExpiryOffset::new(delta).apply(current.max(now))
    }

    pub fn record_release_failure(&mut self, retry_at: DateTime<Utc>) {
        self.release_attempts = self.release_attempts.saturating_add(1);
        self.next_release_at = Some(retry_at);
    }

    pub fn release_due_at(&self, now: DateTime<Utc>) -> bool {
        self.next_release_at.map_or(true, |at| at <= now)
    }
}
