pub mod features;
pub mod generic_provider;
mod http;
pub mod paging;

use async_trait::async_trait;
use broker_core::{CoreError, InstanceConfig, ProviderKind, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use features::beaker_provider::BeakerAdapter;
pub use features::container_provider::ContainerAdapter;
pub use features::tower_provider::TowerAdapter;
pub use generic_provider::GenericAdapter;
pub use paging::{list_page, records, records_with};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Instance unreachable: {0}")]
    InstanceUnreachable(String),
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Unexpected provider response: {0}")]
    Backend(String),
}

impl ProviderError {
    /// Errors the caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout(_)
                | ProviderError::RateLimited(_)
                | ProviderError::InstanceUnreachable(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::AuthenticationFailed(_) => "AUTHENTICATION_FAILED",
            ProviderError::InstanceUnreachable(_) => "INSTANCE_UNREACHABLE",
            ProviderError::InvalidParameters(_) => "INVALID_PARAMETERS",
            ProviderError::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            ProviderError::RateLimited(_) => "RATE_LIMITED",
            ProviderError::Timeout(_) => "TIMEOUT",
            ProviderError::Backend(_) => "PROVIDER_BACKEND",
        }
    }
}

impl From<CoreError> for ProviderError {
    fn from(err: CoreError) -> Self {
        ProviderError::InvalidParameters(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Backend(format!("invalid provider payload: {err}"))
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Provider-side view of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Provisioning,
    Running,
    Stopped,
    /// The provider does not recognise the resource.
    Unknown,
}

impl RemoteStatus {
    pub fn is_present(self) -> bool {
        !matches!(self, RemoteStatus::Unknown)
    }
}

/// One provider-native resource as reported by `list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    /// Matches `ResourceHandle::reference_key` of a broker-owned resource.
    pub key: String,
    pub name: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl ProviderRecord {
    pub fn new(key: impl Into<String>, name: impl Into<String>, status: RemoteStatus) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            status,
            attributes: Map::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Map<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPage {
    pub records: Vec<ProviderRecord>,
    /// Opaque cursor for the following page; `None` on the last page.
    pub next_cursor: Option<String>,
}

impl RecordPage {
    pub fn last(records: Vec<ProviderRecord>) -> Self {
        Self {
            records,
            next_cursor: None,
        }
    }
}

/// Contract every provider backend implements. The engine only talks to
/// backends through this trait.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Whether a checkout may be retried blindly when its outcome is unknown.
    fn idempotent_checkout(&self) -> bool {
        false
    }

    /// Provisions a resource and returns a handle in the `Requested` state.
    async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle>;

    async fn extend(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
        new_expiry: DateTime<Utc>,
    ) -> ProviderResult<()>;

    /// Returns the resource. A resource that is already gone is not an error.
    async fn release(&self, instance: &InstanceConfig, handle: &ResourceHandle)
        -> ProviderResult<()>;

    /// Reports `RemoteStatus::Unknown` rather than failing for unrecognised handles.
    async fn status(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<RemoteStatus>;

    /// One page of at most `limit` records, starting after `cursor`.
    async fn list(
        &self,
        instance: &InstanceConfig,
        limit: usize,
        cursor: Option<&str>,
    ) -> ProviderResult<RecordPage>;
}
