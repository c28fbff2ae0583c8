pub mod config;
pub mod filter;
pub mod resource;
pub mod workflow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

pub use config::{
    merge_settings, BrokerSettings, ExpiryOffset, InstanceConfig, ProviderConfig,
    ProviderKind, ProviderOptions,
};
pub use filter::Filter;
pub use resource::{ResourceHandle, ResourceState};
pub use workflow::WorkflowRequest;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("No default instance configured for provider {0}")]
    NoDefault(String),
    #[error("Multiple default instances configured for provider {provider}: {}", candidates.join(", "))]
    AmbiguousDefault {
        provider: String,
        candidates: Vec<String>,
    },
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("Invalid state transition for {resource_id}: {from} -> {to}")]
    InvalidTransition {
        resource_id: String,
        from: ResourceState,
        to: ResourceState,
    },
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Configuration errors are raised before any remote call and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoreError::NoDefault(_)
                | CoreError::AmbiguousDefault { .. }
                | CoreError::InvalidParameters(_)
        )
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
    pub details: Option<HashMap<String, String>>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorResponse {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: HashMap<String, String>) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventKind {
    CheckedOut,
    Extended,
    Released,
    ReleaseFailed,
    Orphaned,
    Indeterminate,
    UnknownRemoteRecord,
}

impl LifecycleEventKind {
    /// Events an operator has to look at; these are never evicted from the recorder.
    pub fn requires_attention(self) -> bool {
        matches!(
            self,
            LifecycleEventKind::Orphaned
                | LifecycleEventKind::Indeterminate
                | LifecycleEventKind::UnknownRemoteRecord
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleEventKind,
    pub provider: ProviderKind,
    pub instance: String,
    pub resource_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: HashMap<String, String>,
}

impl LifecycleEvent {
    pub fn new(kind: LifecycleEventKind, provider: ProviderKind, instance: impl Into<String>) -> Self {
        Self {
            kind,
            provider,
            instance: instance.into(),
            resource_id: None,
            timestamp: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn for_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Records lifecycle events. Routine history is bounded, attention events are
/// kept until acknowledged.
#[derive(Debug)]
pub struct EventRecorder {
    history: VecDeque<LifecycleEvent>,
    attention: Vec<LifecycleEvent>,
    capacity: usize,
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            attention: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, event: LifecycleEvent) {
        if event.kind.requires_attention() {
            self.attention.push(event.clone());
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }

    pub fn history(&self) -> impl Iterator<Item = &LifecycleEvent> {
        self.history.iter()
    }

    pub fn attention(&self) -> &[LifecycleEvent] {
        &self.attention
    }

    pub fn events_for_resource<'a>(
        &'a self,
        resource_id: &'a str,
    ) -> impl Iterator<Item = &'a LifecycleEvent> + 'a {
        self.history
            .iter()
            .filter(move |event| event.resource_id.as_deref() == Some(resource_id))
    }

    /// Drops attention events for a resource once an operator has handled it.
    pub fn acknowledge(&mut self, resource_id: &str) -> usize {
        let before = self.attention.len();
        self.attention
            .retain(|event| event.resource_id.as_deref() != Some(resource_id));
        before - self.attention.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_display() {
        let err = CoreError::AmbiguousDefault {
            provider: "Container".to_string(),
            candidates: vec!["docker".to_string(), "remote".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Multiple default instances configured for provider Container: docker, remote"
        );
        assert!(CoreError::NoDefault("Beaker".to_string())
            .to_string()
            .contains("No default"));
    }

    #[test]
    fn test_configuration_errors_classified() {
        assert!(CoreError::NoDefault("x".to_string()).is_configuration());
        assert!(CoreError::InvalidParameters("x".to_string()).is_configuration());
        assert!(!CoreError::InvalidFilter("x".to_string()).is_configuration());
    }

    #[test]
    fn test_error_response_with_details() {
        let mut details = HashMap::new();
        details.insert("provider".to_string(), "Container".to_string());
        let response = ErrorResponse::new("TIMEOUT", "took too long").with_details(details);
        assert_eq!(response.error_code, "TIMEOUT");
        assert_eq!(
            response.details.unwrap().get("provider").map(String::as_str),
            Some("Container")
        );
    }

    #[test]
    fn test_recorder_keeps_attention_events_past_capacity() {
        let mut recorder = EventRecorder::with_capacity(2);
        recorder.record(
            LifecycleEvent::new(LifecycleEventKind::Orphaned, ProviderKind::Container, "docker")
                .for_resource("r-1"),
        );
        for _ in 0..5 {
            recorder.record(LifecycleEvent::new(
                LifecycleEventKind::CheckedOut,
                ProviderKind::Container,
                "docker",
            ));
        }

        assert_eq!(recorder.history().count(), 2);
        assert_eq!(recorder.attention().len(), 1);
        assert_eq!(recorder.attention()[0].resource_id.as_deref(), Some("r-1"));
    }

    #[test]
    fn test_recorder_acknowledge() {
        let mut recorder = EventRecorder::new();
        recorder.record(
            LifecycleEvent::new(LifecycleEventKind::Orphaned, ProviderKind::Beaker, "default")
                .for_resource("r-1"),
        );
        recorder.record(
            LifecycleEvent::new(LifecycleEventKind::Indeterminate, ProviderKind::Beaker, "default")
                .with_detail("workflow", "deploy"),
        );

        assert_eq!(recorder.acknowledge("r-1"), 1);
        assert_eq!(recorder.attention().len(), 1);
        assert_eq!(recorder.events_for_resource("r-1").count(), 1);
    }
}
