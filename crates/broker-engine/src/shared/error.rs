use broker_core::{CoreError, ErrorResponse, ProviderKind};
use broker_providers::ProviderError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Checkout,
    Extend,
    Release,
    Status,
    List,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Checkout => "checkout",
            Operation::Extend => "extend",
            Operation::Release => "release",
            Operation::Status => "status",
            Operation::List => "list",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a failing adapter call was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub provider: ProviderKind,
    pub instance: String,
    pub operation: Operation,
    pub resource_id: Option<String>,
}

impl OperationContext {
    pub fn new(provider: ProviderKind, instance: impl Into<String>, operation: Operation) -> Self {
        Self {
            provider,
            instance: instance.into(),
            operation,
            resource_id: None,
        }
    }

    pub fn for_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    fn details(&self) -> HashMap<String, String> {
        let mut details = HashMap::new();
        details.insert("provider".to_string(), self.provider.to_string());
        details.insert("instance".to_string(), self.instance.clone());
        details.insert("operation".to_string(), self.operation.to_string());
        if let Some(id) = &self.resource_id {
            details.insert("resource_id".to_string(), id.clone());
        }
        details
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}/{}", self.operation, self.provider, self.instance)?;
        if let Some(id) = &self.resource_id {
            write!(f, " (resource {id})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] CoreError),
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
    #[error("Indeterminate outcome of {context}: {message}")]
    Indeterminate {
        context: OperationContext,
        message: String,
    },
    #[error("{context} failed: {source}")]
    Provider {
        context: OperationContext,
        #[source]
        source: ProviderError,
    },
    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    pub fn provider(context: OperationContext, source: ProviderError) -> Self {
        EngineError::Provider { context, source }
    }

    pub fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            EngineError::Provider { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.provider_error().is_some_and(ProviderError::is_transient)
    }
}

impl From<EngineError> for ErrorResponse {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match &err {
            EngineError::Configuration(core) => {
                let code = match core {
                    CoreError::NoDefault(_) => "NO_DEFAULT",
                    CoreError::AmbiguousDefault { .. } => "AMBIGUOUS_DEFAULT",
                    CoreError::InvalidParameters(_) => "INVALID_PARAMETERS",
                    CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
                    CoreError::InvalidFilter(_) => "INVALID_FILTER",
                    CoreError::Serialization(_) => "SERIALIZATION_ERROR",
                };
                ErrorResponse::new(code, message)
            }
            EngineError::UnknownProvider(_) => ErrorResponse::new("UNKNOWN_PROVIDER", message),
            EngineError::ResourceNotFound(_) => ErrorResponse::new("RESOURCE_NOT_FOUND", message),
            EngineError::Indeterminate { context, .. } => {
                ErrorResponse::new("INDETERMINATE", message).with_details(context.details())
            }
            EngineError::Provider { context, source } => {
                let mut details = context.details();
                details.insert("cause".to_string(), source.to_string());
                ErrorResponse::new(source.code(), message).with_details(details)
            }
            EngineError::Storage(_) => ErrorResponse::new("STORAGE_ERROR", message),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> OperationContext {
        OperationContext::new(ProviderKind::Container, "docker", Operation::Release)
            .for_resource("r-1")
    }

    #[test]
    fn test_context_display() {
        assert_eq!(
            context().to_string(),
            "release on Container/docker (resource r-1)"
        );
    }

    #[test]
    fn test_provider_error_carries_context_and_cause() {
        let err = EngineError::provider(
            context(),
            ProviderError::RateLimited("slow down".to_string()),
        );
        assert!(err.is_transient());
        assert!(err.to_string().contains("Container/docker"));

        let response: ErrorResponse = err.into();
        assert_eq!(response.error_code, "RATE_LIMITED");
        let details = response.details.unwrap();
        assert_eq!(details["provider"], "Container");
        assert_eq!(details["instance"], "docker");
        assert_eq!(details["operation"], "release");
        assert_eq!(details["resource_id"], "r-1");
        assert!(details["cause"].contains("slow down"));
    }

    #[test]
    fn test_configuration_error_codes() {
        let response: ErrorResponse =
            EngineError::from(CoreError::NoDefault("Beaker".to_string())).into();
        assert_eq!(response.error_code, "NO_DEFAULT");

        let response: ErrorResponse = EngineError::from(CoreError::AmbiguousDefault {
            provider: "Generic".to_string(),
            candidates: vec!["a".to_string(), "b".to_string()],
        })
        .into();
        assert_eq!(response.error_code, "AMBIGUOUS_DEFAULT");
        assert!(response.details.is_none());
    }

    #[test]
    fn test_indeterminate_response() {
        let err = EngineError::Indeterminate {
            context: OperationContext::new(ProviderKind::AnsibleTower, "production", Operation::Checkout),
            message: "timed out after 300s".to_string(),
        };
        assert!(!err.is_transient());
        let response: ErrorResponse = err.into();
        assert_eq!(response.error_code, "INDETERMINATE");
        assert_eq!(response.details.unwrap()["operation"], "checkout");
    }

    #[test]
    fn test_engine_result_type() {
        let ok: EngineResult<u32> = Ok(1);
        let err: EngineResult<u32> = Err(EngineError::ResourceNotFound("r-9".to_string()));
        assert!(ok.is_ok());
        assert_eq!(err.unwrap_err().to_string(), "Resource not found: r-9");
    }
}
