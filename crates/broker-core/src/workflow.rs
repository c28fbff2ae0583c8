use crate::config::{parse_duration, ExpiryOffset};
use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

pub const PARAM_TIMEOUT: &str = "timeout";
pub const PARAM_NEW_EXPIRE_TIME: &str = "new_expire_time";
pub const PARAM_RESULTS_LIMIT: &str = "results_limit";
pub const PARAM_IDEMPOTENCY_KEY: &str = "idempotency_key";

/// A named remote operation plus its parameters. Built once, then only read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    workflow: String,
    #[serde(default)]
    params: Map<String, Value>,
}

impl WorkflowRequest {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Caller-supplied deadline for each adapter call made on behalf of this request.
    pub fn timeout(&self) -> CoreResult<Option<Duration>> {
        self.param(PARAM_TIMEOUT)
            .filter(|value| !value.is_null())
            .map(parse_duration)
            .transpose()
    }

    /// Lease length overriding the provider's `new_expire_time`.
    pub fn expire_offset(&self) -> CoreResult<Option<ExpiryOffset>> {
        self.param(PARAM_NEW_EXPIRE_TIME)
            .filter(|value| !value.is_null())
            .map(|value| ExpiryOffset::try_from(value.clone()))
            .transpose()
    }

    pub fn results_limit(&self) -> CoreResult<Option<usize>> {
        match self.param(PARAM_RESULTS_LIMIT) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .filter(|limit| *limit > 0)
                .map(|limit| Some(limit as usize))
                .ok_or_else(|| {
                    CoreError::InvalidParameters(format!(
                        "results_limit must be a positive integer, got {value}"
                    ))
                }),
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.str_param(PARAM_IDEMPOTENCY_KEY)
    }

    /// Parameters with broker-only keys removed, suitable for passing to a remote workflow.
    pub fn remote_params(&self) -> Map<String, Value> {
        self.params
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    PARAM_TIMEOUT | PARAM_RESULTS_LIMIT | PARAM_IDEMPOTENCY_KEY
                )
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
