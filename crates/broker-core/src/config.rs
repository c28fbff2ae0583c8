//! Provider configuration and instance selection.
//!
//! Settings are loaded from JSON shaped like
//!
//! ```json
//! {
//!   "providers": {
//!     "Container": {
//!       "instances": [{"docker": {"host": "http://localhost:2375", "default": true}}],
//!       "results_limit": 50
//!     }
//!   }
//! }
//! ```

use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderKind {
    AnsibleTower,
    Container,
    Beaker,
    #[serde(rename = "TestProvider", alias = "Generic")]
    Generic,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::AnsibleTower,
        ProviderKind::Container,
        ProviderKind::Beaker,
        ProviderKind::Generic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::AnsibleTower => "AnsibleTower",
            ProviderKind::Container => "Container",
            ProviderKind::Beaker => "Beaker",
            ProviderKind::Generic => "TestProvider",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AnsibleTower" => Ok(ProviderKind::AnsibleTower),
            "Container" => Ok(ProviderKind::Container),
            "Beaker" => Ok(ProviderKind::Beaker),
            "TestProvider" | "Generic" => Ok(ProviderKind::Generic),
            other => Err(CoreError::InvalidParameters(format!(
                "unknown provider '{other}'"
            ))),
        }
    }
}

/// Relative lease offset such as `+172800` (seconds) or `+48h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "String")]
pub struct ExpiryOffset(Duration);

impl ExpiryOffset {
    pub fn new(offset: Duration) -> Self {
        Self(offset)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(self) -> Duration {
        self.0
    }

    pub fn apply(self, from: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
        chrono::Duration::from_std(self.0)
            .ok()
            .and_then(|delta| from.checked_add_signed(delta))
            .ok_or_else(|| {
                CoreError::InvalidParameters(format!("expiry offset {self} overflows"))
            })
    }
}

impl fmt::Display for ExpiryOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0.as_secs())
    }
}

impl From<ExpiryOffset> for String {
    fn from(offset: ExpiryOffset) -> Self {
        offset.to_string()
    }
}

impl FromStr for ExpiryOffset {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.starts_with('-') {
            return Err(CoreError::InvalidParameters(format!(
                "expiry offset '{s}' must not be negative"
            )));
        }
        let body = trimmed.strip_prefix('+').unwrap_or(trimmed);
        parse_duration_str(body).map(ExpiryOffset)
    }
}

impl TryFrom<Value> for ExpiryOffset {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match &value {
            Value::String(s) => s.parse(),
            Value::Number(n) => n.as_u64().map(ExpiryOffset::from_secs).ok_or_else(|| {
                CoreError::InvalidParameters(format!("expiry offset {n} must be a positive integer"))
            }),
            other => Err(CoreError::InvalidParameters(format!(
                "expiry offset must be a string or integer, got {other}"
            ))),
        }
    }
}

fn parse_duration_str(s: &str) -> CoreResult<Duration> {
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s)
        .map_err(|e| CoreError::InvalidParameters(format!("invalid duration '{s}': {e}")))
}

/// Parses a duration given as integer seconds or a humantime string (`"24h"`).
pub fn parse_duration(value: &Value) -> CoreResult<Duration> {
    match value {
        Value::Number(n) => n.as_u64().map(Duration::from_secs).ok_or_else(|| {
            CoreError::InvalidParameters(format!("duration {n} must be a positive integer"))
        }),
        Value::String(s) => parse_duration_str(s.trim()),
        other => Err(CoreError::InvalidParameters(format!(
            "duration must be a string or integer, got {other}"
        ))),
    }
}

/// Deep-merges `overlay` on top of `base`. Null values on either side are dropped.
pub fn merge_settings(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged: Map<String, Value> = base
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for (key, value) in overlay {
        if value.is_null() {
            continue;
        }
        let next = match (merged.get(key), value) {
            (Some(Value::Object(left)), Value::Object(right)) => {
                Value::Object(merge_settings(left, right))
            }
            _ => value.clone(),
        };
        merged.insert(key.clone(), next);
    }

    merged
}

/// One named configuration profile of a provider. Settings are opaque to the
/// engine and validated lazily by the owning adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub settings: Map<String, Value>,
}

impl InstanceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: false,
            settings: Map::new(),
        }
    }

    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    fn from_raw(name: &str, raw: &Value) -> CoreResult<Self> {
        let mut settings = match raw {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(CoreError::InvalidParameters(format!(
                    "instance '{name}' settings must be an object, got {other}"
                )))
            }
        };

        let default = match settings.remove("default") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => flag,
            Some(other) => {
                return Err(CoreError::InvalidParameters(format!(
                    "instance '{name}' has non-boolean default flag {other}"
                )))
            }
        };

        Ok(Self {
            name: name.to_string(),
            default,
            settings,
        })
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn str_setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }

    pub fn bool_setting(&self, key: &str) -> Option<bool> {
        self.settings.get(key).and_then(Value::as_bool)
    }

    pub fn require_str(&self, key: &str) -> CoreResult<&str> {
        self.str_setting(key).ok_or_else(|| {
            CoreError::InvalidParameters(format!(
                "instance '{}' is missing required setting '{key}'",
                self.name
            ))
        })
    }
}

/// Provider-wide options shared by every instance of a provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderOptions {
    pub results_limit: Option<usize>,
    pub workflow_timeout: Option<Duration>,
    pub max_job_wait: Option<Duration>,
    pub new_expire_time: Option<ExpiryOffset>,
    pub release_workflow: Option<String>,
    pub extend_workflow: Option<String>,
    /// Every other provider-wide key, merged under each instance's settings.
    pub extra: Map<String, Value>,
}

impl ProviderOptions {
    fn from_map(mut raw: Map<String, Value>) -> CoreResult<Self> {
        let results_limit = match raw.remove("results_limit") {
            None | Some(Value::Null) => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .filter(|limit| *limit > 0)
                    .ok_or_else(|| {
                        CoreError::InvalidParameters(format!(
                            "results_limit must be a positive integer, got {value}"
                        ))
                    })? as usize,
            ),
        };
        let workflow_timeout = take_duration(&mut raw, "workflow_timeout")?;
        let max_job_wait = take_duration(&mut raw, "max_job_wait")?;
        let new_expire_time = match raw.remove("new_expire_time") {
            None | Some(Value::Null) => None,
            Some(value) => Some(ExpiryOffset::try_from(value)?),
        };
        let release_workflow = take_string(&mut raw, "release_workflow")?;
        let extend_workflow = take_string(&mut raw, "extend_workflow")?;

        Ok(Self {
            results_limit,
            workflow_timeout,
            max_job_wait,
            new_expire_time,
            release_workflow,
            extend_workflow,
            extra: raw,
        })
    }
}

fn take_duration(raw: &mut Map<String, Value>, key: &str) -> CoreResult<Option<Duration>> {
    match raw.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => parse_duration(&value)
            .map(Some)
            .map_err(|e| CoreError::InvalidParameters(format!("{key}: {e}"))),
    }
}

fn take_string(raw: &mut Map<String, Value>, key: &str) -> CoreResult<Option<String>> {
    match raw.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(CoreError::InvalidParameters(format!(
            "{key} must be a string, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub instances: Vec<InstanceConfig>,
    pub options: ProviderOptions,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            instances: Vec::new(),
            options: ProviderOptions::default(),
        }
    }

    pub fn with_instance(mut self, instance: InstanceConfig) -> Self {
        self.instances.push(instance);
        self
    }

    pub fn with_options(mut self, options: ProviderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn from_value(kind: ProviderKind, raw: &Value) -> CoreResult<Self> {
        let mut map = match raw {
            Value::Object(map) => map.clone(),
            other => {
                return Err(CoreError::InvalidParameters(format!(
                    "{kind} settings must be an object, got {other}"
                )))
            }
        };

        let instances = match map.remove("instances") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(named)) => named
                .iter()
                .map(|(name, settings)| InstanceConfig::from_raw(name, settings))
                .collect::<CoreResult<Vec<_>>>()?,
            Some(Value::Array(entries)) => {
                let mut instances = Vec::with_capacity(entries.len());
                for entry in entries {
                    let single = entry.as_object().filter(|m| m.len() == 1).ok_or_else(|| {
                        CoreError::InvalidParameters(format!(
                            "{kind} instance list entries must be single-key objects, got {entry}"
                        ))
                    })?;
                    for (name, settings) in single {
                        instances.push(InstanceConfig::from_raw(name, settings)?);
                    }
                }
                instances
            }
            Some(other) => {
                return Err(CoreError::InvalidParameters(format!(
                    "{kind} instances must be an object or a list, got {other}"
                )))
            }
        };

        Ok(Self {
            kind,
            instances,
            options: ProviderOptions::from_map(map)?,
        })
    }

    /// Load-time checks: unique instance names and at most one default.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen = std::collections::HashSet::new();
        for instance in &self.instances {
            if !seen.insert(instance.name.as_str()) {
                return Err(CoreError::InvalidParameters(format!(
                    "{} declares instance '{}' more than once",
                    self.kind, instance.name
                )));
            }
        }

        let defaults = self.default_names();
        if defaults.len() > 1 {
            return Err(CoreError::AmbiguousDefault {
                provider: self.kind.to_string(),
                candidates: defaults,
            });
        }
        Ok(())
    }

    fn default_names(&self) -> Vec<String> {
        self.instances
            .iter()
            .filter(|i| i.default)
            .map(|i| i.name.clone())
            .collect()
    }

    /// Resolves a named instance, or the single default one when no name is given.
    pub fn resolve_instance(&self, name: Option<&str>) -> CoreResult<&InstanceConfig> {
        if let Some(name) = name {
            return self
                .instances
                .iter()
                .find(|instance| instance.name == name)
                .ok_or_else(|| {
                    CoreError::InvalidParameters(format!(
                        "{} has no instance named '{name}'",
                        self.kind
                    ))
                });
        }

        let mut defaults = self.instances.iter().filter(|instance| instance.default);
        match (defaults.next(), defaults.next()) {
            (Some(single), None) => Ok(single),
            (None, _) => Err(CoreError::NoDefault(self.kind.to_string())),
            (Some(_), Some(_)) => Err(CoreError::AmbiguousDefault {
                provider: self.kind.to_string(),
                candidates: self.default_names(),
            }),
        }
    }

    /// Resolved instance with provider-wide extra settings merged underneath.
    pub fn effective_instance(&self, name: Option<&str>) -> CoreResult<InstanceConfig> {
        let instance = self.resolve_instance(name)?;
        Ok(InstanceConfig {
            name: instance.name.clone(),
            default: instance.default,
            settings: merge_settings(&self.options.extra, &instance.settings),
        })
    }

    /// Effective configuration of every declared instance.
    pub fn effective_instances(&self) -> Vec<InstanceConfig> {
        self.instances
            .iter()
            .map(|instance| InstanceConfig {
                name: instance.name.clone(),
                default: instance.default,
                settings: merge_settings(&self.options.extra, &instance.settings),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerSettings {
    pub providers: BTreeMap<ProviderKind, ProviderConfig>,
}

impl BrokerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, config: ProviderConfig) -> Self {
        self.providers.insert(config.kind, config);
        self
    }

    pub fn from_value(raw: &Value) -> CoreResult<Self> {
        let providers = raw
            .get("providers")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                CoreError::InvalidParameters("settings must contain a 'providers' object".into())
            })?;

        let mut settings = BrokerSettings::new();
        for (key, value) in providers {
            let kind: ProviderKind = key.parse()?;
            if settings.providers.contains_key(&kind) {
                return Err(CoreError::InvalidParameters(format!(
                    "provider '{key}' is configured more than once as {kind}"
                )));
            }
            settings = settings.with_provider(ProviderConfig::from_value(kind, value)?);
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json(json: &str) -> CoreResult<Self> {
        let raw: Value =
            serde_json::from_str(json).map_err(|e| CoreError::Serialization(e.to_string()))?;
        Self::from_value(&raw)
    }

    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Serialization(format!("failed to read {}: {e}", path.display()))
        })?;
        let settings = Self::from_json(&contents)?;
        debug!(
            path = %path.display(),
            providers = settings.providers.len(),
            "Broker settings loaded"
        );
        Ok(settings)
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.providers.values().try_for_each(ProviderConfig::validate)
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<&ProviderConfig> {
        self.providers.get(&kind)
    }
}
