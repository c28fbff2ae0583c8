use crate::shared::error::{EngineError, EngineResult};
use broker_core::CoreError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_INVENTORY_PATH: &str = "inventory.json";
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_RELEASE_ATTEMPTS: u32 = 5;

/// Daemon runtime settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub settings_path: PathBuf,
    pub inventory_path: PathBuf,
    /// Overrides the provider-derived expiry sweep interval.
    pub sweep_interval: Option<Duration>,
    pub reconcile_interval: Duration,
    pub max_release_attempts: u32,
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let settings_path = lookup("BROKER_SETTINGS")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                EngineError::Configuration(CoreError::InvalidParameters(
                    "BROKER_SETTINGS must point at the broker settings file".to_string(),
                ))
            })?;

        let inventory_path = lookup("BROKER_INVENTORY")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_INVENTORY_PATH));

        let sweep_interval = parse_positive(&lookup, "BROKER_SWEEP_INTERVAL_SECS")?
            .map(Duration::from_secs);
        let reconcile_interval = parse_positive(&lookup, "BROKER_RECONCILE_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONCILE_INTERVAL);
        let max_release_attempts = parse_positive(&lookup, "BROKER_MAX_RELEASE_ATTEMPTS")?
            .map(|n| {
                u32::try_from(n).map_err(|_| {
                    EngineError::Configuration(CoreError::InvalidParameters(format!(
                        "BROKER_MAX_RELEASE_ATTEMPTS must be at most {}, got {n}",
                        u32::MAX
                    )))
                })
            })
            .transpose()?
            .unwrap_or(DEFAULT_MAX_RELEASE_ATTEMPTS);

        Ok(Self {
            settings_path,
            inventory_path,
            sweep_interval,
            reconcile_interval,
            max_release_attempts,
        })
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> EngineResult<Option<u64>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|value| *value > 0)
            .map(Some)
            .ok_or_else(|| {
                EngineError::Configuration(CoreError::InvalidParameters(format!(
                    "{key} must be a positive integer, got '{raw}'"
                )))
            }),
    }
}
