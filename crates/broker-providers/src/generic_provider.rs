use async_trait::async_trait;
use broker_core::{InstanceConfig, ProviderKind, ResourceHandle, WorkflowRequest};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::{
    ProviderAdapter, ProviderError, ProviderRecord, ProviderResult, RecordPage, RemoteStatus,
};

/// Adapter verbs, used to target injected faults and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Checkout,
    Extend,
    Release,
    Status,
    List,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedResource {
    pub instance: String,
    pub key: String,
    pub workflow: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Reference adapter backed by an in-process simulated provider.
///
/// Supports fault injection, artificial latency and out-of-band changes to
/// the remote side so engine behaviour can be exercised without a real backend.
pub struct GenericAdapter {
    resources: Arc<RwLock<BTreeMap<(String, String), SimulatedResource>>>,
    faults: Mutex<HashMap<Verb, VecDeque<ProviderError>>>,
    calls: Mutex<HashMap<Verb, usize>>,
    latency: Mutex<Option<Duration>>,
    counter: AtomicU64,
    idempotent: bool,
}

impl Default for GenericAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl GenericAdapter {
    pub fn new() -> Self {
        Self {
            resources: Arc::new(RwLock::new(BTreeMap::new())),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
            counter: AtomicU64::new(0),
            idempotent: false,
        }
    }

    /// Checkouts carrying an `idempotency_key` return the existing resource
    /// instead of provisioning a second one.
    pub fn idempotent() -> Self {
        Self {
            idempotent: true,
            ..Self::new()
        }
    }

    /// Queue an error returned by the next call to `verb`.
    pub fn inject_fault(&self, verb: Verb, error: ProviderError) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.entry(verb).or_default().push_back(error);
        }
    }

    /// Delay applied after the remote side effect, before the call returns.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    pub fn call_count(&self, verb: Verb) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&verb).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Deletes a resource behind the broker's back.
    pub fn remove_remote(&self, instance: &str, key: &str) -> ProviderResult<bool> {
        let mut resources = self.write()?;
        Ok(resources
            .remove(&(instance.to_string(), key.to_string()))
            .is_some())
    }

    /// Creates a resource the broker never checked out.
    pub fn insert_remote(&self, instance: &str, key: &str) -> ProviderResult<()> {
        let mut resources = self.write()?;
        resources.insert(
            (instance.to_string(), key.to_string()),
            SimulatedResource {
                instance: instance.to_string(),
                key: key.to_string(),
                workflow: "external".to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    pub fn remote(&self, instance: &str, key: &str) -> ProviderResult<Option<SimulatedResource>> {
        let resources = self.read()?;
        Ok(resources
            .get(&(instance.to_string(), key.to_string()))
            .cloned())
    }

    pub fn remote_count(&self, instance: &str) -> ProviderResult<usize> {
        let resources = self.read()?;
        Ok(resources.keys().filter(|(owner, _)| owner == instance).count())
    }

    fn read(
        &self,
    ) -> ProviderResult<std::sync::RwLockReadGuard<'_, BTreeMap<(String, String), SimulatedResource>>>
    {
        self.resources
            .read()
            .map_err(|_| ProviderError::Backend("Storage lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> ProviderResult<std::sync::RwLockWriteGuard<'_, BTreeMap<(String, String), SimulatedResource>>>
    {
        self.resources
            .write()
            .map_err(|_| ProviderError::Backend("Storage lock poisoned".to_string()))
    }

    fn enter(&self, verb: Verb, instance: &InstanceConfig) -> ProviderResult<()> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls.entry(verb).or_insert(0) += 1;
        }
        if instance.bool_setting("fail_auth").unwrap_or(false) {
            return Err(ProviderError::AuthenticationFailed(format!(
                "instance '{}' rejected credentials",
                instance.name
            )));
        }
        let fault = self
            .faults
            .lock()
            .ok()
            .and_then(|mut faults| faults.get_mut(&verb).and_then(VecDeque::pop_front));
        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn respond(&self) {
        let latency = self.latency.lock().ok().and_then(|slot| *slot);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ProviderAdapter for GenericAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Generic
    }

    fn idempotent_checkout(&self) -> bool {
        self.idempotent
    }

    async fn checkout(
        &self,
        instance: &InstanceConfig,
        request: &WorkflowRequest,
    ) -> ProviderResult<ResourceHandle> {
        self.enter(Verb::Checkout, instance)?;

        let key = match (self.idempotent, request.idempotency_key()) {
            (true, Some(key)) => key.to_string(),
            _ => {
                let prefix = instance.str_setting("name_prefix").unwrap_or("test");
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                format!("{prefix}-{n}")
            }
        };

        {
            let mut resources = self.write()?;
            resources
                .entry((instance.name.clone(), key.clone()))
                .or_insert_with(|| SimulatedResource {
                    instance: instance.name.clone(),
                    key: key.clone(),
                    workflow: request.workflow().to_string(),
                    expires_at: None,
                });
        }
        debug!(instance = %instance.name, %key, "Simulated resource provisioned");
        self.respond().await;

        Ok(
            ResourceHandle::new(ProviderKind::Generic, instance.name.clone(), key.clone())
                .with_reference(json!({
                    "name": key,
                    "workflow": request.workflow(),
                    "params": request.remote_params(),
                })),
        )
    }

    async fn extend(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
        new_expiry: DateTime<Utc>,
    ) -> ProviderResult<()> {
        self.enter(Verb::Extend, instance)?;
        {
            let mut resources = self.write()?;
            let resource = resources
                .get_mut(&(instance.name.clone(), handle.reference_key.clone()))
                .ok_or_else(|| ProviderError::ResourceNotFound(handle.reference_key.clone()))?;
            resource.expires_at = Some(new_expiry);
        }
        self.respond().await;
        Ok(())
    }

    async fn release(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<()> {
        self.enter(Verb::Release, instance)?;
        let removed = self.remove_remote(&instance.name, &handle.reference_key)?;
        if !removed {
            debug!(key = %handle.reference_key, "Simulated resource already gone");
        }
        self.respond().await;
        Ok(())
    }

    async fn status(
        &self,
        instance: &InstanceConfig,
        handle: &ResourceHandle,
    ) -> ProviderResult<RemoteStatus> {
        self.enter(Verb::Status, instance)?;
        let present = self.remote(&instance.name, &handle.reference_key)?.is_some();
        self.respond().await;
        Ok(if present {
            RemoteStatus::Running
        } else {
            RemoteStatus::Unknown
        })
    }

    async fn list(
        &self,
        instance: &InstanceConfig,
        limit: usize,
        cursor: Option<&str>,
    ) -> ProviderResult<RecordPage> {
        self.enter(Verb::List, instance)?;
        let page = {
            let resources = self.read()?;
            let mut matching = resources
                .values()
                .filter(|resource| resource.instance == instance.name)
                .filter(|resource| cursor.map_or(true, |after| resource.key.as_str() > after));

            let records: Vec<ProviderRecord> = matching
                .by_ref()
                .take(limit)
                .map(|resource| {
                    ProviderRecord::new(&resource.key, &resource.key, RemoteStatus::Running)
                })
                .collect();
            let more = matching.next().is_some();
            let next_cursor = if more {
                records.last().map(|record| record.key.clone())
            } else {
                None
            };
            RecordPage {
                records,
                next_cursor,
            }
        };
        self.respond().await;
        Ok(page)
    }
}
