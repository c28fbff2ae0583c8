use crate::shared::error::{EngineError, EngineResult};
use broker_core::{BrokerSettings, CoreError, InstanceConfig, ProviderConfig, ProviderKind, ProviderOptions};
use broker_providers::ProviderAdapter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

struct RegisteredProvider {
    config: ProviderConfig,
    adapter: Arc<dyn ProviderAdapter>,
}

/// Adapter plus the effective instance a call should be made against.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub instance: InstanceConfig,
    pub options: ProviderOptions,
}

/// Maps provider kinds to their configuration and adapter. The engine never
/// sees a concrete adapter type.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderKind, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every configured provider with the adapter of the same kind.
    pub fn from_settings(
        settings: &BrokerSettings,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> EngineResult<Self> {
        let mut by_kind: BTreeMap<ProviderKind, Arc<dyn ProviderAdapter>> = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();

        let mut registry = Self::new();
        for (kind, config) in &settings.providers {
            let adapter = by_kind
                .remove(kind)
                .ok_or_else(|| EngineError::UnknownProvider(kind.to_string()))?;
            registry.register(config.clone(), adapter)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        config: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> EngineResult<()> {
        if adapter.kind() != config.kind {
            return Err(EngineError::Configuration(CoreError::InvalidParameters(
                format!(
                    "{} adapter cannot serve {} configuration",
                    adapter.kind(),
                    config.kind
                ),
            )));
        }
        config.validate()?;

        info!(
            provider = %config.kind,
            instances = config.instances.len(),
            "Provider registered"
        );
        self.providers
            .insert(config.kind, RegisteredProvider { config, adapter });
        Ok(())
    }

    pub fn with_provider(
        mut self,
        config: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> EngineResult<Self> {
        self.register(config, adapter)?;
        Ok(self)
    }

    /// Runs instance selection. Fails before any adapter is touched.
    pub fn resolve(
        &self,
        kind: ProviderKind,
        instance: Option<&str>,
    ) -> EngineResult<ResolvedProvider> {
        let registered = self
            .providers
            .get(&kind)
            .ok_or_else(|| EngineError::UnknownProvider(kind.to_string()))?;
        let instance = registered.config.effective_instance(instance)?;
        Ok(ResolvedProvider {
            adapter: registered.adapter.clone(),
            instance,
            options: registered.config.options.clone(),
        })
    }

    pub fn options(&self, kind: ProviderKind) -> Option<&ProviderOptions> {
        self.providers.get(&kind).map(|p| &p.config.options)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ProviderKind> + '_ {
        self.providers.keys().copied()
    }

    /// Every declared instance of every provider, with effective settings.
    pub fn instances(&self) -> Vec<(ProviderKind, InstanceConfig)> {
        self.providers
            .iter()
            .flat_map(|(kind, registered)| {
                registered
                    .config
                    .effective_instances()
                    .into_iter()
                    .map(move |instance| (*kind, instance))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_providers::{ContainerAdapter, GenericAdapter};
    use proptest::prelude::*;

    fn generic(instances: Vec<InstanceConfig>) -> ProviderConfig {
        instances
            .into_iter()
            .fold(ProviderConfig::new(ProviderKind::Generic), ProviderConfig::with_instance)
    }

    #[test]
    fn test_resolve_default_and_named() {
        let registry = ProviderRegistry::new()
            .with_provider(
                generic(vec![
                    InstanceConfig::new("test1").as_default(),
                    InstanceConfig::new("test2"),
                ]),
                Arc::new(GenericAdapter::new()),
            )
            .unwrap();

        assert_eq!(
            registry.resolve(ProviderKind::Generic, None).unwrap().instance.name,
            "test1"
        );
        assert_eq!(
            registry
                .resolve(ProviderKind::Generic, Some("test2"))
                .unwrap()
                .instance
                .name,
            "test2"
        );
        assert!(matches!(
            registry.resolve(ProviderKind::Generic, Some("bad")),
            Err(EngineError::Configuration(CoreError::InvalidParameters(_)))
        ));
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.resolve(ProviderKind::Beaker, None),
            Err(EngineError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_mismatched_adapter_rejected() {
        let err = ProviderRegistry::new()
            .with_provider(
                generic(vec![InstanceConfig::new("test1").as_default()]),
                Arc::new(ContainerAdapter::docker(None).unwrap()),
            )
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_from_settings_requires_adapter_for_each_provider() {
        let settings = BrokerSettings::new()
            .with_provider(generic(vec![InstanceConfig::new("test1").as_default()]))
            .with_provider(ProviderConfig::new(ProviderKind::Beaker));

        let result = ProviderRegistry::from_settings(&settings, vec![Arc::new(GenericAdapter::new())]);
        assert!(matches!(result, Err(EngineError::UnknownProvider(_))));
    }

    #[test]
    fn test_instances_carry_provider_wide_settings() {
        let mut config = generic(vec![
            InstanceConfig::new("test1").as_default(),
            InstanceConfig::new("test2").with_setting("name_prefix", "own"),
        ]);
        config
            .options
            .extra
            .insert("name_prefix".to_string(), "shared".into());
        let registry = ProviderRegistry::new()
            .with_provider(config, Arc::new(GenericAdapter::new()))
            .unwrap();

        let instances = registry.instances();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].1.str_setting("name_prefix"), Some("shared"));
        assert_eq!(instances[1].1.str_setting("name_prefix"), Some("own"));
    }

    proptest! {
        // Exactly one default resolves; zero or several fail before any adapter call.
        #[test]
        fn prop_default_resolution(flags in proptest::collection::vec(any::<bool>(), 1..8)) {
            let instances: Vec<InstanceConfig> = flags
                .iter()
                .enumerate()
                .map(|(i, flag)| {
                    let instance = InstanceConfig::new(format!("i{i}"));
                    if *flag { instance.as_default() } else { instance }
                })
                .collect();
            let defaults = flags.iter().filter(|f| **f).count();
            let adapter = Arc::new(GenericAdapter::new());

            match ProviderRegistry::new().with_provider(generic(instances), adapter.clone()) {
                Ok(registry) => {
                    let resolved = registry.resolve(ProviderKind::Generic, None);
                    if defaults == 1 {
                        prop_assert!(resolved.is_ok());
                    } else {
                        prop_assert_eq!(defaults, 0);
                        let is_no_default = matches!(
                            resolved,
                            Err(EngineError::Configuration(CoreError::NoDefault(_)))
                        );
                        prop_assert!(is_no_default);
                    }
                }
                Err(err) => {
                    prop_assert!(defaults > 1);
                    let is_ambiguous = matches!(
                        err,
                        EngineError::Configuration(CoreError::AmbiguousDefault { .. })
                    );
                    prop_assert!(is_ambiguous);
                }
            }
            prop_assert_eq!(adapter.call_count(broker_providers::generic_provider::Verb::Checkout), 0);
        }
    }
}
