use broker_core::{BrokerSettings, ProviderKind};
use broker_engine::features::expiry::service::sweep_interval;
use broker_engine::{
    EngineConfig, ExpiryController, ExpiryService, FileInventoryRepository, LifecycleEngine,
    LifecyclePolicy, ProviderRegistry, ReconcileController, ReconcileService, RetryPolicy,
};
use broker_providers::{BeakerAdapter, ContainerAdapter, GenericAdapter, ProviderAdapter, TowerAdapter};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("broker_engine=info,info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = EngineConfig::from_env()?;
    info!(
        settings = %config.settings_path.display(),
        inventory = %config.inventory_path.display(),
        "Starting resource broker"
    );

    let settings = BrokerSettings::load(&config.settings_path)?;
    let inventory = Arc::new(FileInventoryRepository::open(&config.inventory_path).await?);

    let tower_options = settings
        .provider(ProviderKind::AnsibleTower)
        .map(|provider| provider.options.clone())
        .unwrap_or_default();
    let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![
        Arc::new(GenericAdapter::new()),
        Arc::new(ContainerAdapter::docker(None)?),
        Arc::new(TowerAdapter::rest(tower_options, None)?),
        Arc::new(BeakerAdapter::bkr()),
    ];
    let registry = Arc::new(ProviderRegistry::from_settings(&settings, adapters)?);

    let policy = LifecyclePolicy {
        retry: RetryPolicy::default().with_jitter(),
        max_release_attempts: config.max_release_attempts,
        ..Default::default()
    };
    let engine = Arc::new(LifecycleEngine::with_policy(registry, inventory, policy));

    let expiry = Arc::new(ExpiryController::new(
        Arc::new(ExpiryService::new(engine.clone())),
        sweep_interval(&settings, config.sweep_interval),
    ));
    let reconcile = Arc::new(ReconcileController::new(
        Arc::new(ReconcileService::new(engine.clone())),
        config.reconcile_interval,
    ));

    info!(
        providers = ?engine.registry().kinds().collect::<Vec<_>>(),
        sweep_interval_secs = expiry.interval().as_secs(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        "Resource broker initialized successfully"
    );

    let expiry_task = expiry.spawn_periodic_sweep();
    let reconcile_task = reconcile.spawn_periodic_reconcile();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down resource broker");
    expiry_task.abort();
    reconcile_task.abort();

    Ok(())
}
