pub mod features;
pub mod shared;

pub use features::expiry::controller::ExpiryController;
pub use features::expiry::service::ExpiryService;
pub use features::inventory::repo::{
    FileInventoryRepository, InMemoryInventoryRepository, InventoryRepository,
};
pub use features::lifecycle::controller::LifecycleController;
pub use features::lifecycle::service::registry::ProviderRegistry;
pub use features::lifecycle::service::{LifecycleEngine, LifecyclePolicy};
pub use features::reconcile::controller::ReconcileController;
pub use features::reconcile::service::ReconcileService;
pub use shared::config::EngineConfig;
pub use shared::error::{EngineError, EngineResult};
pub use shared::retry::RetryPolicy;
