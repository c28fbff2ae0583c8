pub mod expiry;
pub mod inventory;
pub mod lifecycle;
pub mod reconcile;
