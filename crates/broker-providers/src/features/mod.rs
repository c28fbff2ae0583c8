pub mod beaker_provider;
pub mod container_provider;
pub mod tower_provider;
