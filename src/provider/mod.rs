//! Sources of proxies for groups.

mod compatible;
mod file;
mod health_check;

pub use compatible::CompatibleProvider;
pub use file::{FileProvider, ProxyParser};
pub use health_check::{DEFAULT_TIMEOUT, HealthCheck, HealthCheckOptions};

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::Proxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleType {
    /// Proxies listed inline in the configuration.
    Compatible,
    File,
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleType::Compatible => f.write_str("Compatible"),
            VehicleType::File => f.write_str("File"),
        }
    }
}

#[async_trait]
pub trait ProxyProvider: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// A snapshot of the current proxies.
    fn proxies(&self) -> Vec<Arc<Proxy>>;

    /// Marks the provider as in use, which enables lazy health checks.
    fn touch(&self);

    async fn health_check(&self);

    /// Reloads the proxy list from its source.
    async fn update(&self) -> std::io::Result<()>;

    fn vehicle_type(&self) -> VehicleType;

    /// Loads the proxy list and starts periodic work.
    async fn initial(&self) -> std::io::Result<()>;

    fn close(&self);
}
