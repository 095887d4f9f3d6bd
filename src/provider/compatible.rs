use std::sync::Arc;

use async_trait::async_trait;

use super::{HealthCheck, ProxyProvider, VehicleType};
use crate::adapter::Proxy;

/// A fixed list of proxies.
#[derive(Debug)]
pub struct CompatibleProvider {
    name: String,
    proxies: Vec<Arc<Proxy>>,
    health_check: Arc<HealthCheck>,
}

impl CompatibleProvider {
    pub fn new(
        name: String,
        proxies: Vec<Arc<Proxy>>,
        health_check: Arc<HealthCheck>,
    ) -> std::io::Result<Self> {
        if proxies.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("provider {name} has no proxies"),
            ));
        }
        health_check.set_proxies(proxies.clone());
        Ok(Self {
            name,
            proxies,
            health_check,
        })
    }
}

#[async_trait]
impl ProxyProvider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.clone()
    }

    fn touch(&self) {
        self.health_check.touch();
    }

    async fn health_check(&self) {
        self.health_check.check().await;
    }

    async fn update(&self) -> std::io::Result<()> {
        Ok(())
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Compatible
    }

    async fn initial(&self) -> std::io::Result<()> {
        self.health_check.start();
        Ok(())
    }

    fn close(&self) {
        self.health_check.close();
    }
}
