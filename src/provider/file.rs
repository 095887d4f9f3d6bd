use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{HealthCheck, ProxyProvider, VehicleType};
use crate::adapter::Proxy;

/// Builds proxies from the raw contents of a provider file.
pub type ProxyParser = Arc<dyn Fn(&[u8]) -> std::io::Result<Vec<Arc<Proxy>>> + Send + Sync>;

/// Proxies loaded from a local file, optionally reloaded every `interval`.
pub struct FileProvider {
    name: String,
    path: PathBuf,
    interval: Duration,
    parser: ProxyParser,
    proxies: RwLock<Vec<Arc<Proxy>>>,
    last_contents: Mutex<Option<Vec<u8>>>,
    health_check: Arc<HealthCheck>,
    cancel: CancellationToken,
    this: Weak<FileProvider>,
}

impl std::fmt::Debug for FileProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileProvider")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("interval", &self.interval)
            .finish()
    }
}

impl FileProvider {
    pub fn new(
        name: String,
        path: PathBuf,
        interval: Duration,
        parser: ProxyParser,
        health_check: Arc<HealthCheck>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            path,
            interval,
            parser,
            proxies: RwLock::new(Vec::new()),
            last_contents: Mutex::new(None),
            health_check,
            cancel: parent.child_token(),
            this: this.clone(),
        })
    }

    /// Returns whether the proxy list changed.
    async fn reload(&self) -> std::io::Result<bool> {
        let contents = tokio::fs::read(&self.path).await.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("failed to read provider {} at {}: {e}", self.name, self.path.display()),
            )
        })?;
        if self.last_contents.lock().as_deref() == Some(contents.as_slice()) {
            return Ok(false);
        }
        let proxies = (self.parser)(&contents)?;
        if proxies.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("provider {} file has no proxies", self.name),
            ));
        }
        info!("[Provider] {} loaded {} proxies", self.name, proxies.len());
        self.health_check.set_proxies(proxies.clone());
        *self.proxies.write() = proxies;
        *self.last_contents.lock() = Some(contents);
        Ok(true)
    }

    fn start_updates(&self) {
        if self.interval.is_zero() {
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.cancel.cancelled() => break,
                }
                match this.reload().await {
                    Ok(true) => this.health_check.check().await,
                    Ok(false) => {}
                    Err(e) => error!("[Provider] {} update failed: {e}", this.name),
                }
            }
        });
    }
}

#[async_trait]
impl ProxyProvider for FileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.read().clone()
    }

    fn touch(&self) {
        self.health_check.touch();
    }

    async fn health_check(&self) {
        self.health_check.check().await;
    }

    async fn update(&self) -> std::io::Result<()> {
        self.reload().await.map(|_| ())
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::File
    }

    async fn initial(&self) -> std::io::Result<()> {
        self.reload().await?;
        self.health_check.start();
        self.start_updates();
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
        self.health_check.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::MockAdapter;
    use crate::adapter::ProxyAdapter;
    use crate::provider::HealthCheckOptions;

    fn line_parser() -> ProxyParser {
        Arc::new(|contents: &[u8]| {
            let text = std::str::from_utf8(contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(text
                .lines()
                .filter(|line| !line.is_empty())
                .map(|line| Proxy::new(MockAdapter::new(line)))
                .collect())
        })
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("burrow-provider-{}-{name}", std::process::id()))
    }

    fn provider(path: PathBuf) -> Arc<FileProvider> {
        let hc = HealthCheck::new(Vec::new(), HealthCheckOptions::default(), &CancellationToken::new());
        FileProvider::new(
            "file".into(),
            path,
            Duration::ZERO,
            line_parser(),
            hc,
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_update_reloads_changed_file() {
        let path = temp_path("reload");
        tokio::fs::write(&path, "a\nb\n").await.unwrap();
        let provider = provider(path.clone());
        provider.initial().await.unwrap();
        let first = provider.proxies();
        assert_eq!(first.len(), 2);

        provider.update().await.unwrap();
        assert!(Arc::ptr_eq(&first[0], &provider.proxies()[0]));

        tokio::fs::write(&path, "c\n").await.unwrap();
        provider.update().await.unwrap();
        let names: Vec<_> = provider.proxies().iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["c"]);
        provider.close();
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_file_fails_initial() {
        let provider = provider(temp_path("missing"));
        let err = provider.initial().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
