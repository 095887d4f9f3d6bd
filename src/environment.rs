//! Process-wide services shared by every component: resolver, buffer pool, public suffix list,
//! and the root cancellation token.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;
use publicsuffix::{List, Psl};
use tokio_util::sync::CancellationToken;

use crate::buf::BufferPool;
use crate::resolver::{CachingResolver, NativeResolver, Resolver};

// Used when no list file is configured. Covers the suffixes that most commonly matter for
// grouping hosts by site.
const FALLBACK_SUFFIXES: &str = "// ===BEGIN ICANN DOMAINS===
com
net
org
edu
gov
io
dev
app
info
biz
co
me
tv
cn
com.cn
net.cn
org.cn
jp
co.jp
ne.jp
uk
co.uk
org.uk
ac.uk
de
fr
ru
br
com.br
au
com.au
in
co.in
kr
co.kr
hk
com.hk
tw
com.tw
sg
com.sg
// ===END ICANN DOMAINS===
";

#[derive(Debug, Clone, Default)]
pub struct EnvironmentSettings {
    pub public_suffix_list: Option<String>,
    pub low_memory: bool,
}

pub struct Environment {
    resolver: Arc<dyn Resolver>,
    pool: Arc<BufferPool>,
    public_suffixes: RwLock<Arc<List>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("resolver", &self.resolver)
            .field("pool", &self.pool)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

fn fallback_list() -> List {
    List::from_bytes(FALLBACK_SUFFIXES.as_bytes()).unwrap_or_default()
}

impl Environment {
    pub fn new(resolver: Arc<dyn Resolver>) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            pool: BufferPool::new(),
            public_suffixes: RwLock::new(Arc::new(fallback_list())),
            cancel: CancellationToken::new(),
        })
    }

    /// An environment with the system resolver behind a small cache.
    pub fn native() -> Arc<Self> {
        Self::new(Arc::new(CachingResolver::new(Arc::new(NativeResolver::new()))))
    }

    /// Applies settings that may change on config reload.
    pub async fn reload(&self, settings: &EnvironmentSettings) -> std::io::Result<()> {
        self.pool.set_low_memory(settings.low_memory);
        let list = match settings.public_suffix_list.as_deref() {
            Some(path) => load_public_suffix_list(Path::new(path)).await?,
            None => fallback_list(),
        };
        *self.public_suffixes.write() = Arc::new(list);
        Ok(())
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// A token cancelled when the environment closes.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The registrable domain of `host`, e.g. `example.co.uk` for `www.example.co.uk`.
    pub fn effective_tld_plus_one(&self, host: &str) -> Option<String> {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let list = self.public_suffixes.read().clone();
        let domain = list.domain(host.as_bytes())?;
        String::from_utf8(domain.as_bytes().to_vec()).ok()
    }
}

async fn load_public_suffix_list(path: &Path) -> std::io::Result<List> {
    let data = tokio::fs::read(path).await.map_err(|e| {
        std::io::Error::new(
            e.kind(),
            format!("failed to read public suffix list {}: {e}", path.display()),
        )
    })?;
    match List::from_bytes(&data) {
        Ok(list) => {
            info!("[Environment] loaded public suffix list from {}", path.display());
            Ok(list)
        }
        Err(e) => {
            warn!("[Environment] invalid public suffix list {}: {e}", path.display());
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid public suffix list {}: {e}", path.display()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_tld_plus_one() {
        let env = Environment::native();
        assert_eq!(
            env.effective_tld_plus_one("www.example.co.uk").as_deref(),
            Some("example.co.uk")
        );
        assert_eq!(
            env.effective_tld_plus_one("a.b.Example.COM.").as_deref(),
            Some("example.com")
        );
        assert_eq!(env.effective_tld_plus_one("com"), None);
    }

    #[tokio::test]
    async fn test_reload_sets_low_memory() {
        let env = Environment::native();
        env.reload(&EnvironmentSettings {
            public_suffix_list: None,
            low_memory: true,
        })
        .await
        .unwrap();
        assert!(env.pool().is_low_memory());
        env.close();
        assert!(env.child_token().is_cancelled());
    }
}
