//! Turns a validated [`Config`] into proxies, groups, providers and routes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Direct, Http, MuxAdapter, Proxy, ProxyAdapter, Reject, Socks5, SystemDialer};
use crate::environment::{Environment, EnvironmentSettings};
use crate::group::{
    DEFAULT_MAX_FAILED_TIMES, Fallback, GroupBase, GroupOptions, LoadBalance, Relay, Selector,
    Strategy, UrlTest,
};
use crate::provider::{
    CompatibleProvider, FileProvider, HealthCheck, HealthCheckOptions, ProxyParser, ProxyProvider,
};
use crate::rule::{Matchers, RuleSet};
use crate::tunnel::{DEFAULT_UDP_TIMEOUT, Routes};

use super::types::{
    Config, GroupConfig, GroupKindConfig, HealthCheckConfig, InboundConfig, ProviderConfig,
    ProxyConfig, ProxyFile, ProxyProtocolConfig,
};
use super::validate::{VEHICLE_FILE, validate_auth, validate_config};

/// The runtime objects described by a configuration.
#[derive(Debug)]
pub struct LoadedConfig {
    pub inbounds: Vec<InboundConfig>,
    pub routes: Routes,
    /// Every provider, including the ones holding each group's own proxies. All of them need
    /// [`ProxyProvider::initial`] before use and [`ProxyProvider::close`] on shutdown.
    pub providers: Vec<Arc<dyn ProxyProvider>>,
    pub udp_timeout: Duration,
    pub settings: EnvironmentSettings,
}

pub fn build_config(
    config: Config,
    env: &Arc<Environment>,
    matchers: &Matchers,
    cancel: &CancellationToken,
) -> std::io::Result<LoadedConfig> {
    let group_order = validate_config(&config)?;
    let rules = RuleSet::parse(&config.rules, matchers)?;

    let mut proxies: HashMap<String, Arc<Proxy>> = HashMap::new();
    let dialer = SystemDialer::new(env.resolver().clone(), None);
    proxies.insert(
        "DIRECT".to_string(),
        Proxy::new(Arc::new(Direct::new("DIRECT", dialer))),
    );
    proxies.insert(
        "REJECT".to_string(),
        Proxy::new(Arc::new(Reject::new("REJECT"))),
    );
    for proxy_config in config.proxies.iter() {
        proxies.insert(proxy_config.name.clone(), build_proxy(proxy_config, env)?);
    }

    let mut providers: Vec<Arc<dyn ProxyProvider>> = vec![];
    let mut named_providers: HashMap<String, Arc<dyn ProxyProvider>> = HashMap::new();
    for provider_config in config.proxy_providers {
        let provider = build_provider(provider_config, env, cancel)?;
        named_providers.insert(provider.name().to_string(), provider.clone());
        providers.push(provider);
    }

    let mut groups: HashMap<String, GroupConfig> = config
        .proxy_groups
        .into_iter()
        .map(|group| (group.name.clone(), group))
        .collect();
    for name in group_order {
        let Some(group) = groups.remove(&name) else {
            continue;
        };
        let (proxy, own_provider) = build_group(group, &proxies, &named_providers, env, cancel)?;
        if let Some(provider) = own_provider {
            providers.push(provider);
        }
        proxies.insert(name, proxy);
    }

    let routes = Routes::new(rules, proxies)?;
    debug!(
        "[Config] built {} proxies and {} providers",
        routes.proxies().len(),
        providers.len()
    );

    Ok(LoadedConfig {
        inbounds: config.inbounds,
        routes,
        providers,
        udp_timeout: config
            .udp_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_UDP_TIMEOUT),
        settings: EnvironmentSettings {
            public_suffix_list: config
                .public_suffix_list
                .map(|path| path.to_string_lossy().into_owned()),
            low_memory: config.low_memory.unwrap_or(false),
        },
    })
}

fn auth_pair(username: &Option<String>, password: &Option<String>) -> Option<(String, String)> {
    match (username, password) {
        (Some(username), Some(password)) => Some((username.clone(), password.clone())),
        _ => None,
    }
}

pub fn build_proxy(config: &ProxyConfig, env: &Arc<Environment>) -> std::io::Result<Arc<Proxy>> {
    let dialer = SystemDialer::new(env.resolver().clone(), config.bind_interface.clone());
    let adapter: Arc<dyn ProxyAdapter> = match &config.protocol {
        ProxyProtocolConfig::Direct => Arc::new(Direct::new(&config.name, dialer)),
        ProxyProtocolConfig::Reject => Arc::new(Reject::new(&config.name)),
        ProxyProtocolConfig::Socks5 {
            server,
            username,
            password,
            udp,
        } => Arc::new(Socks5::new(
            &config.name,
            server.clone(),
            auth_pair(username, password),
            *udp,
            dialer,
        )),
        ProxyProtocolConfig::Http {
            server,
            username,
            password,
        } => Arc::new(Http::new(
            &config.name,
            server.clone(),
            auth_pair(username, password),
            dialer,
        )),
    };
    let adapter: Arc<dyn ProxyAdapter> = match &config.smux {
        Some(options) => Arc::new(MuxAdapter::new(adapter, options)?),
        None => adapter,
    };
    Ok(Proxy::new(adapter))
}

fn health_check_options(config: &HealthCheckConfig) -> HealthCheckOptions {
    HealthCheckOptions {
        url: config.url.clone(),
        interval: if config.enable {
            Duration::from_secs(config.interval)
        } else {
            Duration::ZERO
        },
        lazy: config.lazy,
        timeout: Duration::from_millis(config.timeout_ms),
    }
}

/// Parses the contents of a provider file into proxies.
fn proxy_file_parser(env: Arc<Environment>) -> ProxyParser {
    Arc::new(move |contents: &[u8]| {
        let file: ProxyFile = serde_yaml::from_slice(contents).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("could not parse provider file: {e}"),
            )
        })?;
        let mut names = std::collections::HashSet::new();
        let mut proxies = Vec::with_capacity(file.proxies.len());
        for proxy in file.proxies.iter() {
            if !names.insert(proxy.name.as_str()) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("provider file lists proxy {} twice", proxy.name),
                ));
            }
            validate_auth(&proxy.name, &proxy.protocol)?;
            proxies.push(build_proxy(proxy, &env)?);
        }
        Ok(proxies)
    })
}

fn build_provider(
    config: ProviderConfig,
    env: &Arc<Environment>,
    cancel: &CancellationToken,
) -> std::io::Result<Arc<dyn ProxyProvider>> {
    let options = health_check_options(&config.health_check);
    if config.vehicle == VEHICLE_FILE {
        let path = config.path.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("file provider {} needs a path", config.name),
            )
        })?;
        let health_check = HealthCheck::new(Vec::new(), options, cancel);
        return Ok(FileProvider::new(
            config.name,
            path,
            Duration::from_secs(config.interval),
            proxy_file_parser(env.clone()),
            health_check,
            cancel,
        ));
    }

    let proxies = config
        .proxies
        .iter()
        .map(|proxy| build_proxy(proxy, env))
        .collect::<std::io::Result<Vec<_>>>()?;
    let health_check = HealthCheck::new(proxies.clone(), options, cancel);
    Ok(Arc::new(CompatibleProvider::new(
        config.name,
        proxies,
        health_check,
    )?))
}

fn build_group(
    config: GroupConfig,
    proxies: &HashMap<String, Arc<Proxy>>,
    named_providers: &HashMap<String, Arc<dyn ProxyProvider>>,
    env: &Arc<Environment>,
    cancel: &CancellationToken,
) -> std::io::Result<(Arc<Proxy>, Option<Arc<dyn ProxyProvider>>)> {
    let members = config
        .proxies
        .iter()
        .map(|name| {
            proxies.get(name).cloned().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("proxy group {} references unknown proxy: {name}", config.name),
                )
            })
        })
        .collect::<std::io::Result<Vec<_>>>()?;

    let mut group_providers: Vec<Arc<dyn ProxyProvider>> = vec![];
    let own_provider = if members.is_empty() {
        None
    } else {
        let health_check = HealthCheck::new(
            members.clone(),
            HealthCheckOptions {
                url: config.url.clone(),
                interval: Duration::from_secs(config.interval),
                lazy: config.lazy,
                timeout: Duration::from_millis(config.timeout_ms),
            },
            cancel,
        );
        let provider: Arc<dyn ProxyProvider> = Arc::new(CompatibleProvider::new(
            config.name.clone(),
            members,
            health_check,
        )?);
        group_providers.push(provider.clone());
        Some(provider)
    };
    for name in config.providers.iter() {
        let provider = named_providers.get(name).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("proxy group {} uses unknown provider: {name}", config.name),
            )
        })?;
        group_providers.push(provider.clone());
    }

    let options = GroupOptions {
        name: config.name.clone(),
        test_url: config.url.clone(),
        max_failed_times: config
            .max_failed_times
            .map(|times| times as usize)
            .unwrap_or(DEFAULT_MAX_FAILED_TIMES),
        disable_udp: config.disable_udp,
        ..GroupOptions::new(&config.name)
    };
    let base = GroupBase::new(options, group_providers);
    let adapter: Arc<dyn ProxyAdapter> = match config.kind {
        GroupKindConfig::Select => Arc::new(Selector::new(base)),
        GroupKindConfig::Relay => Arc::new(Relay::new(
            base,
            SystemDialer::new(env.resolver().clone(), None),
        )),
        GroupKindConfig::LoadBalance { strategy } => {
            let strategy = match strategy {
                Some(name) => Strategy::from_name(&name)?,
                None => Strategy::ConsistentHashing,
            };
            Arc::new(LoadBalance::new(base, strategy, env.clone()))
        }
        GroupKindConfig::Fallback => Arc::new(Fallback::new(base)),
        GroupKindConfig::UrlTest { tolerance } => Arc::new(UrlTest::new(base, tolerance)),
    };
    Ok((Proxy::new(adapter), own_provider))
}
