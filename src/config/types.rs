use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::address::NetLocation;
use crate::adapter::DEFAULT_TEST_URL;
use crate::metadata::Network;
use crate::mux::{BrutalOptions, ClientOptions};
use crate::option_util::{NoneOrSome, OneOrSome};

fn default_true() -> bool {
    true
}

fn default_test_url() -> String {
    DEFAULT_TEST_URL.to_string()
}

fn default_health_check_timeout_ms() -> u64 {
    5000
}

fn default_tunnel_network() -> OneOrSome<Network> {
    OneOrSome::One(Network::Tcp)
}

/// One configuration file. Several files are merged in the order given.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, alias = "inbound")]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default, alias = "proxy")]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default, alias = "proxy_group")]
    pub proxy_groups: Vec<GroupConfig>,
    #[serde(default, alias = "proxy_provider")]
    pub proxy_providers: Vec<ProviderConfig>,
    #[serde(default, alias = "rule")]
    pub rules: Vec<String>,
    #[serde(default)]
    pub udp_timeout_secs: Option<u64>,
    #[serde(default)]
    pub public_suffix_list: Option<PathBuf>,
    #[serde(default)]
    pub low_memory: Option<bool>,
}

impl Config {
    /// Appends the lists of `other`; its scalar settings win when set.
    pub fn merge(&mut self, other: Config) {
        self.inbounds.extend(other.inbounds);
        self.proxies.extend(other.proxies);
        self.proxy_groups.extend(other.proxy_groups);
        self.proxy_providers.extend(other.proxy_providers);
        self.rules.extend(other.rules);
        if other.udp_timeout_secs.is_some() {
            self.udp_timeout_secs = other.udp_timeout_secs;
        }
        if other.public_suffix_list.is_some() {
            self.public_suffix_list = other.public_suffix_list;
        }
        if other.low_memory.is_some() {
            self.low_memory = other.low_memory;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboundConfig {
    pub name: String,
    #[serde(alias = "address", alias = "bind_location")]
    pub listen: NetLocation,
    #[serde(flatten)]
    pub protocol: InboundProtocolConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundProtocolConfig {
    #[serde(alias = "socks5")]
    Socks {
        #[serde(default, alias = "user")]
        users: NoneOrSome<UserConfig>,
        #[serde(default = "default_true")]
        udp: bool,
    },
    Http {
        #[serde(default, alias = "user")]
        users: NoneOrSome<UserConfig>,
    },
    Mixed {
        #[serde(default, alias = "user")]
        users: NoneOrSome<UserConfig>,
        #[serde(default = "default_true")]
        udp: bool,
    },
    #[serde(alias = "forward")]
    Tunnel {
        #[serde(alias = "target")]
        targets: OneOrSome<NetLocation>,
        #[serde(default = "default_tunnel_network")]
        network: OneOrSome<Network>,
    },
    Mux {
        #[serde(default)]
        padding: bool,
        #[serde(default)]
        brutal: Option<BrutalOptions>,
    },
}

impl std::fmt::Display for InboundProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Socks { .. } => "SOCKS",
            Self::Http { .. } => "HTTP",
            Self::Mixed { .. } => "Mixed",
            Self::Tunnel { .. } => "Tunnel",
            Self::Mux { .. } => "Mux",
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub name: String,
    #[serde(flatten)]
    pub protocol: ProxyProtocolConfig,
    /// Carries the proxy's connections over shared multiplexed sessions.
    #[serde(default)]
    pub smux: Option<ClientOptions>,
    #[serde(default)]
    pub bind_interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProxyProtocolConfig {
    Direct,
    Reject,
    #[serde(alias = "socks")]
    Socks5 {
        server: NetLocation,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_true")]
        udp: bool,
    },
    Http {
        server: NetLocation,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: GroupKindConfig,
    #[serde(default, alias = "proxy")]
    pub proxies: NoneOrSome<String>,
    /// Providers whose proxies join the group.
    #[serde(default, rename = "use")]
    pub providers: NoneOrSome<String>,
    #[serde(default = "default_test_url")]
    pub url: String,
    /// Seconds between health checks of the group's own proxies, zero for none.
    #[serde(default)]
    pub interval: u64,
    #[serde(default = "default_true")]
    pub lazy: bool,
    #[serde(default = "default_health_check_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub max_failed_times: Option<u32>,
    #[serde(default)]
    pub disable_udp: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GroupKindConfig {
    #[serde(alias = "selector")]
    Select,
    Relay,
    LoadBalance {
        #[serde(default)]
        strategy: Option<String>,
    },
    Fallback,
    UrlTest {
        #[serde(default)]
        tolerance: u16,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    /// `file` or `inline`. Checked when the configuration is built.
    #[serde(rename = "type")]
    pub vehicle: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Seconds between reloads of a file provider, zero for none.
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_test_url")]
    pub url: String,
    #[serde(default)]
    pub interval: u64,
    #[serde(default = "default_true")]
    pub lazy: bool,
    #[serde(default = "default_health_check_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enable: false,
            url: default_test_url(),
            interval: 0,
            lazy: true,
            timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

/// The format of a file provider's contents.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyFile {
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
inbounds:
  - name: mixed-in
    type: mixed
    listen: 127.0.0.1:7890
    users:
      - username: user
        password: pass
  - name: dns-in
    type: tunnel
    listen: 127.0.0.1:5353
    target: 8.8.8.8:53
    network: [tcp, udp]
proxies:
  - name: upstream
    type: socks5
    server: proxy.example.com:1080
    smux:
      protocol: yamux
      max_streams: 8
  - name: web
    type: http
    server: 10.0.0.1:3128
    username: u
    password: p
proxy_groups:
  - name: auto
    type: url-test
    proxies: [upstream, web]
    tolerance: 50
    interval: 300
  - name: balance
    type: load-balance
    strategy: round-robin
    use: remote
  - name: manual
    type: select
    proxies: [auto, DIRECT]
proxy_providers:
  - name: remote
    type: file
    path: proxies.yaml
    interval: 3600
    health_check:
      enable: true
      interval: 600
rules:
  - DOMAIN-SUFFIX,example.com,manual
  - MATCH,DIRECT
udp_timeout_secs: 120
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.inbounds.len(), 2);
        match &config.inbounds[0].protocol {
            InboundProtocolConfig::Mixed { users, udp } => {
                assert!(*udp);
                assert_eq!(users.len(), 1);
            }
            other => panic!("unexpected inbound {other}"),
        }
        match &config.inbounds[1].protocol {
            InboundProtocolConfig::Tunnel { targets, network } => {
                assert_eq!(targets.len(), 1);
                assert_eq!(network.len(), 2);
            }
            other => panic!("unexpected inbound {other}"),
        }
        let smux = config.proxies[0].smux.as_ref().unwrap();
        assert_eq!(smux.protocol, "yamux");
        assert_eq!(smux.max_streams, 8);
        assert!(matches!(
            config.proxy_groups[0].kind,
            GroupKindConfig::UrlTest { tolerance: 50 }
        ));
        assert_eq!(config.proxy_groups[1].providers.len(), 1);
        assert!(config.proxy_groups[2].lazy);
        assert_eq!(config.proxy_providers[0].vehicle, "file");
        assert!(config.proxy_providers[0].health_check.enable);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.udp_timeout_secs, Some(120));
    }

    #[test]
    fn test_unknown_top_level_key() {
        assert!(serde_yaml::from_str::<Config>("listeners: []").is_err());
    }

    #[test]
    fn test_merge() {
        let mut config: Config = serde_yaml::from_str("rules: [\"MATCH,DIRECT\"]\nlow_memory: true").unwrap();
        let other: Config = serde_yaml::from_str("rules: [\"DOMAIN,a.com,DIRECT\"]\nudp_timeout_secs: 5").unwrap();
        config.merge(other);
        assert_eq!(config.rules, vec!["MATCH,DIRECT", "DOMAIN,a.com,DIRECT"]);
        assert_eq!(config.low_memory, Some(true));
        assert_eq!(config.udp_timeout_secs, Some(5));
    }
}
