use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::address::{Address, NetLocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Everything known about one logical flow, built by the inbound and consulted by routing.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    pub source: NetLocation,
    pub destination: NetLocation,
    /// Resolved address of `destination` when it is a hostname.
    pub dst_ip: Option<IpAddr>,
    /// Sniffed host name that overrides the destination host.
    pub host: Option<String>,
    pub inbound_name: String,
    pub inbound_user: Option<String>,
    pub dscp: u8,
    pub process: Option<String>,
}

impl Metadata {
    pub fn new(network: Network, source: NetLocation, destination: NetLocation) -> Self {
        let dst_ip = destination.address().ip();
        Self {
            network,
            source,
            destination,
            dst_ip,
            host: None,
            inbound_name: String::new(),
            inbound_user: None,
            dscp: 0,
            process: None,
        }
    }

    pub fn with_inbound(mut self, name: &str) -> Self {
        self.inbound_name = name.to_string();
        self
    }

    pub fn src_ip(&self) -> Option<IpAddr> {
        self.source.address().ip()
    }

    /// The host used for domain matching: the sniffed host, else a hostname destination.
    pub fn domain(&self) -> Option<&str> {
        self.host
            .as_deref()
            .or_else(|| self.destination.address().hostname())
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Where the outbound should connect: the sniffed host if set, otherwise the destination.
    pub fn target(&self) -> NetLocation {
        if let Some(host) = self.host.as_deref()
            && let Ok(address) = Address::from(host)
        {
            return NetLocation::new(address, self.destination.port());
        }
        self.destination.clone()
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} --> {}",
            self.network,
            self.source,
            self.target()
        )
    }
}
