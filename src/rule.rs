//! Routing rules: `TYPE,payload,target[,no-resolve]` lines matched in order against a flow.

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

use log::debug;

use crate::address::IpCidr;
use crate::metadata::{Metadata, Network};
use crate::resolver::{Resolver, resolve_single_address};

/// Country lookup for `GEOIP` rules. Database loading lives outside this crate.
pub trait GeoIpMatcher: Send + Sync + Debug {
    fn matches(&self, ip: IpAddr) -> bool;
}

/// Domain set lookup for `GEOSITE` rules.
pub trait DomainMatcher: Send + Sync + Debug {
    fn apply_domain(&self, domain: &str) -> bool;
}

/// Named matchers that `GEOIP` and `GEOSITE` rules may refer to.
#[derive(Debug, Default, Clone)]
pub struct Matchers {
    pub geoip: HashMap<String, Arc<dyn GeoIpMatcher>>,
    pub geosite: HashMap<String, Arc<dyn DomainMatcher>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    fn parse(s: &str) -> std::io::Result<Self> {
        let invalid = || {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid port range: {s}"),
            )
        };
        let (start, end) = match s.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (s.trim(), s.trim()),
        };
        let start = start.parse::<u16>().map_err(|_| invalid())?;
        let end = end.parse::<u16>().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }

    fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

fn parse_ports(s: &str) -> std::io::Result<Vec<PortRange>> {
    s.split('/').map(PortRange::parse).collect()
}

#[derive(Debug, Clone)]
pub enum Condition {
    Domain(String),
    DomainSuffix(String),
    DomainKeyword(String),
    GeoSite(String, Arc<dyn DomainMatcher>),
    IpCidr(IpCidr),
    SrcIpCidr(IpCidr),
    GeoIp(String, Arc<dyn GeoIpMatcher>),
    DstPort(Vec<PortRange>),
    SrcPort(Vec<PortRange>),
    Network(Network),
    InName(String),
    Match,
}

#[derive(Debug, Clone)]
pub struct Rule {
    condition: Condition,
    target: String,
    no_resolve: bool,
}

/// `hostname` equals `base_domain` or is a subdomain of it.
fn matches_domain(base_domain: &str, hostname: &str) -> bool {
    if !hostname.ends_with(base_domain) {
        return false;
    }
    let hostname_len = hostname.len();
    let base_domain_len = base_domain.len();
    hostname_len == base_domain_len
        || hostname.as_bytes()[hostname_len - base_domain_len - 1] == b'.'
}

impl Rule {
    pub fn new(condition: Condition, target: &str, no_resolve: bool) -> Self {
        Self {
            condition,
            target: target.to_string(),
            no_resolve,
        }
    }

    /// Parses one rule line. `MATCH` takes no payload: `MATCH,target`.
    pub fn parse(line: &str, matchers: &Matchers) -> std::io::Result<Self> {
        let invalid = |message: String| std::io::Error::new(std::io::ErrorKind::InvalidInput, message);
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        let rule_type = parts[0].to_ascii_uppercase();
        if rule_type == "MATCH" {
            return match parts.as_slice() {
                [_, target] if !target.is_empty() => Ok(Self::new(Condition::Match, target, false)),
                _ => Err(invalid(format!("invalid rule: {line}"))),
            };
        }
        let (payload, target, params) = match parts.as_slice() {
            [_, payload, target, params @ ..] if !payload.is_empty() && !target.is_empty() => {
                (*payload, *target, params)
            }
            _ => return Err(invalid(format!("invalid rule: {line}"))),
        };
        let mut no_resolve = false;
        for param in params {
            match *param {
                "no-resolve" => no_resolve = true,
                other => return Err(invalid(format!("unknown rule option {other} in: {line}"))),
            }
        }
        let condition = match rule_type.as_str() {
            "DOMAIN" => Condition::Domain(payload.to_ascii_lowercase()),
            "DOMAIN-SUFFIX" => Condition::DomainSuffix(payload.to_ascii_lowercase()),
            "DOMAIN-KEYWORD" => Condition::DomainKeyword(payload.to_ascii_lowercase()),
            "GEOSITE" => {
                let key = payload.to_ascii_lowercase();
                let matcher = matchers
                    .geosite
                    .get(&key)
                    .ok_or_else(|| invalid(format!("no domain matcher named {payload}")))?;
                Condition::GeoSite(key, matcher.clone())
            }
            "IP-CIDR" | "IP-CIDR6" => Condition::IpCidr(IpCidr::from(payload)?),
            "SRC-IP-CIDR" => Condition::SrcIpCidr(IpCidr::from(payload)?),
            "GEOIP" => {
                let key = payload.to_ascii_lowercase();
                let matcher = matchers
                    .geoip
                    .get(&key)
                    .ok_or_else(|| invalid(format!("no GeoIP matcher named {payload}")))?;
                Condition::GeoIp(key, matcher.clone())
            }
            "DST-PORT" => Condition::DstPort(parse_ports(payload)?),
            "SRC-PORT" => Condition::SrcPort(parse_ports(payload)?),
            "NETWORK" => match payload.to_ascii_lowercase().as_str() {
                "tcp" => Condition::Network(Network::Tcp),
                "udp" => Condition::Network(Network::Udp),
                _ => return Err(invalid(format!("unknown network in rule: {line}"))),
            },
            "IN-NAME" => Condition::InName(payload.to_string()),
            _ => return Err(invalid(format!("unknown rule type: {}", parts[0]))),
        };
        Ok(Self::new(condition, target, no_resolve))
    }

    /// The proxy or group name traffic matching this rule goes to.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    /// Whether matching needs the destination address of a hostname flow.
    pub fn should_resolve_ip(&self) -> bool {
        !self.no_resolve && matches!(self.condition, Condition::IpCidr(_) | Condition::GeoIp(..))
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        let domain = || metadata.domain().map(str::to_ascii_lowercase);
        match &self.condition {
            Condition::Domain(d) => domain().is_some_and(|host| host == *d),
            Condition::DomainSuffix(d) => domain().is_some_and(|host| matches_domain(d, &host)),
            Condition::DomainKeyword(k) => domain().is_some_and(|host| host.contains(k.as_str())),
            Condition::GeoSite(_, matcher) => domain().is_some_and(|host| matcher.apply_domain(&host)),
            Condition::IpCidr(cidr) => metadata.dst_ip.is_some_and(|ip| cidr.contains(&ip)),
            Condition::SrcIpCidr(cidr) => metadata.src_ip().is_some_and(|ip| cidr.contains(&ip)),
            Condition::GeoIp(_, matcher) => metadata.dst_ip.is_some_and(|ip| matcher.matches(ip)),
            Condition::DstPort(ranges) => {
                let port = metadata.destination.port();
                ranges.iter().any(|r| r.contains(port))
            }
            Condition::SrcPort(ranges) => {
                let port = metadata.source.port();
                ranges.iter().any(|r| r.contains(port))
            }
            Condition::Network(network) => metadata.network == *network,
            Condition::InName(name) => metadata.inbound_name == *name,
            Condition::Match => true,
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.condition {
            Condition::Domain(d) => write!(f, "Domain({d})"),
            Condition::DomainSuffix(d) => write!(f, "DomainSuffix({d})"),
            Condition::DomainKeyword(k) => write!(f, "DomainKeyword({k})"),
            Condition::GeoSite(name, _) => write!(f, "GeoSite({name})"),
            Condition::IpCidr(cidr) => write!(f, "IPCIDR({cidr})"),
            Condition::SrcIpCidr(cidr) => write!(f, "SrcIPCIDR({cidr})"),
            Condition::GeoIp(name, _) => write!(f, "GeoIP({name})"),
            Condition::DstPort(_) => f.write_str("DstPort"),
            Condition::SrcPort(_) => f.write_str("SrcPort"),
            Condition::Network(network) => write!(f, "Network({network})"),
            Condition::InName(name) => write!(f, "InName({name})"),
            Condition::Match => f.write_str("Match"),
        }
    }
}

/// Ordered rules. The first rule that matches and whose target accepts the flow wins.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn parse(lines: &[String], matchers: &Matchers) -> std::io::Result<Self> {
        let rules = lines
            .iter()
            .map(|line| Rule::parse(line, matchers))
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Finds the first matching rule for which `accept` holds.
    ///
    /// Hostname destinations are resolved at most once, the first time a rule needs an IP.
    /// A failed lookup leaves `dst_ip` empty and IP rules simply do not match.
    pub async fn find(
        &self,
        metadata: &mut Metadata,
        resolver: &Arc<dyn Resolver>,
        accept: impl Fn(&Rule) -> bool,
    ) -> Option<&Rule> {
        let mut resolved = metadata.dst_ip.is_some();
        for rule in &self.rules {
            if !resolved && rule.should_resolve_ip() && metadata.destination.is_fqdn() {
                resolved = true;
                match resolve_single_address(resolver, &metadata.destination).await {
                    Ok(addr) => metadata.dst_ip = Some(addr.ip()),
                    Err(e) => debug!("[Rule] resolve {} failed: {e}", metadata.destination),
                }
            }
            if rule.matches(metadata) && accept(rule) {
                return Some(rule);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetLocation;
    use crate::resolver::NativeResolver;

    #[derive(Debug)]
    struct Private;

    impl GeoIpMatcher for Private {
        fn matches(&self, ip: IpAddr) -> bool {
            match ip {
                IpAddr::V4(v4) => v4.is_private(),
                IpAddr::V6(_) => false,
            }
        }
    }

    fn metadata(network: Network, source: &str, destination: &str) -> Metadata {
        Metadata::new(
            network,
            NetLocation::from_str(source, None).unwrap(),
            NetLocation::from_str(destination, None).unwrap(),
        )
    }

    fn rules(lines: &[&str]) -> RuleSet {
        let mut matchers = Matchers::default();
        matchers.geoip.insert("lan".into(), Arc::new(Private));
        let lines: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        RuleSet::parse(&lines, &matchers).unwrap()
    }

    fn resolver() -> Arc<dyn Resolver> {
        Arc::new(NativeResolver::new())
    }

    #[test]
    fn test_parse_errors() {
        let matchers = Matchers::default();
        for line in [
            "DOMAIN,example.com",
            "UNKNOWN,x,DIRECT",
            "IP-CIDR,10.0.0.0/33,DIRECT",
            "DST-PORT,90-80,DIRECT",
            "GEOIP,CN,DIRECT",
            "IP-CIDR,10.0.0.0/8,DIRECT,bogus",
            "MATCH",
        ] {
            assert!(Rule::parse(line, &matchers).is_err(), "{line}");
        }
    }

    #[test]
    fn test_domain_rules() {
        let m = metadata(Network::Tcp, "10.0.0.1:1000", "www.Example.com:443");
        assert!(Rule::parse("DOMAIN-SUFFIX,example.com,P", &Matchers::default()).unwrap().matches(&m));
        assert!(!Rule::parse("DOMAIN-SUFFIX,ample.com,P", &Matchers::default()).unwrap().matches(&m));
        assert!(Rule::parse("DOMAIN,www.example.com,P", &Matchers::default()).unwrap().matches(&m));
        assert!(Rule::parse("DOMAIN-KEYWORD,exam,P", &Matchers::default()).unwrap().matches(&m));
        assert!(!Rule::parse("DOMAIN,example.com,P", &Matchers::default()).unwrap().matches(&m));
    }

    #[test]
    fn test_port_network_and_inbound_rules() {
        let mut m = metadata(Network::Udp, "10.0.0.1:5353", "1.1.1.1:53");
        m.inbound_name = "socks-in".into();
        let set = Matchers::default();
        assert!(Rule::parse("DST-PORT,53,P", &set).unwrap().matches(&m));
        assert!(Rule::parse("DST-PORT,80/50-60,P", &set).unwrap().matches(&m));
        assert!(!Rule::parse("DST-PORT,80,P", &set).unwrap().matches(&m));
        assert!(Rule::parse("SRC-PORT,5000-6000,P", &set).unwrap().matches(&m));
        assert!(Rule::parse("NETWORK,udp,P", &set).unwrap().matches(&m));
        assert!(!Rule::parse("NETWORK,tcp,P", &set).unwrap().matches(&m));
        assert!(Rule::parse("IN-NAME,socks-in,P", &set).unwrap().matches(&m));
        assert!(Rule::parse("SRC-IP-CIDR,10.0.0.0/8,P", &set).unwrap().matches(&m));
        assert!(Rule::parse("IP-CIDR,1.1.1.0/24,P", &set).unwrap().matches(&m));
        assert!(!Rule::parse("IP-CIDR6,2001:db8::/32,P", &set).unwrap().matches(&m));
    }

    #[tokio::test]
    async fn test_first_accepted_match_wins() {
        let set = rules(&["DOMAIN-SUFFIX,example.com,A", "DOMAIN-KEYWORD,exam,B", "MATCH,C"]);
        let mut m = metadata(Network::Tcp, "10.0.0.1:1", "www.example.com:80");
        let rule = set.find(&mut m, &resolver(), |_| true).await.unwrap();
        assert_eq!(rule.target(), "A");
        let rule = set.find(&mut m, &resolver(), |r| r.target() != "A").await.unwrap();
        assert_eq!(rule.target(), "B");
    }

    #[tokio::test]
    async fn test_no_resolve_skips_lookup() {
        let set = rules(&["IP-CIDR,127.0.0.0/8,LOCAL,no-resolve", "MATCH,OTHER"]);
        let mut m = metadata(Network::Tcp, "10.0.0.1:1", "localhost:80");
        let rule = set.find(&mut m, &resolver(), |_| true).await.unwrap();
        assert_eq!(rule.target(), "OTHER");
        assert!(m.dst_ip.is_none());
    }

    #[tokio::test]
    async fn test_ip_rule_resolves_lazily() {
        let set = rules(&["DOMAIN,other.test,X", "GEOIP,LAN,LAN", "IP-CIDR,127.0.0.0/8,LOCAL", "MATCH,OTHER"]);
        let mut m = metadata(Network::Tcp, "10.0.0.1:1", "localhost:80");
        let rule = set.find(&mut m, &resolver(), |_| true).await.unwrap();
        assert!(m.dst_ip.is_some());
        // localhost may resolve to ::1 first; either way it is not a private v4 address.
        let expected = if m.dst_ip.is_some_and(|ip| ip.is_loopback() && ip.is_ipv4()) {
            "LOCAL"
        } else {
            "OTHER"
        };
        assert_eq!(rule.target(), expected);
    }
}
