//! Configuration validation: name uniqueness, references and group ordering.

use std::collections::{HashMap, HashSet};

use crate::group::Strategy;

use super::types::{Config, GroupKindConfig, ProviderConfig, ProxyProtocolConfig};

/// Names that always exist and may not be redefined.
pub const BUILTIN_PROXIES: [&str; 2] = ["DIRECT", "REJECT"];

pub const VEHICLE_FILE: &str = "file";
pub const VEHICLE_INLINE: &str = "inline";

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message)
}

/// Checks every cross reference in `config`.
///
/// Returns the group names ordered so that each group comes after the groups it contains.
pub fn validate_config(config: &Config) -> std::io::Result<Vec<String>> {
    let mut inbound_names = HashSet::new();
    for inbound in config.inbounds.iter() {
        if !inbound_names.insert(inbound.name.as_str()) {
            return Err(invalid(format!("inbound already exists: {}", inbound.name)));
        }
    }

    let mut proxy_names: HashSet<&str> = BUILTIN_PROXIES.into_iter().collect();
    for proxy in config.proxies.iter() {
        if !proxy_names.insert(proxy.name.as_str()) {
            return Err(invalid(format!("proxy already exists: {}", proxy.name)));
        }
        validate_auth(&proxy.name, &proxy.protocol)?;
    }
    for group in config.proxy_groups.iter() {
        if !proxy_names.insert(group.name.as_str()) {
            return Err(invalid(format!(
                "proxy group name is already taken: {}",
                group.name
            )));
        }
    }

    let mut provider_names = HashSet::new();
    for provider in config.proxy_providers.iter() {
        if !provider_names.insert(provider.name.as_str()) {
            return Err(invalid(format!(
                "proxy provider already exists: {}",
                provider.name
            )));
        }
        validate_provider(provider)?;
    }

    let group_names: HashSet<&str> = config
        .proxy_groups
        .iter()
        .map(|group| group.name.as_str())
        .collect();
    let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
    for group in config.proxy_groups.iter() {
        if group.proxies.is_empty() && group.providers.is_empty() {
            return Err(invalid(format!(
                "proxy group {} has no proxies and uses no provider",
                group.name
            )));
        }
        let mut member_groups = vec![];
        for member in group.proxies.iter() {
            if !proxy_names.contains(member.as_str()) {
                return Err(invalid(format!(
                    "proxy group {} references unknown proxy: {member}",
                    group.name
                )));
            }
            if group_names.contains(member.as_str()) {
                member_groups.push(member.clone());
            }
        }
        for provider in group.providers.iter() {
            if !provider_names.contains(provider.as_str()) {
                return Err(invalid(format!(
                    "proxy group {} uses unknown provider: {provider}",
                    group.name
                )));
            }
        }
        if let GroupKindConfig::LoadBalance {
            strategy: Some(strategy),
        } = &group.kind
        {
            Strategy::from_name(strategy)?;
        }
        dependencies.insert(group.name.clone(), member_groups);
    }

    topological_sort(&dependencies)
}

pub(super) fn validate_auth(name: &str, protocol: &ProxyProtocolConfig) -> std::io::Result<()> {
    let (username, password) = match protocol {
        ProxyProtocolConfig::Socks5 {
            username, password, ..
        }
        | ProxyProtocolConfig::Http {
            username, password, ..
        } => (username, password),
        ProxyProtocolConfig::Direct | ProxyProtocolConfig::Reject => return Ok(()),
    };
    if username.is_some() != password.is_some() {
        return Err(invalid(format!(
            "proxy {name} needs both username and password, or neither"
        )));
    }
    Ok(())
}

fn validate_provider(provider: &ProviderConfig) -> std::io::Result<()> {
    match provider.vehicle.as_str() {
        VEHICLE_FILE => {
            if provider.path.is_none() {
                return Err(invalid(format!(
                    "file provider {} needs a path",
                    provider.name
                )));
            }
        }
        VEHICLE_INLINE => {
            if provider.proxies.is_empty() {
                return Err(invalid(format!(
                    "inline provider {} has no proxies",
                    provider.name
                )));
            }
            let mut names = HashSet::new();
            for proxy in provider.proxies.iter() {
                if !names.insert(proxy.name.as_str()) {
                    return Err(invalid(format!(
                        "provider {} lists proxy {} twice",
                        provider.name, proxy.name
                    )));
                }
                validate_auth(&proxy.name, &proxy.protocol)?;
            }
        }
        other => {
            return Err(invalid(format!(
                "unsupported provider vehicle type: {other} (provider {})",
                provider.name
            )));
        }
    }
    Ok(())
}

/// Orders groups so that dependencies come before dependents (Kahn's algorithm).
/// Returns an error naming the groups left over when there is a cycle.
fn topological_sort(dependencies: &HashMap<String, Vec<String>>) -> std::io::Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut reverse_deps: HashMap<&str, Vec<&str>> = HashMap::new();

    for (group_name, deps) in dependencies {
        *in_degree.entry(group_name).or_insert(0) += deps.len();
        for dep in deps {
            reverse_deps.entry(dep).or_default().push(group_name);
        }
    }

    // Sorted so that the resulting order does not depend on map iteration.
    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(name, _)| *name)
        .collect();
    queue.sort_unstable_by(|a, b| b.cmp(a));

    let mut result = vec![];
    while let Some(node) = queue.pop() {
        result.push(node.to_string());
        if let Some(dependents) = reverse_deps.get(node) {
            for dependent in dependents {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(*dependent);
                    }
                }
            }
        }
    }

    if result.len() != dependencies.len() {
        let processed: HashSet<&str> = result.iter().map(String::as_str).collect();
        let mut in_cycle: Vec<&str> = dependencies
            .keys()
            .map(String::as_str)
            .filter(|name| !processed.contains(name))
            .collect();
        in_cycle.sort_unstable();
        return Err(invalid(format!(
            "proxy groups form a loop: {}",
            in_cycle.join(", ")
        )));
    }

    Ok(result)
}
