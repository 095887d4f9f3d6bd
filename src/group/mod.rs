//! Adapters that pick among other proxies.

mod base;
mod fallback;
mod load_balance;
mod relay;
mod selector;
mod url_test;

pub use base::{DEFAULT_FAILED_TIMEOUT, DEFAULT_MAX_FAILED_TIMES, GroupBase, GroupOptions};
pub use fallback::Fallback;
pub use load_balance::{LoadBalance, Strategy};
pub use relay::Relay;
pub use selector::Selector;
pub use url_test::UrlTest;

fn empty_group(name: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("proxy group {name} has no proxies"),
    )
}

fn proxy_not_found(group: &str, name: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("proxy {name} not found in group {group}"),
    )
}
