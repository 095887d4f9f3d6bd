//! burrow - a user-space tunneling engine.
//!
//! Connections arrive on inbounds (SOCKS5, HTTP, mixed, fixed-target tunnels and mux
//! listeners), are matched against routing rules, and leave through proxies: direct, reject,
//! SOCKS5 or HTTP upstreams, optionally multiplexed over sing-mux compatible sessions, or
//! groups that pick among other proxies.
//!
//! # Embedding
//!
//! ```no_run
//! use burrow::config::{build_config, load_configs};
//! use burrow::environment::Environment;
//! use burrow::inbound::start_inbounds;
//! use burrow::rule::Matchers;
//! use burrow::tunnel::Tunnel;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> std::io::Result<()> {
//! let env = Environment::native();
//! let cancel = CancellationToken::new();
//! let config = load_configs(&["config.burrow.yaml".to_string()]).await?;
//! let loaded = build_config(config, &env, &Matchers::default(), &cancel)?;
//! env.reload(&loaded.settings).await?;
//! for provider in loaded.providers.iter() {
//!     provider.initial().await?;
//! }
//! let tunnel = Tunnel::new(env.clone(), loaded.routes, loaded.udp_timeout);
//! let _handles = start_inbounds(loaded.inbounds, &tunnel, &env, &cancel).await?;
//! # Ok(())
//! # }
//! ```
//!
//! `GEOIP` and `GEOSITE` rules resolve against matchers registered in
//! [`rule::Matchers`]; database loading is left to the embedder.

pub mod adapter;
pub mod address;
pub mod buf;
pub mod bufio;
pub mod config;
pub mod environment;
pub mod group;
pub mod handler;
pub mod inbound;
pub mod metadata;
pub mod mux;
pub mod option_util;
pub mod provider;
pub mod resolver;
pub mod rule;
pub mod tunnel;
pub mod udpnat;

mod http_handler;
mod socket_util;
mod socks_handler;
mod stream_reader;
