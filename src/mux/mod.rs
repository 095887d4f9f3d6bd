//! sing-mux compatible stream multiplexing.

mod brutal;
mod client;
mod conn;
mod padding;
mod protocol;
mod server;
mod session;
mod smux;
mod yamux_session;

pub use brutal::BrutalOptions;
pub use client::{Client, ClientOptions, MuxDialer};
pub use protocol::{Protocol, is_mux_destination, mux_destination};
pub use server::{Service, ServiceOptions};
