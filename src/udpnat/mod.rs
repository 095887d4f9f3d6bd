//! Per-source UDP flows on top of connectionless packet input.

mod conn;
mod context;
mod service;

pub use conn::{NatConn, PacketWriter};
pub use context::{CancelContext, CloseCause};
pub use service::{FLOW_QUEUE_SIZE, FlowInit, Service, UdpConnectionHandler};
