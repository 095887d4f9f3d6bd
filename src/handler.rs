use std::fmt::Debug;

use async_trait::async_trait;

use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::Metadata;

/// Receives accepted stream connections once the inbound has parsed their destination.
#[async_trait]
pub trait TcpConnectionHandler: Send + Sync + Debug {
    async fn new_connection(&self, stream: Box<dyn AsyncStream>, metadata: Metadata);
}

/// Receives packet connections that already know their own destinations.
#[async_trait]
pub trait PacketConnectionHandler: Send + Sync + Debug {
    async fn new_packet_connection(&self, conn: Box<dyn PacketConn>, metadata: Metadata);
}

pub trait ConnectionHandler: TcpConnectionHandler + PacketConnectionHandler {}

impl<T: TcpConnectionHandler + PacketConnectionHandler> ConnectionHandler for T {}
