use std::sync::Arc;

use async_trait::async_trait;

use super::{AdapterType, ProxyAdapter};
use crate::address::NetLocation;
use crate::bufio::{AsyncStream, PacketConn};
use crate::metadata::{Metadata, Network};
use crate::mux::{Client, ClientOptions, MuxDialer, mux_destination};

/// Opens physical connections for the mux client through the wrapped adapter.
#[derive(Debug)]
struct AdapterMuxDialer {
    adapter: Arc<dyn ProxyAdapter>,
}

#[async_trait]
impl MuxDialer for AdapterMuxDialer {
    async fn dial(&self) -> std::io::Result<Box<dyn AsyncStream>> {
        let metadata = Metadata::new(Network::Tcp, NetLocation::UNSPECIFIED, mux_destination());
        self.adapter.dial_context(&metadata).await
    }
}

/// Carries every connection of the wrapped adapter over shared multiplexed sessions.
#[derive(Debug)]
pub struct MuxAdapter {
    inner: Arc<dyn ProxyAdapter>,
    client: Client,
}

impl MuxAdapter {
    pub fn new(inner: Arc<dyn ProxyAdapter>, options: &ClientOptions) -> std::io::Result<Self> {
        if matches!(inner.adapter_type(), AdapterType::Direct | AdapterType::Reject) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "multiplexing requires a proxy server, {} is {}",
                    inner.name(),
                    inner.adapter_type()
                ),
            ));
        }
        let dialer = Arc::new(AdapterMuxDialer {
            adapter: inner.clone(),
        });
        Ok(Self {
            inner,
            client: Client::new(dialer, options)?,
        })
    }
}

#[async_trait]
impl ProxyAdapter for MuxAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn adapter_type(&self) -> AdapterType {
        self.inner.adapter_type()
    }

    fn addr(&self) -> String {
        self.inner.addr()
    }

    fn support_udp(&self) -> bool {
        true
    }

    fn support_uot(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        self.client.dial_tcp(metadata.target()).await
    }

    async fn listen_packet_context(
        &self,
        _metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        self.client.listen_packet().await
    }

    async fn close(&self) {
        self.client.close().await;
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Direct, SystemDialer};
    use crate::handler::{PacketConnectionHandler, TcpConnectionHandler};
    use crate::mux::{Service, ServiceOptions, is_mux_destination};
    use crate::resolver::NativeResolver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug)]
    struct EchoHandler;

    #[async_trait]
    impl TcpConnectionHandler for EchoHandler {
        async fn new_connection(&self, stream: Box<dyn AsyncStream>, _metadata: Metadata) {
            let (mut r, mut w) = tokio::io::split(stream);
            let _ = tokio::io::copy(&mut r, &mut w).await;
        }
    }

    #[async_trait]
    impl PacketConnectionHandler for EchoHandler {
        async fn new_packet_connection(&self, _conn: Box<dyn PacketConn>, _metadata: Metadata) {}
    }

    /// Stands in for a proxy server that runs the mux service.
    #[derive(Debug, Default)]
    struct MuxServerAdapter {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl ProxyAdapter for MuxServerAdapter {
        fn name(&self) -> &str {
            "server"
        }

        fn adapter_type(&self) -> AdapterType {
            AdapterType::Socks5
        }

        fn support_udp(&self) -> bool {
            false
        }

        async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
            assert!(is_mux_destination(&metadata.destination));
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (a, b) = tokio::io::duplex(1 << 16);
            let metadata = metadata.clone();
            tokio::spawn(async move {
                let service = Service::new(&ServiceOptions::default());
                let _ = service
                    .new_connection(
                        Box::new(b),
                        metadata,
                        Arc::new(EchoHandler),
                        CancellationToken::new(),
                    )
                    .await;
            });
            Ok(Box::new(a))
        }

        async fn listen_packet_context(
            &self,
            _metadata: &Metadata,
        ) -> std::io::Result<Box<dyn PacketConn>> {
            Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
        }
    }

    #[test]
    fn test_direct_cannot_be_multiplexed() {
        let direct = Direct::new(
            "DIRECT",
            SystemDialer::new(Arc::new(NativeResolver::new()), None),
        );
        let err = MuxAdapter::new(Arc::new(direct), &ClientOptions::default()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_streams_share_one_session() {
        let server = Arc::new(MuxServerAdapter::default());
        let adapter = MuxAdapter::new(server.clone(), &ClientOptions::default()).unwrap();
        assert_eq!(adapter.name(), "server");
        assert!(adapter.support_udp());

        let metadata = Metadata::new(
            Network::Tcp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_str("example.com:80", None).unwrap(),
        );
        for message in [&b"first"[..], &b"second"[..]] {
            let mut stream = adapter.dial_context(&metadata).await.unwrap();
            stream.write_all(message).await.unwrap();
            stream.flush().await.unwrap();
            let mut reply = vec![0u8; message.len()];
            stream.read_exact(&mut reply).await.unwrap();
            assert_eq!(reply, message);
        }
        assert_eq!(server.dials.load(Ordering::SeqCst), 1);
        adapter.close().await;
    }
}
