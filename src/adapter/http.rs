use std::sync::Arc;

use async_trait::async_trait;

use super::{AdapterType, Dialer, ProxyAdapter, SystemDialer};
use crate::address::NetLocation;
use crate::bufio::{AsyncStream, CachedStream, PacketConn};
use crate::http_handler::client_connect;
use crate::metadata::Metadata;
use crate::stream_reader::StreamReader;

/// An HTTP proxy reached with `CONNECT`. TCP only.
#[derive(Debug)]
pub struct Http {
    name: String,
    server: NetLocation,
    auth: Option<(String, String)>,
    dialer: Arc<dyn Dialer>,
}

impl Http {
    pub fn new(
        name: &str,
        server: NetLocation,
        auth: Option<(String, String)>,
        dialer: SystemDialer,
    ) -> Self {
        Self {
            name: name.to_string(),
            server,
            auth,
            dialer: Arc::new(dialer),
        }
    }
}

#[async_trait]
impl ProxyAdapter for Http {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Http
    }

    fn addr(&self) -> String {
        self.server.to_string()
    }

    fn support_udp(&self) -> bool {
        false
    }

    fn support_with_dialer(&self) -> bool {
        true
    }

    async fn dial_context(&self, metadata: &Metadata) -> std::io::Result<Box<dyn AsyncStream>> {
        self.dial_with_dialer(self.dialer.clone(), metadata).await
    }

    async fn listen_packet_context(
        &self,
        _metadata: &Metadata,
    ) -> std::io::Result<Box<dyn PacketConn>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("{} {} does not support UDP", self.adapter_type(), self.name),
        ))
    }

    async fn dial_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> std::io::Result<Box<dyn AsyncStream>> {
        let mut stream = dialer.dial_stream(&self.server).await?;
        let mut reader = StreamReader::new();
        client_connect(&mut stream, &mut reader, self.auth.as_ref(), &metadata.target()).await?;
        Ok(match reader.into_cache() {
            Some(cache) => Box::new(CachedStream::new(stream, cache)),
            None => stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_handler::read_request;
    use crate::metadata::Network;
    use crate::resolver::NativeResolver;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_keeps_early_data() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = NetLocation::from_socket_addr(listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut reader = StreamReader::new();
            let users = vec![("u".to_string(), "p".to_string())];
            let request = read_request(&mut conn, &mut reader, &users).await.unwrap();
            assert_eq!(request.location.to_string(), "example.com:443");
            let mut reply = request.success_response().unwrap();
            reply.extend_from_slice(b"server-first");
            conn.write_all(&reply).await.unwrap();
        });

        let http = Http::new(
            "http",
            server,
            Some(("u".to_string(), "p".to_string())),
            SystemDialer::new(Arc::new(NativeResolver::new()), None),
        );
        let metadata = Metadata::new(
            Network::Tcp,
            NetLocation::UNSPECIFIED,
            NetLocation::from_str("example.com:443", None).unwrap(),
        );
        let mut stream = http.dial_context(&metadata).await.unwrap();
        let mut greeting = [0u8; 12];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"server-first");
        assert!(!http.support_udp());
    }
}
