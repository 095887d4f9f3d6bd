//! SOCKS5 and HTTP on one port, told apart by the first byte: 0x05 is SOCKS5, anything else
//! is HTTP.

use log::debug;
use tokio::net::TcpStream;

use super::{Accepted, Inbound, http, socks};
use crate::address::NetLocation;
use crate::socks_handler::VER_SOCKS5;
use crate::stream_reader::StreamReader;

pub(super) async fn accept(
    inbound: &Inbound,
    mut stream: TcpStream,
    mut reader: StreamReader,
    source: NetLocation,
    users: &[(String, String)],
    udp: bool,
) -> std::io::Result<Accepted> {
    let first_byte = reader.peek_u8(&mut stream).await?;
    if first_byte == VER_SOCKS5 {
        debug!("[Mixed] detected SOCKS5 from {source}");
        socks::accept(inbound, stream, reader, source, users, udp).await
    } else {
        debug!("[Mixed] detected HTTP from {source} (first byte: 0x{first_byte:02x})");
        http::accept(inbound, stream, reader, source, users).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::InboundProtocolConfig;
    use crate::socks_handler::{CMD_CONNECT, client_handshake};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_both_protocols_on_one_port() {
        let (addr, tunnel, cancel) = start(InboundProtocolConfig::Mixed {
            users: Default::default(),
            udp: false,
        })
        .await;
        let echo = echo_server().await;

        let mut socks = TcpStream::connect(addr).await.unwrap();
        let mut reader = StreamReader::with_capacity(512);
        client_handshake(
            &mut socks,
            &mut reader,
            None,
            CMD_CONNECT,
            &NetLocation::from_socket_addr(echo),
        )
        .await
        .unwrap();
        socks.write_all(b"socks").await.unwrap();
        let mut buf = [0u8; 5];
        socks.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"socks");

        let mut http = TcpStream::connect(addr).await.unwrap();
        http.write_all(format!("CONNECT {echo} HTTP/1.1\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let expected = b"HTTP/1.1 200 Connection established\r\n\r\n";
        let mut head = vec![0u8; expected.len()];
        http.read_exact(&mut head).await.unwrap();
        assert_eq!(head, expected);
        http.write_all(b"http!").await.unwrap();
        http.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"http!");

        assert_eq!(tunnel.statistics().connection_count(), 2);
        cancel.cancel();
        tunnel.close();
    }
}
