//! SOCKS5 wire format shared by the SOCKS inbound and the SOCKS5 outbound.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::address::{
    ADDR_TYPE_DOMAIN_NAME, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6, Address, NetLocation, parse_socks_addr,
    socks_addr_to_vec, write_socks_addr,
};
use crate::stream_reader::StreamReader;

pub const VER_SOCKS5: u8 = 0x05;
pub const VER_AUTH: u8 = 0x01;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USERNAME: u8 = 0x02;
pub const METHOD_INVALID: u8 = 0xff;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_TTL_EXPIRED: u8 = 0x06;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;

fn invalid(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}

pub async fn read_location<T: AsyncRead + Unpin + ?Sized>(
    stream: &mut T,
    reader: &mut StreamReader,
) -> std::io::Result<NetLocation> {
    let address_type = reader.read_u8(stream).await?;
    match address_type {
        ADDR_TYPE_IPV4 => {
            let bytes = reader.read_slice(stream, 6).await?;
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Ok(NetLocation::new(Address::Ipv4(ip), port))
        }
        ADDR_TYPE_IPV6 => {
            let bytes = reader.read_slice(stream, 18).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Ok(NetLocation::new(Address::Ipv6(Ipv6Addr::from(octets)), port))
        }
        ADDR_TYPE_DOMAIN_NAME => {
            let len = reader.read_u8(stream).await? as usize;
            let bytes = reader.read_slice(stream, len + 2).await?;
            let host = std::str::from_utf8(&bytes[..len])
                .map_err(|e| invalid(format!("failed to decode address: {e}")))?;
            let port = u16::from_be_bytes([bytes[len], bytes[len + 1]]);
            // Some clients send IP literals as domain names.
            Ok(NetLocation::new(Address::from(host)?, port))
        }
        _ => Err(invalid(format!("unknown address type: {address_type}"))),
    }
}

/// Maps a dial error to the closest SOCKS5 reply code.
pub fn reply_code(error: &std::io::Error) -> u8 {
    match error.kind() {
        std::io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        std::io::ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
        std::io::ErrorKind::HostUnreachable => REPLY_HOST_UNREACHABLE,
        std::io::ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        std::io::ErrorKind::PermissionDenied => REPLY_NOT_ALLOWED,
        std::io::ErrorKind::NotFound => REPLY_HOST_UNREACHABLE,
        _ => REPLY_GENERAL_FAILURE,
    }
}

pub fn encode_reply(code: u8, bound: &NetLocation) -> Vec<u8> {
    let mut reply = vec![VER_SOCKS5, code, 0];
    write_socks_addr(bound, &mut reply);
    reply
}

/// A request read by the server side after method negotiation and authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: u8,
    pub location: NetLocation,
    pub user: Option<String>,
}

/// Runs the server side of the handshake up to and including the request.
///
/// `users` holds accepted username/password pairs; an empty list means no authentication.
pub async fn server_handshake<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    reader: &mut StreamReader,
    users: &[(String, String)],
) -> std::io::Result<SocksRequest> {
    let version = reader.read_u8(stream).await?;
    if version != VER_SOCKS5 {
        return Err(invalid(format!("unsupported SOCKS version: {version}")));
    }
    let method_len = reader.read_u8(stream).await? as usize;
    if method_len == 0 {
        return Err(invalid("invalid method length: 0"));
    }
    let methods = reader.read_slice(stream, method_len).await?;
    let method = if users.is_empty() {
        METHOD_NONE
    } else {
        METHOD_USERNAME
    };
    if !methods.contains(&method) {
        stream.write_all(&[VER_SOCKS5, METHOD_INVALID]).await?;
        stream.flush().await?;
        return Err(invalid("no supported SOCKS method"));
    }
    stream.write_all(&[VER_SOCKS5, method]).await?;
    stream.flush().await?;

    let mut user = None;
    if method == METHOD_USERNAME {
        let auth_version = reader.read_u8(stream).await?;
        if auth_version != VER_AUTH {
            return Err(invalid(format!("unsupported SOCKS auth version: {auth_version}")));
        }
        let username_len = reader.read_u8(stream).await? as usize;
        let username = String::from_utf8(reader.read_slice(stream, username_len).await?.to_vec())
            .map_err(|e| invalid(format!("failed to decode username: {e}")))?;
        let password_len = reader.read_u8(stream).await? as usize;
        let password = String::from_utf8(reader.read_slice(stream, password_len).await?.to_vec())
            .map_err(|e| invalid(format!("failed to decode password: {e}")))?;
        let accepted = users
            .iter()
            .any(|(u, p)| *u == username && *p == password);
        let status = if accepted { AUTH_SUCCESS } else { AUTH_FAILURE };
        stream.write_all(&[VER_AUTH, status]).await?;
        stream.flush().await?;
        if !accepted {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("SOCKS authentication failed for user {username}"),
            ));
        }
        user = Some(username);
    }

    let header = reader.read_slice(stream, 3).await?;
    let (version, command) = (header[0], header[1]);
    if version != VER_SOCKS5 {
        return Err(invalid(format!("invalid SOCKS version: {version}")));
    }
    let location = read_location(stream, reader).await?;
    if command != CMD_CONNECT && command != CMD_UDP_ASSOCIATE {
        stream
            .write_all(&encode_reply(REPLY_COMMAND_NOT_SUPPORTED, &NetLocation::UNSPECIFIED))
            .await?;
        stream.flush().await?;
        return Err(invalid(format!("unsupported SOCKS command: {command}")));
    }
    Ok(SocksRequest {
        command,
        location,
        user,
    })
}

/// Runs the client side of the handshake and returns the server's bound address.
///
/// Bytes the server sent after its reply stay in `reader`.
pub async fn client_handshake<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    reader: &mut StreamReader,
    auth: Option<&(String, String)>,
    command: u8,
    location: &NetLocation,
) -> std::io::Result<NetLocation> {
    let method = if auth.is_some() {
        METHOD_USERNAME
    } else {
        METHOD_NONE
    };
    let mut request = vec![VER_SOCKS5, 1, method];
    if let Some((username, password)) = auth {
        request.extend_from_slice(&[VER_AUTH, username.len() as u8]);
        request.extend_from_slice(username.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
    }
    request.extend_from_slice(&[VER_SOCKS5, command, 0]);
    request.extend_from_slice(&socks_addr_to_vec(location));
    stream.write_all(&request).await?;
    stream.flush().await?;

    let version = reader.read_u8(stream).await?;
    if version != VER_SOCKS5 {
        return Err(invalid(format!("unsupported SOCKS version: {version}")));
    }
    let selected = reader.read_u8(stream).await?;
    if selected == METHOD_INVALID || selected != method {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "SOCKS server rejected auth method",
        ));
    }
    if auth.is_some() {
        let auth_version = reader.read_u8(stream).await?;
        let status = reader.read_u8(stream).await?;
        if auth_version != VER_AUTH || status != AUTH_SUCCESS {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("SOCKS server authentication failed: error {status}"),
            ));
        }
    }

    let header = reader.read_slice(stream, 3).await?;
    let (version, reply) = (header[0], header[1]);
    if version != VER_SOCKS5 {
        return Err(invalid(format!("unsupported SOCKS version: {version}")));
    }
    if reply != REPLY_SUCCESS {
        let kind = match reply {
            REPLY_CONNECTION_REFUSED => std::io::ErrorKind::ConnectionRefused,
            REPLY_TTL_EXPIRED => std::io::ErrorKind::TimedOut,
            REPLY_HOST_UNREACHABLE => std::io::ErrorKind::HostUnreachable,
            REPLY_NETWORK_UNREACHABLE => std::io::ErrorKind::NetworkUnreachable,
            REPLY_NOT_ALLOWED => std::io::ErrorKind::PermissionDenied,
            _ => std::io::ErrorKind::Other,
        };
        return Err(std::io::Error::new(
            kind,
            format!("SOCKS server command failed: error {reply}"),
        ));
    }
    read_location(stream, reader).await
}

/// Prefixes a UDP datagram header: reserved, fragment 0, then the address.
pub fn encode_udp_header(destination: &NetLocation, out: &mut Vec<u8>) {
    out.extend_from_slice(&[0, 0, 0]);
    write_socks_addr(destination, out);
}

/// Parses a UDP datagram header, returning the address and the header length.
/// Fragmented datagrams are refused.
pub fn parse_udp_header(data: &[u8]) -> std::io::Result<(NetLocation, usize)> {
    if data.len() < 4 {
        return Err(invalid("SOCKS UDP datagram too short"));
    }
    if data[2] != 0 {
        return Err(invalid(format!("SOCKS UDP fragment {} not supported", data[2])));
    }
    match parse_socks_addr(&data[3..])? {
        Some((location, len)) => Ok((location, 3 + len)),
        None => Err(invalid("truncated SOCKS UDP header")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<(String, String)> {
        vec![("user".to_string(), "pass".to_string())]
    }

    #[tokio::test]
    async fn test_handshake_with_auth() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut reader = StreamReader::with_capacity(512);
            let request = server_handshake(&mut server, &mut reader, &users())
                .await
                .unwrap();
            server
                .write_all(&encode_reply(
                    REPLY_SUCCESS,
                    &NetLocation::from_str("127.0.0.1:1080", None).unwrap(),
                ))
                .await
                .unwrap();
            server.write_all(b"early").await.unwrap();
            request
        });

        let target = NetLocation::from_str("example.com:443", None).unwrap();
        let auth = ("user".to_string(), "pass".to_string());
        let mut reader = StreamReader::with_capacity(512);
        let bound = client_handshake(&mut client, &mut reader, Some(&auth), CMD_CONNECT, &target)
            .await
            .unwrap();
        assert_eq!(bound.to_string(), "127.0.0.1:1080");

        let request = server_task.await.unwrap();
        assert_eq!(request.command, CMD_CONNECT);
        assert_eq!(request.location, target);
        assert_eq!(request.user.as_deref(), Some("user"));

        let mut early = [0u8; 5];
        let mut filled = reader.unparsed_data().len();
        early[..filled].copy_from_slice(reader.unparsed_data());
        if filled < 5 {
            use tokio::io::AsyncReadExt;
            client.read_exact(&mut early[filled..]).await.unwrap();
            filled = 5;
        }
        assert_eq!(&early[..filled], b"early");
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let mut reader = StreamReader::with_capacity(512);
            server_handshake(&mut server, &mut reader, &users()).await
        });
        let auth = ("user".to_string(), "wrong".to_string());
        let mut reader = StreamReader::with_capacity(512);
        let target = NetLocation::from_str("1.2.3.4:80", None).unwrap();
        let err = client_handshake(&mut client, &mut reader, Some(&auth), CMD_CONNECT, &target)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
        let server_err = server_task.await.unwrap().unwrap_err();
        assert_eq!(server_err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_failure_reply_maps_kind() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut reader = StreamReader::with_capacity(512);
            server_handshake(&mut server, &mut reader, &[]).await.unwrap();
            let error = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
            server
                .write_all(&encode_reply(reply_code(&error), &NetLocation::UNSPECIFIED))
                .await
                .unwrap();
        });
        let mut reader = StreamReader::with_capacity(512);
        let target = NetLocation::from_str("1.2.3.4:80", None).unwrap();
        let err = client_handshake(&mut client, &mut reader, None, CMD_CONNECT, &target)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_udp_header() {
        let destination = NetLocation::from_str("example.com:53", None).unwrap();
        let mut packet = Vec::new();
        encode_udp_header(&destination, &mut packet);
        packet.extend_from_slice(b"dns");
        let (parsed, len) = parse_udp_header(&packet).unwrap();
        assert_eq!(parsed, destination);
        assert_eq!(&packet[len..], b"dns");

        packet[2] = 1;
        assert!(parse_udp_header(&packet).is_err());
    }
}
