//! TCP Brutal bandwidth negotiation over a dedicated mux stream.
//!
//! The client opens a stream to `_BrutalBwExchange`, sends its receive rate, and the server
//! answers with its own receive rate or a reason for refusing. Each side then pins its send rate
//! on the physical socket with the `brutal` congestion control.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{STATUS_SUCCESS, StreamRequest, encode_vstring, read_response, read_vstring};
use super::session::Session;
use crate::address::{Address, NetLocation};

pub const BRUTAL_EXCHANGE_DOMAIN: &str = "_BrutalBwExchange";
pub const BRUTAL_MIN_SPEED_BPS: u64 = 65536;

#[cfg(target_os = "linux")]
const TCP_BRUTAL_PARAMS: libc::c_int = 23301;
#[cfg(target_os = "linux")]
const BRUTAL_CWND_GAIN: u32 = 20;

/// Rates in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrutalOptions {
    pub send_bps: u64,
    pub receive_bps: u64,
}

impl BrutalOptions {
    pub fn from_mbps(up_mbps: u64, down_mbps: u64) -> Self {
        Self {
            send_bps: up_mbps * 125_000,
            receive_bps: down_mbps * 125_000,
        }
    }
}

pub fn brutal_destination() -> NetLocation {
    NetLocation::new(Address::Hostname(BRUTAL_EXCHANGE_DOMAIN.to_string()), 0)
}

pub fn is_brutal_exchange(destination: &NetLocation) -> bool {
    destination.address().hostname() == Some(BRUTAL_EXCHANGE_DOMAIN)
}

pub fn encode_brutal_response(result: Result<u64, &str>) -> Vec<u8> {
    let mut out = vec![STATUS_SUCCESS];
    match result {
        Ok(receive_bps) => {
            out.push(1);
            out.extend_from_slice(&receive_bps.to_be_bytes());
        }
        Err(message) => {
            out.push(0);
            encode_vstring(message, &mut out);
        }
    }
    out
}

/// Reads the server's answer: the stream status, then its receive rate or refusal.
pub async fn read_brutal_response<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<u64> {
    read_response(reader).await?;
    if reader.read_u8().await? != 0 {
        Ok(reader.read_u64().await?)
    } else {
        let message = read_vstring(reader).await?;
        Err(std::io::Error::other(message))
    }
}

#[cfg(target_os = "linux")]
pub fn set_brutal_options(socket: &socket2::Socket, send_bps: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    #[repr(C, packed)]
    struct BrutalParams {
        rate: u64,
        cwnd_gain: u32,
    }

    let fd = socket.as_raw_fd();
    let name = b"brutal";
    // SAFETY: fd is a live socket owned by `socket`, and the option value points to `name`.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            name.as_ptr() as *const libc::c_void,
            name.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let e = std::io::Error::last_os_error();
        return Err(std::io::Error::new(
            e.kind(),
            format!("set TCP_CONGESTION: {e}"),
        ));
    }

    let params = BrutalParams {
        rate: send_bps,
        cwnd_gain: BRUTAL_CWND_GAIN,
    };
    // SAFETY: params is a plain packed struct that lives for the duration of the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            TCP_BRUTAL_PARAMS,
            &params as *const BrutalParams as *const libc::c_void,
            std::mem::size_of::<BrutalParams>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let e = std::io::Error::last_os_error();
        return Err(std::io::Error::new(
            e.kind(),
            format!("set TCP_BRUTAL_PARAMS: {e}"),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_brutal_options(_socket: &socket2::Socket, _send_bps: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "TCP Brutal is only available on Linux",
    ))
}

fn apply(socket: Option<&socket2::Socket>, send_bps: u64) -> std::io::Result<()> {
    match socket {
        Some(socket) => set_brutal_options(socket, send_bps),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "TCP Brutal requires a raw TCP connection",
        )),
    }
}

/// Runs the client side of the exchange on a fresh stream of `session`.
pub async fn client_exchange(
    session: &Session,
    socket: Option<&socket2::Socket>,
    options: &BrutalOptions,
) -> std::io::Result<u64> {
    let mut stream = session.open().await?;
    let request = StreamRequest::tcp(brutal_destination());
    let mut frame = Vec::with_capacity(request.encoded_len() + 8);
    request.write_to(&mut frame);
    frame.extend_from_slice(&options.receive_bps.to_be_bytes());
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let server_receive_bps = read_brutal_response(&mut stream).await?;
    let _ = stream.shutdown().await;

    let send_bps = options.send_bps.min(server_receive_bps);
    apply(socket, send_bps)?;
    Ok(send_bps)
}

/// Runs the server side of the exchange. The stream request has already been consumed.
pub async fn serve_exchange<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    socket: Option<&socket2::Socket>,
    options: Option<&BrutalOptions>,
) -> std::io::Result<()> {
    let client_receive_bps = stream.read_u64().await?;
    let response = match options {
        None => encode_brutal_response(Err("brutal is not enabled by the server")),
        Some(_) if client_receive_bps < BRUTAL_MIN_SPEED_BPS => {
            encode_brutal_response(Err("client receive bandwidth too low"))
        }
        Some(options) => {
            let send_bps = options.send_bps.min(client_receive_bps);
            match apply(socket, send_bps) {
                Ok(()) => encode_brutal_response(Ok(options.receive_bps)),
                Err(e) => encode_brutal_response(Err(&format!("enable TCP Brutal: {e}"))),
            }
        }
    };
    stream.write_all(&response).await?;
    stream.flush().await?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::protocol::read_stream_request;

    #[tokio::test]
    async fn test_disabled_server_refuses() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&1_000_000u64.to_be_bytes()).await.unwrap();
        serve_exchange(&mut server, None, None).await.unwrap();
        let err = read_brutal_response(&mut client).await.unwrap_err();
        assert_eq!(err.to_string(), "brutal is not enabled by the server");
    }

    #[tokio::test]
    async fn test_low_client_bandwidth_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&(BRUTAL_MIN_SPEED_BPS - 1).to_be_bytes())
            .await
            .unwrap();
        let options = BrutalOptions::from_mbps(10, 10);
        serve_exchange(&mut server, None, Some(&options)).await.unwrap();
        let err = read_brutal_response(&mut client).await.unwrap_err();
        assert_eq!(err.to_string(), "client receive bandwidth too low");
    }

    #[tokio::test]
    async fn test_socket_option_failure_fails_exchange() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&10_000_000u64.to_be_bytes()).await.unwrap();
        let options = BrutalOptions::from_mbps(10, 10);
        serve_exchange(&mut server, None, Some(&options)).await.unwrap();
        let err = read_brutal_response(&mut client).await.unwrap_err();
        assert!(err.to_string().starts_with("enable TCP Brutal: "), "{err}");
    }

    #[tokio::test]
    async fn test_accepted_response() {
        let encoded = encode_brutal_response(Ok(1_250_000));
        assert_eq!(read_brutal_response(&mut &encoded[..]).await.unwrap(), 1_250_000);
    }

    #[tokio::test]
    async fn test_exchange_request_encoding() {
        let request = StreamRequest::tcp(brutal_destination());
        let encoded = request.encode();
        let decoded = read_stream_request(&mut &encoded[..]).await.unwrap();
        assert!(is_brutal_exchange(&decoded.destination));
        assert_eq!(decoded.destination.port(), 0);
    }
}
