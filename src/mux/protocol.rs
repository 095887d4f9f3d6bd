//! Session and stream handshake encoding shared by the mux client and server.

use bytes::{BufMut, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::address::{Address, NetLocation, read_socks_addr, write_socks_addr};
use crate::metadata::Network;

pub const VERSION_0: u8 = 0;
pub const VERSION_1: u8 = 1;

pub const FLAG_UDP: u16 = 1;
pub const FLAG_ADDR: u16 = 2;

pub const STATUS_SUCCESS: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// Hostname a client dials to reach the mux service through an ordinary inbound.
pub const MUX_DESTINATION_HOST: &str = "sp.mux.sing-box.arpa";
pub const MUX_DESTINATION_PORT: u16 = 444;

pub fn mux_destination() -> NetLocation {
    NetLocation::new(Address::Hostname(MUX_DESTINATION_HOST.to_string()), MUX_DESTINATION_PORT)
}

pub fn is_mux_destination(location: &NetLocation) -> bool {
    location.port() == MUX_DESTINATION_PORT
        && location.address().hostname() == Some(MUX_DESTINATION_HOST)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Smux,
    Yamux,
    H2Mux,
}

impl Protocol {
    pub fn id(self) -> u8 {
        match self {
            Protocol::Smux => 0,
            Protocol::Yamux => 1,
            Protocol::H2Mux => 2,
        }
    }

    pub fn from_id(id: u8) -> std::io::Result<Self> {
        match id {
            0 => Ok(Protocol::Smux),
            1 => Ok(Protocol::Yamux),
            2 => Ok(Protocol::H2Mux),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsupported protocol: {id}"),
            )),
        }
    }

    pub fn from_name(name: &str) -> std::io::Result<Self> {
        match name {
            "" | "smux" => Ok(Protocol::Smux),
            "yamux" => Ok(Protocol::Yamux),
            "h2mux" => Ok(Protocol::H2Mux),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown multiplex protocol: {name}"),
            )),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Smux => write!(f, "smux"),
            Protocol::Yamux => write!(f, "yamux"),
            Protocol::H2Mux => write!(f, "h2mux"),
        }
    }
}

/// The first bytes of every physical mux connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    pub version: u8,
    pub protocol: Protocol,
    pub padding: bool,
}

impl SessionRequest {
    /// Version 1 is used only when padding is wanted; version 0 peers cannot parse the flag.
    pub fn new(protocol: Protocol, padding: bool) -> Self {
        Self {
            version: if padding { VERSION_1 } else { VERSION_0 },
            protocol,
            padding,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 1 + 2 + 767);
        out.push(self.version);
        out.push(self.protocol.id());
        if self.version >= VERSION_1 {
            out.push(self.padding as u8);
            if self.padding {
                let mut rng = rand::rng();
                let len: u16 = rng.random_range(256..768);
                out.extend_from_slice(&len.to_be_bytes());
                let start = out.len();
                out.resize(start + len as usize, 0);
                rng.fill(&mut out[start..]);
            }
        }
        out
    }
}

pub async fn read_session_request<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<SessionRequest> {
    let version = reader.read_u8().await?;
    if version > VERSION_1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported version: {version}"),
        ));
    }
    let protocol = Protocol::from_id(reader.read_u8().await?)?;
    let mut padding = false;
    if version >= VERSION_1 {
        padding = reader.read_u8().await? != 0;
        if padding {
            let len = reader.read_u16().await? as u64;
            let skipped =
                tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
            if skipped != len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "truncated session padding",
                ));
            }
        }
    }
    Ok(SessionRequest {
        version,
        protocol,
        padding,
    })
}

/// The header carried at the start of every logical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub network: Network,
    pub destination: NetLocation,
    /// UDP only: every packet carries its own address.
    pub packet_addr: bool,
}

impl StreamRequest {
    pub fn tcp(destination: NetLocation) -> Self {
        Self {
            network: Network::Tcp,
            destination,
            packet_addr: false,
        }
    }

    pub fn udp(destination: NetLocation) -> Self {
        Self {
            network: Network::Udp,
            destination,
            packet_addr: false,
        }
    }

    pub fn udp_addr() -> Self {
        Self {
            network: Network::Udp,
            destination: mux_destination(),
            packet_addr: true,
        }
    }

    pub fn encoded_len(&self) -> usize {
        2 + self.destination.serialized_len()
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        let mut flags = 0u16;
        if self.network == Network::Udp {
            flags |= FLAG_UDP;
            if self.packet_addr {
                flags |= FLAG_ADDR;
            }
        }
        buf.put_u16(flags);
        write_socks_addr(&self.destination, buf);
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf
    }
}

pub async fn read_stream_request<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
) -> std::io::Result<StreamRequest> {
    let flags = reader.read_u16().await?;
    let destination = read_socks_addr(reader).await?;
    let network = if flags & FLAG_UDP != 0 {
        Network::Udp
    } else {
        Network::Tcp
    };
    Ok(StreamRequest {
        network,
        destination,
        packet_addr: network == Network::Udp && flags & FLAG_ADDR != 0,
    })
}

pub fn encode_uvarint(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub async fn read_uvarint<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> std::io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for i in 0..10 {
        let byte = reader.read_u8().await?;
        if byte < 0x80 {
            if i == 9 && byte > 1 {
                break;
            }
            return Ok(value | (byte as u64) << shift);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "uvarint overflows a 64-bit integer",
    ))
}

pub fn encode_vstring(value: &str, out: &mut Vec<u8>) {
    encode_uvarint(value.len() as u64, out);
    out.extend_from_slice(value.as_bytes());
}

// Error strings are short; anything larger is a corrupt stream.
const MAX_VSTRING_LEN: u64 = 64 * 1024;

pub async fn read_vstring<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> std::io::Result<String> {
    let len = read_uvarint(reader).await?;
    if len > MAX_VSTRING_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("string too long: {len}"),
        ));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    String::from_utf8(data).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, format!("invalid string: {e}"))
    })
}

pub fn encode_response(error: Option<&str>) -> Vec<u8> {
    match error {
        None => vec![STATUS_SUCCESS],
        Some(message) => {
            let mut out = Vec::with_capacity(1 + 2 + message.len());
            out.push(STATUS_ERROR);
            encode_vstring(message, &mut out);
            out
        }
    }
}

pub fn remote_error(message: &str) -> std::io::Error {
    std::io::Error::other(format!("remote error: {message}"))
}

/// Reads a stream response, turning an error status into `remote error: <message>`.
pub async fn read_response<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> std::io::Result<()> {
    match reader.read_u8().await? {
        STATUS_SUCCESS => Ok(()),
        STATUS_ERROR => {
            let message = read_vstring(reader).await?;
            Err(remote_error(&message))
        }
        status => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected response status: {status}"),
        )),
    }
}

/// Parses a uvarint from the start of `data`. `Ok(None)` means more bytes are needed.
pub fn parse_uvarint(data: &[u8]) -> std::io::Result<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, byte) in data.iter().take(10).enumerate() {
        if *byte < 0x80 {
            if i == 9 && *byte > 1 {
                break;
            }
            return Ok(Some((value | (*byte as u64) << (7 * i), i + 1)));
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
    }
    if data.len() < 10 {
        return Ok(None);
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "uvarint overflows a 64-bit integer",
    ))
}

/// Parses a stream response from buffered bytes: the error message if any, and the bytes used.
pub fn parse_response(data: &[u8]) -> std::io::Result<Option<(Option<String>, usize)>> {
    let Some(&status) = data.first() else {
        return Ok(None);
    };
    match status {
        STATUS_SUCCESS => Ok(Some((None, 1))),
        STATUS_ERROR => {
            let Some((len, varint_len)) = parse_uvarint(&data[1..])? else {
                return Ok(None);
            };
            if len > MAX_VSTRING_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("string too long: {len}"),
                ));
            }
            let start = 1 + varint_len;
            let end = start + len as usize;
            if data.len() < end {
                return Ok(None);
            }
            let message = String::from_utf8_lossy(&data[start..end]).into_owned();
            Ok(Some((Some(message), end)))
        }
        status => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected response status: {status}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_version_zero_request() {
        let data = [VERSION_0, 1];
        let request = read_session_request(&mut &data[..]).await.unwrap();
        assert_eq!(request.protocol, Protocol::Yamux);
        assert!(!request.padding);
    }

    #[tokio::test]
    async fn test_version_one_without_padding_matches_version_zero() {
        let data = [VERSION_1, 0, 0, 0xaa];
        let mut reader = &data[..];
        let request = read_session_request(&mut reader).await.unwrap();
        assert_eq!(request.protocol, Protocol::Smux);
        assert!(!request.padding);
        assert_eq!(reader, &[0xaau8][..]);
    }

    #[tokio::test]
    async fn test_padding_is_skipped_exactly() {
        let mut data = vec![VERSION_1, 0, 1, 0x01, 0x2c];
        data.extend(std::iter::repeat_n(0x55, 300));
        data.extend_from_slice(b"next");
        let mut reader = &data[..];
        let request = read_session_request(&mut reader).await.unwrap();
        assert!(request.padding);
        assert_eq!(reader, b"next");
    }

    #[tokio::test]
    async fn test_encoded_padding_length_in_range() {
        let encoded = SessionRequest::new(Protocol::Smux, true).encode();
        assert_eq!(&encoded[..3], &[VERSION_1, 0, 1]);
        let len = u16::from_be_bytes([encoded[3], encoded[4]]) as usize;
        assert!((256..768).contains(&len));
        assert_eq!(encoded.len(), 5 + len);

        let decoded = read_session_request(&mut &encoded[..]).await.unwrap();
        assert!(decoded.padding);
    }

    #[tokio::test]
    async fn test_unsupported_version_and_protocol() {
        let err = read_session_request(&mut &[2u8, 0][..]).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported version: 2");
        let err = read_session_request(&mut &[0u8, 7][..]).await.unwrap_err();
        assert_eq!(err.to_string(), "unsupported protocol: 7");
    }

    #[tokio::test]
    async fn test_stream_request_flags() {
        let request = StreamRequest::udp_addr();
        let encoded = request.encode();
        assert_eq!(&encoded[..2], &[0, 3]);
        assert_eq!(encoded.len(), request.encoded_len());
        let decoded = read_stream_request(&mut &encoded[..]).await.unwrap();
        assert_eq!(decoded, request);
        assert!(is_mux_destination(&decoded.destination));

        // The address flag means nothing on TCP streams.
        let mut tcp = StreamRequest::tcp(NetLocation::from_str("1.2.3.4:80", None).unwrap())
            .encode()
            .to_vec();
        tcp[1] = FLAG_ADDR as u8;
        let decoded = read_stream_request(&mut &tcp[..]).await.unwrap();
        assert_eq!(decoded.network, Network::Tcp);
        assert!(!decoded.packet_addr);
    }

    #[tokio::test]
    async fn test_error_response_message() {
        let encoded = encode_response(Some("dial tcp: connection refused"));
        let err = read_response(&mut &encoded[..]).await.unwrap_err();
        assert_eq!(err.to_string(), "remote error: dial tcp: connection refused");
        assert!(read_response(&mut &encode_response(None)[..]).await.is_ok());
    }

    #[test]
    fn test_parse_response_needs_whole_message() {
        let encoded = encode_response(Some("refused"));
        assert!(parse_response(&encoded[..3]).unwrap().is_none());
        let (message, used) = parse_response(&encoded).unwrap().unwrap();
        assert_eq!(message.as_deref(), Some("refused"));
        assert_eq!(used, encoded.len());
        assert_eq!(parse_response(&[STATUS_SUCCESS, 9]).unwrap(), Some((None, 1)));
        assert!(parse_response(&[7]).is_err());
    }

    #[tokio::test]
    async fn test_uvarint_multi_byte() {
        let mut out = Vec::new();
        encode_uvarint(300, &mut out);
        assert_eq!(out, vec![0xac, 0x02]);
        assert_eq!(read_uvarint(&mut &out[..]).await.unwrap(), 300);
        assert_eq!(parse_uvarint(&out).unwrap(), Some((300, 2)));
        assert_eq!(parse_uvarint(&out[..1]).unwrap(), None);
    }
}
