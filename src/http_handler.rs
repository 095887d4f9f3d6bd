//! HTTP proxy wire handling shared by the HTTP inbound and the HTTP CONNECT outbound.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::address::{Address, NetLocation};
use crate::stream_reader::StreamReader;

const PROXY_AUTH_HEADER_PREFIX: &str = "proxy-authorization: basic ";
const CONNECTION_HEADER_PREFIX: &str = "connection: ";
const PROXY_CONNECTION_HEADER_PREFIX: &str = "proxy-connection: ";
const MAX_FORWARD_HEADER_LEN: usize = 16384;

pub fn create_http_auth_token(username: &str, password: &str) -> String {
    BASE64.encode(format!("{username}:{password}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpRequestKind {
    /// `CONNECT host:port`: the client expects a status line, then raw bytes.
    Connect,
    /// Absolute-form request (`GET http://host/ HTTP/1.1`), forwarded as origin-form.
    Forward,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub kind: HttpRequestKind,
    pub location: NetLocation,
    pub http_version: String,
    pub user: Option<String>,
    /// Bytes to send upstream before relaying: the rewritten request for `Forward`.
    pub initial_data: Vec<u8>,
}

impl HttpRequest {
    /// The reply a `Connect` client waits for. `Forward` clients get the origin's own response.
    pub fn success_response(&self) -> Option<Vec<u8>> {
        match self.kind {
            HttpRequestKind::Connect => Some(
                format!("{} 200 Connection established\r\n\r\n", self.http_version).into_bytes(),
            ),
            HttpRequestKind::Forward => None,
        }
    }

    pub fn failure_response(&self) -> Vec<u8> {
        format!(
            "{} 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            self.http_version
        )
        .into_bytes()
    }
}

fn invalid_input(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, message.into())
}

fn parse_host_port(address: &str, default_port: Option<u16>) -> std::io::Result<NetLocation> {
    NetLocation::from_str(address, default_port)
        .map_err(|e| invalid_input(format!("invalid address {address}: {e}")))
}

/// Matches a `Proxy-Authorization` value against the configured users.
fn find_user<'a>(token: &str, users: &'a [(String, String)]) -> Option<&'a str> {
    users
        .iter()
        .find(|(username, password)| create_http_auth_token(username, password) == token)
        .map(|(username, _)| username.as_str())
}

async fn reject_auth<S: AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    http_version: &str,
) -> std::io::Result<()> {
    // FoxyProxy and similar clients require Proxy-Authenticate to send credentials.
    stream
        .write_all(
            format!(
                "{http_version} 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await?;
    stream.flush().await
}

/// Reads one proxy request and its headers. Writes a 407 when authentication is missing.
///
/// Bytes sent after the headers are left in `reader`.
pub async fn read_request<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    reader: &mut StreamReader,
    users: &[(String, String)],
) -> std::io::Result<HttpRequest> {
    let line = reader.read_line(stream).await?.to_string();
    if !line.ends_with(" HTTP/1.0") && !line.ends_with(" HTTP/1.1") {
        return Err(invalid_input(format!("unrecognized http request: {line}")));
    }
    let http_version = line[line.len() - 8..].to_string();
    let request_line = &line[..line.len() - 9];
    let (method, target) = request_line
        .split_once(' ')
        .ok_or_else(|| invalid_input(format!("invalid http request: {line}")))?;

    let (kind, location, mut forward) = if method == "CONNECT" {
        (HttpRequestKind::Connect, parse_host_port(target, None)?, None)
    } else {
        let url = target
            .strip_prefix("http://")
            .ok_or_else(|| invalid_input(format!("unsupported http forward url: {target}")))?;
        let (address, path) = match url.find('/') {
            Some(i) => (&url[..i], &url[i..]),
            None => (url, "/"),
        };
        (
            HttpRequestKind::Forward,
            parse_host_port(address, Some(80))?,
            Some(format!("{method} {path} {http_version}\r\n")),
        )
    };

    let mut user = None;
    loop {
        let line = reader.read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        let lowercase_line = line.to_ascii_lowercase();
        if lowercase_line.starts_with(PROXY_AUTH_HEADER_PREFIX) {
            let token = &line[PROXY_AUTH_HEADER_PREFIX.len()..];
            if !users.is_empty() {
                match find_user(token, users) {
                    Some(name) => user = Some(name.to_string()),
                    None => debug!("[Http] incorrect proxy authentication: {token}"),
                }
            }
            continue;
        }
        let Some(request) = forward.as_mut() else {
            continue;
        };
        // Keep-alive would require parsing responses to find request boundaries.
        if lowercase_line.starts_with(CONNECTION_HEADER_PREFIX)
            || lowercase_line.starts_with(PROXY_CONNECTION_HEADER_PREFIX)
        {
            continue;
        }
        request.push_str(line);
        request.push_str("\r\n");
        if request.len() > MAX_FORWARD_HEADER_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "http forward request is too long",
            ));
        }
    }

    if !users.is_empty() && user.is_none() {
        reject_auth(stream, &http_version).await?;
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "missing or incorrect http proxy authentication",
        ));
    }

    let initial_data = match forward {
        Some(mut request) => {
            request.push_str("Connection: close\r\n\r\n");
            request.into_bytes()
        }
        None => Vec::new(),
    };
    Ok(HttpRequest {
        kind,
        location,
        http_version,
        user,
        initial_data,
    })
}

fn host_port(location: &NetLocation) -> String {
    match location.address() {
        Address::Ipv6(addr) => format!("[{addr}]:{}", location.port()),
        address => format!("{address}:{}", location.port()),
    }
}

/// Sends `CONNECT` and waits for a 2xx reply. Bytes after the reply headers stay in `reader`.
pub async fn client_connect<S: AsyncRead + AsyncWrite + Unpin + ?Sized>(
    stream: &mut S,
    reader: &mut StreamReader,
    auth: Option<&(String, String)>,
    location: &NetLocation,
) -> std::io::Result<()> {
    let target = host_port(location);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some((username, password)) = auth {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            create_http_auth_token(username, password)
        ));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let line = reader.read_line(stream).await?;
    let status = line
        .strip_prefix("HTTP/1.1 ")
        .or_else(|| line.strip_prefix("HTTP/1.0 "))
        .and_then(|rest| rest.get(..3))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid http response: {line}"),
            )
        })?;
    if status == 407 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "http proxy authentication required",
        ));
    }
    if !(200..300).contains(&status) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("HTTP CONNECT request failed: {line}"),
        ));
    }
    loop {
        if reader.read_line(stream).await?.is_empty() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn users() -> Vec<(String, String)> {
        vec![("user".to_string(), "pass".to_string())]
    }

    #[tokio::test]
    async fn test_connect_round_trip_with_auth() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut reader = StreamReader::new();
            let request = read_request(&mut server, &mut reader, &users()).await.unwrap();
            let response = request.success_response().unwrap();
            server.write_all(&response).await.unwrap();
            server.write_all(b"early").await.unwrap();
            request
        });

        let auth = ("user".to_string(), "pass".to_string());
        let target = NetLocation::from_str("[::1]:443", None).unwrap();
        let mut reader = StreamReader::new();
        client_connect(&mut client, &mut reader, Some(&auth), &target)
            .await
            .unwrap();

        let request = server_task.await.unwrap();
        assert_eq!(request.kind, HttpRequestKind::Connect);
        assert_eq!(request.location, target);
        assert_eq!(request.user.as_deref(), Some("user"));
        assert!(request.initial_data.is_empty());

        let mut early = reader.unparsed_data().to_vec();
        while early.len() < 5 {
            let mut buf = [0u8; 5];
            let n = client.read(&mut buf[..5 - early.len()]).await.unwrap();
            early.extend_from_slice(&buf[..n]);
        }
        assert_eq!(early, b"early");
    }

    #[tokio::test]
    async fn test_missing_auth_gets_407() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            let mut reader = StreamReader::new();
            read_request(&mut server, &mut reader, &users()).await
        });
        let mut reader = StreamReader::new();
        let target = NetLocation::from_str("example.com:443", None).unwrap();
        let err = client_connect(&mut client, &mut reader, None, &target)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
        let server_err = server_task.await.unwrap().unwrap_err();
        assert_eq!(server_err.kind(), std::io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_forward_request_is_rewritten() {
        let (mut client, mut stream) = tokio::io::duplex(4096);
        client
            .write_all(b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();
        let mut reader = StreamReader::new();
        let request = read_request(&mut stream, &mut reader, &[]).await.unwrap();
        assert_eq!(request.kind, HttpRequestKind::Forward);
        assert_eq!(request.location.to_string(), "example.com:80");
        assert!(request.success_response().is_none());
        assert_eq!(
            String::from_utf8(request.initial_data).unwrap(),
            "GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nConnection: close\r\n\r\n"
        );
    }

    #[tokio::test]
    async fn test_https_forward_rejected() {
        let (mut client, mut stream) = tokio::io::duplex(4096);
        client
            .write_all(b"GET https://example.com/ HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut reader = StreamReader::new();
        let err = read_request(&mut stream, &mut reader, &[]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
