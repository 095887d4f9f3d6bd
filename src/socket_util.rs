use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device_supported() -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device_supported() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "bind_interface is not supported on this platform",
    ))
}

pub fn new_udp_socket(
    is_ipv6: bool,
    bind_interface: Option<&str>,
) -> std::io::Result<tokio::net::UdpSocket> {
    let bind_addr = if is_ipv6 { "[::]:0" } else { "0.0.0.0:0" };
    let std_socket = std::net::UdpSocket::bind(bind_addr)?;
    std_socket.set_nonblocking(true)?;
    let socket = tokio::net::UdpSocket::from_std(std_socket)?;
    if let Some(interface) = bind_interface {
        bind_device_supported()?;
        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        socket.bind_device(Some(interface.as_bytes()))?;
        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        let _ = interface;
    }
    Ok(socket)
}

pub fn new_tcp_socket(
    is_ipv6: bool,
    bind_interface: Option<&str>,
) -> std::io::Result<tokio::net::TcpSocket> {
    let socket = if is_ipv6 {
        tokio::net::TcpSocket::new_v6()?
    } else {
        tokio::net::TcpSocket::new_v4()?
    };
    if let Some(interface) = bind_interface {
        bind_device_supported()?;
        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        socket.bind_device(Some(interface.as_bytes()))?;
        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        let _ = interface;
    }
    Ok(socket)
}

pub fn set_tcp_keepalive(
    stream: &tokio::net::TcpStream,
    idle: Duration,
    interval: Duration,
) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(idle);
    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows",
    ))]
    let keepalive = keepalive.with_interval(interval);
    #[cfg(not(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows",
    )))]
    let _ = interval;
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keepalive_on_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = new_tcp_socket(false, None).unwrap();
        let stream = socket.connect(addr).await.unwrap();
        set_tcp_keepalive(&stream, Duration::from_secs(120), Duration::from_secs(30)).unwrap();
        assert!(SockRef::from(&stream).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_udp_socket_family() {
        let socket = new_udp_socket(false, None).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }
}
