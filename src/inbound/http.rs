//! HTTP proxy inbound: `CONNECT` tunnels and plain forwarded requests.

use tokio::net::TcpStream;

use super::{Accepted, Inbound, Reply, ReplyStream, with_leftover};
use crate::address::NetLocation;
use crate::buf::Buffer;
use crate::bufio::{AsyncStream, CachedStream};
use crate::http_handler::{HttpRequestKind, read_request};
use crate::metadata::Network;
use crate::stream_reader::StreamReader;

pub(super) async fn accept(
    inbound: &Inbound,
    mut stream: TcpStream,
    mut reader: StreamReader,
    source: NetLocation,
    users: &[(String, String)],
) -> std::io::Result<Accepted> {
    let request = read_request(&mut stream, &mut reader, users).await?;
    let mut metadata = inbound.metadata(Network::Tcp, source, request.location.clone());
    metadata.inbound_user = request.user.clone();
    let reply = Reply::http(&request);

    let stream: Box<dyn AsyncStream> = match request.kind {
        HttpRequestKind::Connect => with_leftover(stream, reader),
        HttpRequestKind::Forward => {
            // The rewritten request goes upstream first, then any body bytes already read.
            let mut initial = request.initial_data;
            initial.extend_from_slice(reader.unparsed_data());
            Box::new(CachedStream::new(stream, Buffer::from_vec(initial)))
        }
    };
    Ok(Accepted::Stream(Box::new(ReplyStream::new(stream, reply)), metadata))
}
