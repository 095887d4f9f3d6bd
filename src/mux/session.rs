use super::protocol::Protocol;
use super::smux::{Side, SmuxSession};
use super::yamux_session::YamuxSession;
use crate::bufio::AsyncStream;

pub type MuxStream = Box<dyn AsyncStream>;

/// A physical connection carrying multiplexed streams.
#[derive(Debug)]
pub enum Session {
    Smux(SmuxSession),
    Yamux(YamuxSession),
}

impl Session {
    pub fn new<S>(conn: S, protocol: Protocol, side: Side) -> std::io::Result<Self>
    where
        S: AsyncStream + 'static,
    {
        match protocol {
            Protocol::Smux => Ok(Session::Smux(SmuxSession::new(conn, side))),
            Protocol::Yamux => Ok(Session::Yamux(YamuxSession::new(conn, side))),
            Protocol::H2Mux => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unsupported protocol: h2mux",
            )),
        }
    }

    pub async fn open(&self) -> std::io::Result<MuxStream> {
        match self {
            Session::Smux(session) => Ok(Box::new(session.open_stream()?)),
            Session::Yamux(session) => Ok(Box::new(session.open_stream().await?)),
        }
    }

    pub async fn accept(&self) -> Option<MuxStream> {
        match self {
            Session::Smux(session) => Some(Box::new(session.accept_stream().await?)),
            Session::Yamux(session) => Some(Box::new(session.accept_stream().await?)),
        }
    }

    pub fn num_streams(&self) -> usize {
        match self {
            Session::Smux(session) => session.num_streams(),
            Session::Yamux(session) => session.num_streams(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Session::Smux(session) => session.is_closed(),
            Session::Yamux(session) => session.is_closed(),
        }
    }

    pub fn can_take_new_request(&self) -> bool {
        !self.is_closed()
    }

    pub fn close(&self) {
        match self {
            Session::Smux(session) => session.close(),
            Session::Yamux(session) => session.close(),
        }
    }
}
