use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::net::TcpStream;

/// Called with the number of bytes that passed a counting layer.
pub type CountFn = Arc<dyn Fn(u64) + Send + Sync>;

/// How a wrapper relates to the connection it wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Bytes pass unchanged; capabilities of the inner connection may be used directly.
    Passthrough,
    /// Bytes are framed, encrypted or otherwise rewritten; the walk stops here.
    Transforming,
}

pub trait Upstream {
    fn layer(&self) -> Layer {
        Layer::Transforming
    }

    /// The wrapped connection, if any.
    fn upstream(&self) -> Option<&dyn Upstream> {
        None
    }

    fn tcp_stream(&self) -> Option<&TcpStream> {
        None
    }

    fn read_counter(&self) -> Option<&CountFn> {
        None
    }

    fn write_counter(&self) -> Option<&CountFn> {
        None
    }

    fn need_additional_read_deadline(&self) -> bool {
        false
    }

    /// Bytes this layer alone prepends to every write, excluding what wrapped layers add.
    fn own_front_headroom(&self) -> usize {
        0
    }
}

/// Checks `node` and then each wrapped connection beneath passthrough layers.
///
/// The first node whose layer is `Transforming` is still checked, but nothing below it is.
pub fn find_capability<'a, T>(
    node: &'a dyn Upstream,
    check: impl Fn(&'a dyn Upstream) -> Option<T>,
) -> Option<T> {
    let mut current = node;
    loop {
        if let Some(found) = check(current) {
            return Some(found);
        }
        if current.layer() == Layer::Transforming {
            return None;
        }
        current = current.upstream()?;
    }
}

fn collect_counters<'a>(
    node: &'a dyn Upstream,
    pick: impl Fn(&'a dyn Upstream) -> Option<&'a CountFn>,
) -> Vec<CountFn> {
    let mut counters = Vec::new();
    let mut current = node;
    loop {
        if let Some(counter) = pick(current) {
            counters.push(counter.clone());
        }
        if current.layer() == Layer::Transforming {
            break;
        }
        match current.upstream() {
            Some(next) => current = next,
            None => break,
        }
    }
    counters
}

pub fn collect_read_counters(node: &dyn Upstream) -> Vec<CountFn> {
    collect_counters(node, |n| n.read_counter())
}

pub fn collect_write_counters(node: &dyn Upstream) -> Vec<CountFn> {
    collect_counters(node, |n| n.write_counter())
}

pub fn need_additional_read_deadline(node: &dyn Upstream) -> bool {
    find_capability(node, |n| n.need_additional_read_deadline().then_some(())).is_some()
}

/// Sums the front headroom of every layer from `node` down to the innermost connection.
///
/// Every layer may prepend a header, transforming or not, so the walk does not stop early.
pub fn calculate_front_headroom(node: &dyn Upstream) -> usize {
    let mut total = node.own_front_headroom();
    let mut current = node.upstream();
    while let Some(next) = current {
        total += next.own_front_headroom();
        current = next.upstream();
    }
    total
}

impl Upstream for TcpStream {
    fn tcp_stream(&self) -> Option<&TcpStream> {
        Some(self)
    }
}

impl Upstream for DuplexStream {
    fn need_additional_read_deadline(&self) -> bool {
        true
    }
}

#[cfg(unix)]
impl Upstream for tokio::net::UnixStream {}

impl<T: Upstream + ?Sized> Upstream for Box<T> {
    fn layer(&self) -> Layer {
        (**self).layer()
    }

    fn upstream(&self) -> Option<&dyn Upstream> {
        (**self).upstream()
    }

    fn tcp_stream(&self) -> Option<&TcpStream> {
        (**self).tcp_stream()
    }

    fn read_counter(&self) -> Option<&CountFn> {
        (**self).read_counter()
    }

    fn write_counter(&self) -> Option<&CountFn> {
        (**self).write_counter()
    }

    fn need_additional_read_deadline(&self) -> bool {
        (**self).need_additional_read_deadline()
    }

    fn own_front_headroom(&self) -> usize {
        (**self).own_front_headroom()
    }
}
