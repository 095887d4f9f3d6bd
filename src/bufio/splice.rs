//! Zero-copy relaying between two TCP sockets through a kernel pipe.

use tokio::net::TcpStream;

use super::upstream::CountFn;

/// Moves bytes from `src` to `dst` until EOF.
///
/// Returns `Ok(None)` when splicing is unavailable and nothing was moved yet, so the caller can
/// fall back to a userspace copy.
#[cfg(target_os = "linux")]
pub(super) async fn splice(
    dst: &TcpStream,
    src: &TcpStream,
    read_counters: &[CountFn],
    write_counters: &[CountFn],
) -> std::io::Result<Option<u64>> {
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;

    const PIPE_CHUNK: usize = 1 << 16;

    let Some(pipe) = Pipe::new() else {
        return Ok(None);
    };
    let src_fd = src.as_raw_fd();
    let dst_fd = dst.as_raw_fd();
    let mut total: u64 = 0;

    loop {
        src.readable().await?;
        let moved = match src.try_io(Interest::READABLE, || {
            raw_splice(src_fd, pipe.write_fd, PIPE_CHUNK)
        }) {
            Ok(0) => return Ok(Some(total)),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) if total == 0 && is_unsupported(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        for counter in read_counters {
            counter(moved as u64);
        }

        let mut pending = moved;
        while pending > 0 {
            dst.writable().await?;
            match dst.try_io(Interest::WRITABLE, || {
                raw_splice(pipe.read_fd, dst_fd, pending)
            }) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "splice wrote zero bytes",
                    ));
                }
                Ok(n) => {
                    pending -= n;
                    total += n as u64;
                    for counter in write_counters {
                        counter(n as u64);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub(super) async fn splice(
    _dst: &TcpStream,
    _src: &TcpStream,
    _read_counters: &[CountFn],
    _write_counters: &[CountFn],
) -> std::io::Result<Option<u64>> {
    Ok(None)
}

/// Whether this platform can splice at all.
pub(super) fn splice_supported() -> bool {
    cfg!(target_os = "linux")
}

#[cfg(target_os = "linux")]
fn is_unsupported(error: &std::io::Error) -> bool {
    matches!(error.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS))
}

#[cfg(target_os = "linux")]
fn raw_splice(fd_in: i32, fd_out: i32, len: usize) -> std::io::Result<usize> {
    let ret = unsafe {
        libc::splice(
            fd_in,
            std::ptr::null_mut(),
            fd_out,
            std::ptr::null_mut(),
            len,
            libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK,
        )
    };
    if ret < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

#[cfg(target_os = "linux")]
struct Pipe {
    read_fd: i32,
    write_fd: i32,
}

#[cfg(target_os = "linux")]
impl Pipe {
    fn new() -> Option<Self> {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if ret != 0 {
            log::debug!(
                "[Splice] pipe2 failed: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        Some(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }
}

#[cfg(target_os = "linux")]
impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
