//! Linux io_uring event loop implementations.
//!
//! Completion-based I/O: accept, read and write are submitted to the ring
//! and the loop waits for their completions.
//!
//! - `SerialServer` keeps exactly one operation in flight, so clients are
//!   served strictly one after another.
//! - `PipelinedServer` tags every submission with a token and keeps many
//!   connections in flight at once.

mod event_loop;
mod serial;
mod token;

pub use event_loop::PipelinedServer;
pub use serial::SerialServer;
pub(crate) use token::{OpType, TokenAllocator};

use crate::config::{Config, UringMode};
use crate::resource::StaticResource;
use io_uring::{squeue, IoUring};
use socket2::SockRef;
use std::io::{self, Read};
use std::net::TcpListener;
use std::os::unix::io::OwnedFd;
use tracing::warn;

/// Bytes read from each request.
const MAX_MESSAGE_LEN: usize = 2048;

/// Upper bound on reads spent discarding input before a close.
const MAX_DISCARD_READS: usize = 64;

/// Run the server using the io_uring backend.
pub fn run(listener: TcpListener, resource: StaticResource, config: &Config) -> io::Result<()> {
    match config.uring_mode {
        UringMode::Serial => {
            if config.idle_timeout.is_some() {
                warn!("Idle timeout is ignored by the serial io_uring engine");
            }
            SerialServer::new(listener, resource, config)?.run()
        }
        UringMode::Pipelined => PipelinedServer::new(listener, resource, config)?.run(),
    }
}

/// Push an entry, flushing the submission queue once if it is full.
fn push(ring: &mut IoUring, entry: &squeue::Entry) -> io::Result<()> {
    // SAFETY: callers keep every buffer referenced by `entry` alive until
    // its completion has been reaped.
    if unsafe { ring.submission().push(entry) }.is_ok() {
        return Ok(());
    }

    ring.submit()?;
    unsafe { ring.submission().push(entry) }
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))
}

/// Read and drop whatever the peer has already sent. Closing a socket with
/// unread input resets the connection, which throws away response bytes the
/// peer has not received yet.
fn discard_input(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let socket = SockRef::from(fd);
    socket.set_nonblocking(true)?;

    let mut discarded = 0;
    for _ in 0..MAX_DISCARD_READS {
        match (&*socket).read(buf) {
            Ok(0) => break,
            Ok(n) => discarded += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(discarded)
}

/// Errno carried by a negative completion result.
fn completion_error(result: i32) -> io::Error {
    io::Error::from_raw_os_error(-result)
}
