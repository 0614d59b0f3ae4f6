//! Connection state machine for managing TCP connections.
//!
//! Each connection reads one request, writes the canned response (possibly
//! across many partial writes), then closes. The same machine drives the
//! readiness engine, where it performs the I/O itself, and the completion
//! engine, where the ring performs the I/O and reports byte counts.

use crate::resource::StaticResource;
use crate::response::{Framing, Response};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, IoSlice, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};
use tracing::debug;

/// Upper bound on reads per readiness notification.
const MAX_DRAIN_READS: usize = 64;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, waiting for the first request byte.
    AwaitingRequest,
    /// Response built, `bytes_sent` bytes of it on the wire.
    ResponsePending,
    /// Terminal. The registry entry must be removed.
    Closed,
}

/// What the event loop should do next for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep (or start) waiting for input.
    AwaitReadable,
    /// Wait until the socket can take more output.
    AwaitWritable,
    /// Release the connection.
    Close,
}

/// A single client connection.
///
/// Generic over the socket so both engines share it. Dropping the
/// connection drops the socket, which closes the descriptor.
#[derive(Debug)]
pub struct Connection<S> {
    /// Socket owned by this connection.
    pub socket: S,
    fd: RawFd,
    identity: u64,
    state: ConnState,
    response: Option<Response>,
    bytes_sent: usize,
    last_activity: Instant,
}

impl<S> Connection<S> {
    fn new(socket: S, fd: RawFd, identity: u64) -> Self {
        Self {
            socket,
            fd,
            identity,
            state: ConnState::AwaitingRequest,
            response: None,
            bytes_sent: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Accept-order identity, for logs only.
    pub fn identity(&self) -> u64 {
        self.identity
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    #[cfg(test)]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// True when nothing has moved for at least `timeout`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }

    /// Record the outcome of a request read.
    ///
    /// Zero bytes means the peer closed before asking for anything, so no
    /// response is sent. Any byte at all is a complete enough request.
    pub fn request_received(&mut self, n: usize, resource: &StaticResource) -> Step {
        match self.state {
            ConnState::AwaitingRequest if n == 0 => {
                debug!(client = self.identity, "Connection closed by client");
                self.close()
            }
            ConnState::AwaitingRequest => {
                debug!(client = self.identity, bytes = n, "Received request");
                self.response = Some(Response::new(resource, Framing::Close));
                self.state = ConnState::ResponsePending;
                self.last_activity = Instant::now();
                Step::AwaitWritable
            }
            ConnState::ResponsePending => Step::AwaitWritable,
            ConnState::Closed => Step::Close,
        }
    }

    /// Account for `n` bytes the transport accepted.
    pub fn advance(&mut self, n: usize) -> Step {
        let total = match (&self.response, self.state) {
            (Some(response), ConnState::ResponsePending) => response.len(),
            _ => return self.next_step(),
        };

        self.bytes_sent = (self.bytes_sent + n).min(total);
        if n > 0 {
            self.last_activity = Instant::now();
        }

        if self.bytes_sent == total {
            debug!(client = self.identity, bytes = total, "Response sent");
            self.close()
        } else {
            Step::AwaitWritable
        }
    }

    /// Unsent header and body bytes.
    pub fn unsent(&self) -> (&[u8], &[u8]) {
        match &self.response {
            Some(response) => response.remaining(self.bytes_sent),
            None => (&[], &[]),
        }
    }

    /// Transition to `Closed`. Idempotent.
    pub fn close(&mut self) -> Step {
        self.state = ConnState::Closed;
        Step::Close
    }

    /// The step implied by the current state alone.
    pub fn next_step(&self) -> Step {
        match self.state {
            ConnState::AwaitingRequest => Step::AwaitReadable,
            ConnState::ResponsePending => Step::AwaitWritable,
            ConnState::Closed => Step::Close,
        }
    }
}

impl<S: Read + Write> Connection<S> {
    /// Handle a readability notification.
    ///
    /// Notifications are edge-triggered, so input is drained until the
    /// socket would block. Bytes after the first only keep the socket from
    /// resetting the connection on close; their content is ignored.
    pub fn on_readable(&mut self, scratch: &mut [u8], resource: &StaticResource) -> Step {
        if self.state != ConnState::AwaitingRequest {
            return self.next_step();
        }

        let mut received = 0;
        for _ in 0..MAX_DRAIN_READS {
            match self.socket.read(scratch) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if received == 0 {
                        return Step::AwaitReadable;
                    }
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(client = self.identity, error = %e, "Read error");
                    return self.close();
                }
            }
        }

        self.request_received(received, resource)
    }

    /// Handle a writability notification: write until done or blocked.
    pub fn on_writable(&mut self) -> Step {
        if self.state != ConnState::ResponsePending {
            return self.next_step();
        }

        loop {
            let result = {
                let Some(response) = self.response.as_ref() else {
                    return self.close();
                };
                let (head, body) = response.remaining(self.bytes_sent);
                self.socket
                    .write_vectored(&[IoSlice::new(head), IoSlice::new(body)])
            };

            match result {
                // Transport took nothing; wait for the next signal.
                Ok(0) => return Step::AwaitWritable,
                Ok(n) => {
                    if self.advance(n) == Step::Close {
                        return Step::Close;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Step::AwaitWritable
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(client = self.identity, error = %e, "Write error");
                    return self.close();
                }
            }
        }
    }
}

/// Registry of live connections keyed by descriptor.
///
/// Backed by a growable map: O(1) lookup on every event, no ceiling tied
/// to the descriptor table size.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    connections: HashMap<RawFd, Connection<S>>,
    next_identity: u64,
}

impl<S> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionRegistry<S> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_identity: 1,
        }
    }

    /// Get an immutable reference to a connection.
    ///
    /// `None` means the descriptor was already closed; the caller drops the
    /// event.
    pub fn lookup(&self, fd: RawFd) -> Option<&Connection<S>> {
        self.connections.get(&fd)
    }

    /// Get a mutable reference to a connection.
    pub fn lookup_mut(&mut self, fd: RawFd) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&fd)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, fd: RawFd) -> Option<Connection<S>> {
        self.connections.remove(&fd)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Descriptors of connections idle for at least `timeout`.
    pub fn idle(&self, now: Instant, timeout: Duration) -> Vec<RawFd> {
        self.connections
            .values()
            .filter(|conn| conn.is_idle(now, timeout))
            .map(|conn| conn.fd)
            .collect()
    }

    /// Iterate over all connections.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = &Connection<S>> {
        self.connections.values()
    }
}

impl<S: AsRawFd> ConnectionRegistry<S> {
    /// Store a freshly accepted socket in `AwaitingRequest`.
    pub fn register(&mut self, socket: S) -> &mut Connection<S> {
        let fd = socket.as_raw_fd();
        let identity = self.next_identity;
        self.next_identity += 1;

        let conn = Connection::new(socket, fd, identity);
        match self.connections.entry(fd) {
            // The previous owner of a reused descriptor was already removed.
            Entry::Occupied(mut entry) => {
                entry.insert(conn);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(conn),
        }
    }
}
