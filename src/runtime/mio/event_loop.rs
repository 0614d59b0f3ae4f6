//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! mio registrations are edge-triggered. A notification is only repeated
//! after the kernel-side condition changes, so every handler drains its
//! work: the listener accepts until `WouldBlock`, connections read until
//! `WouldBlock` and write until done or blocked.

use crate::config::Config;
use crate::resource::StaticResource;
use crate::runtime::{ConnectionRegistry, Step};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Single-threaded readiness event loop.
///
/// Owns its poll instance, listener and connection registry, so several
/// loops can coexist in one process.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    resource: StaticResource,
    /// Scratch space for draining request bytes.
    scratch: Vec<u8>,
    /// (token, readable, writable) copied out of `events` for dispatch.
    ready: Vec<(Token, bool, bool)>,
    idle_timeout: Option<Duration>,
}

impl EventLoop {
    /// Wrap a bound, listening, non-blocking socket.
    pub fn new(
        listener: std::net::TcpListener,
        resource: StaticResource,
        config: &Config,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.max_events),
            listener,
            connections: ConnectionRegistry::new(),
            resource,
            scratch: vec![0u8; config.read_buffer_size],
            ready: Vec::with_capacity(config.max_events),
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open client connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve forever.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            idle_timeout = ?self.idle_timeout,
            "Starting mio runtime"
        );

        loop {
            self.turn(self.poll_timeout())?;
        }
    }

    /// Wait at most `timeout` (forever when `None`) for readiness, then
    /// dispatch every event and sweep idle connections.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.extend(
            self.events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable())),
        );

        for &(token, readable, writable) in &ready {
            self.dispatch(token, readable, writable);
        }

        ready.clear();
        self.ready = ready;

        if let Some(timeout) = self.idle_timeout {
            self.sweep_idle(Instant::now(), timeout);
        }

        Ok(())
    }

    /// Sweep cadence: half the idle timeout, or block indefinitely.
    fn poll_timeout(&self) -> Option<Duration> {
        self.idle_timeout.map(|timeout| timeout / 2)
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        match token {
            LISTENER_TOKEN => self.accept_connections(),
            Token(fd) => self.handle_connection_event(fd as RawFd, readable, writable),
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    // mio hands out sockets already in non-blocking mode.
                    let conn = self.connections.register(stream);
                    let (fd, client) = (conn.fd(), conn.identity());

                    if let Err(e) = self.poll.registry().register(
                        &mut conn.socket,
                        Token(fd as usize),
                        Interest::READABLE,
                    ) {
                        warn!(client, error = %e, "Failed to register connection");
                        conn.close();
                        self.connections.remove(fd);
                        continue;
                    }

                    debug!(client, fd, peer = %peer_addr, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, fd: RawFd, readable: bool, writable: bool) {
        if self.connections.lookup(fd).is_none() {
            debug!(fd, "Event for closed connection ignored");
            return;
        }

        if readable {
            self.handle_readable(fd);
        }

        // Re-check connection exists (may have been removed)
        if writable && self.connections.lookup(fd).is_some() {
            self.handle_writable(fd);
        }
    }

    fn handle_readable(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.lookup_mut(fd) else {
            return;
        };

        match conn.on_readable(&mut self.scratch, &self.resource) {
            Step::AwaitReadable => {}
            Step::AwaitWritable => {
                // Read once, then write until done: never both interests.
                if let Err(e) = self.poll.registry().reregister(
                    &mut conn.socket,
                    Token(fd as usize),
                    Interest::WRITABLE,
                ) {
                    debug!(client = conn.identity(), error = %e, "Failed to switch to write interest");
                    conn.close();
                    self.close_connection(fd);
                }
            }
            Step::Close => self.close_connection(fd),
        }
    }

    fn handle_writable(&mut self, fd: RawFd) {
        let Some(conn) = self.connections.lookup_mut(fd) else {
            return;
        };

        if conn.on_writable() == Step::Close {
            self.close_connection(fd);
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.connections.remove(fd) {
            let _ = self.poll.registry().deregister(&mut conn.socket);
            debug!(
                client = conn.identity(),
                bytes_sent = conn.bytes_sent(),
                "Connection closed"
            );
            // Dropping `conn` closes the descriptor.
        }
    }

    fn sweep_idle(&mut self, now: Instant, timeout: Duration) {
        for fd in self.connections.idle(now, timeout) {
            if let Some(conn) = self.connections.lookup_mut(fd) {
                debug!(client = conn.identity(), state = ?conn.state(), "Closing idle connection");
                conn.close();
            }
            self.close_connection(fd);
        }
    }
}

/// Run the mio-based server until a fatal error.
pub fn run(
    listener: std::net::TcpListener,
    resource: StaticResource,
    config: &Config,
) -> io::Result<()> {
    EventLoop::new(listener, resource, config)?.run()
}
