//! io_uring event loop with many operations in flight.
//!
//! Completion-based model: submit operations to the ring, then process
//! completions in batches. Every submission carries a token naming its
//! phase and owner, so completions are routed back to the right
//! connection in whatever order the kernel finishes them.
//!
//! Each connection has at most one read or write outstanding. It is only
//! removed from the registry when that operation's completion arrives,
//! which keeps its buffers alive for as long as the kernel may touch them.

use super::{completion_error, discard_input, push, OpType, TokenAllocator, MAX_MESSAGE_LEN};
use crate::config::Config;
use crate::resource::StaticResource;
use crate::runtime::{ConnectionRegistry, Step};
use io_uring::{opcode, types, IoUring};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Socket plus the memory the kernel reads into and writes from.
pub(crate) struct UringSocket {
    fd: OwnedFd,
    read_buf: Box<[u8]>,
    /// Boxed so the address handed to `Writev` survives registry rehashing.
    iovecs: Box<[libc::iovec; 2]>,
    /// Token of the outstanding read or write.
    in_flight: Option<u64>,
    /// An idle sweep asked the kernel to cancel `in_flight`.
    cancelled: bool,
}

impl UringSocket {
    fn new(fd: OwnedFd) -> Self {
        let empty = libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        };
        Self {
            fd,
            read_buf: vec![0u8; MAX_MESSAGE_LEN].into_boxed_slice(),
            iovecs: Box::new([empty, empty]),
            in_flight: None,
            cancelled: false,
        }
    }

    /// Only called once no operation is outstanding, so `read_buf` is free.
    fn discard_input(&mut self) -> io::Result<usize> {
        discard_input(&self.fd, &mut self.read_buf)
    }
}

impl AsRawFd for UringSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

pub struct PipelinedServer {
    ring: IoUring,
    listener: TcpListener,
    connections: ConnectionRegistry<UringSocket>,
    tokens: TokenAllocator,
    resource: StaticResource,
    idle_timeout: Option<Duration>,
    /// (token, result) pairs drained from the completion queue.
    completions: Vec<(u64, i32)>,
}

impl PipelinedServer {
    pub fn new(
        listener: TcpListener,
        resource: StaticResource,
        config: &Config,
    ) -> io::Result<Self> {
        let ring = IoUring::new(config.ring_size)?;

        // Bounded waits need IORING_ENTER_EXT_ARG.
        let idle_timeout = match config.idle_timeout {
            Some(_) if !ring.params().is_feature_ext_arg() => {
                warn!("Kernel lacks timed waits, idle timeout disabled");
                None
            }
            timeout => timeout,
        };

        let mut server = Self {
            ring,
            listener,
            connections: ConnectionRegistry::new(),
            tokens: TokenAllocator::new(config.ring_size as usize),
            resource,
            idle_timeout,
            completions: Vec::with_capacity(config.ring_size as usize),
        };

        server.submit_accept()?;
        Ok(server)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open client connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether the kernel supports `turn` with a timeout.
    pub fn supports_timed_wait(&self) -> bool {
        self.ring.params().is_feature_ext_arg()
    }

    /// Serve forever.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            idle_timeout = ?self.idle_timeout,
            "Starting io_uring runtime (pipelined)"
        );

        loop {
            self.turn(self.idle_timeout.map(|timeout| timeout / 2))?;
        }
    }

    /// Submit pending operations, wait for at least one completion (or the
    /// timeout), then dispatch every completion available.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.wait(timeout)?;

        let mut completions = std::mem::take(&mut self.completions);
        completions.extend(
            self.ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result())),
        );

        for &(token, result) in &completions {
            let op = match self.tokens.free(token) {
                Some(op) => op,
                None => {
                    warn!(token, "Unknown token in completion");
                    continue;
                }
            };

            match op {
                OpType::Accept => self.handle_accept(result)?,
                OpType::Read { fd, client } => self.handle_read(fd, client, result)?,
                OpType::Write { fd, client } => self.handle_write(fd, client, result)?,
                OpType::Cancel => {}
            }
        }

        completions.clear();
        self.completions = completions;

        if let Some(timeout) = self.idle_timeout {
            self.sweep_idle(Instant::now(), timeout)?;
        }

        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let result = match timeout {
            Some(timeout) if self.supports_timed_wait() => {
                let ts = types::Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            _ => self.ring.submit_and_wait(1),
        };

        match result {
            Ok(_) => Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::ETIME) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn handle_accept(&mut self, result: i32) -> io::Result<()> {
        // Always re-arm accept
        self.submit_accept()?;

        if result < 0 {
            warn!(error = %completion_error(result), "Accept failed");
            return Ok(());
        }

        // SAFETY: the kernel just handed us this descriptor; nothing else owns it.
        let fd = unsafe { OwnedFd::from_raw_fd(result) };
        let conn = self
            .connections
            .register(UringSocket::new(fd));
        let (fd, client) = (conn.fd(), conn.identity());
        debug!(client, fd, "Accepted connection");

        self.submit_read(fd)
    }

    fn handle_read(&mut self, fd: RawFd, client: u64, result: i32) -> io::Result<()> {
        let Some(conn) = self
            .connections
            .lookup_mut(fd)
            .filter(|conn| conn.identity() == client)
        else {
            debug!(fd, client, "Read completion for closed connection ignored");
            return Ok(());
        };

        conn.socket.in_flight = None;
        let step = if conn.socket.cancelled {
            debug!(client, "Closing idle connection");
            conn.close()
        } else if result < 0 {
            debug!(client, error = %completion_error(result), "Read error");
            conn.close()
        } else {
            conn.request_received(result as usize, &self.resource)
        };

        self.apply(fd, step)
    }

    fn handle_write(&mut self, fd: RawFd, client: u64, result: i32) -> io::Result<()> {
        let Some(conn) = self
            .connections
            .lookup_mut(fd)
            .filter(|conn| conn.identity() == client)
        else {
            debug!(fd, client, "Write completion for closed connection ignored");
            return Ok(());
        };

        conn.socket.in_flight = None;
        let step = if conn.socket.cancelled {
            debug!(client, "Closing idle connection");
            conn.close()
        } else if result > 0 {
            // Partial writes resume from `bytes_sent` on resubmission.
            conn.advance(result as usize)
        } else if result == 0 || result == -libc::EAGAIN || result == -libc::EINTR {
            Step::AwaitWritable
        } else {
            debug!(client, error = %completion_error(result), "Write error");
            conn.close()
        };

        self.apply(fd, step)
    }

    fn apply(&mut self, fd: RawFd, step: Step) -> io::Result<()> {
        match step {
            Step::AwaitReadable => self.submit_read(fd),
            Step::AwaitWritable => self.submit_write(fd),
            Step::Close => {
                self.close_connection(fd);
                Ok(())
            }
        }
    }

    fn submit_accept(&mut self) -> io::Result<()> {
        let token = self.tokens.alloc(OpType::Accept);

        let accept = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build()
        .user_data(token);

        if let Err(e) = push(&mut self.ring, &accept) {
            self.tokens.free(token);
            return Err(e);
        }
        Ok(())
    }

    fn submit_read(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.lookup_mut(fd) else {
            return Ok(());
        };

        let token = self.tokens.alloc(OpType::Read {
            fd,
            client: conn.identity(),
        });

        let buf = &mut conn.socket.read_buf;
        let recv = opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
            .build()
            .user_data(token);

        if let Err(e) = push(&mut self.ring, &recv) {
            self.tokens.free(token);
            return Err(e);
        }
        conn.socket.in_flight = Some(token);
        Ok(())
    }

    fn submit_write(&mut self, fd: RawFd) -> io::Result<()> {
        let Some(conn) = self.connections.lookup_mut(fd) else {
            return Ok(());
        };

        let iovecs = {
            let (head, body) = conn.unsent();
            [
                libc::iovec {
                    iov_base: head.as_ptr() as *mut libc::c_void,
                    iov_len: head.len(),
                },
                libc::iovec {
                    iov_base: body.as_ptr() as *mut libc::c_void,
                    iov_len: body.len(),
                },
            ]
        };
        *conn.socket.iovecs = iovecs;

        let token = self.tokens.alloc(OpType::Write {
            fd,
            client: conn.identity(),
        });

        let writev = opcode::Writev::new(types::Fd(fd), conn.socket.iovecs.as_ptr(), 2)
            .build()
            .user_data(token);

        if let Err(e) = push(&mut self.ring, &writev) {
            self.tokens.free(token);
            return Err(e);
        }
        conn.socket.in_flight = Some(token);
        Ok(())
    }

    fn close_connection(&mut self, fd: RawFd) {
        if let Some(mut conn) = self.connections.remove(fd) {
            let client = conn.identity();
            match conn.socket.discard_input() {
                Ok(0) => {}
                Ok(bytes) => debug!(client, bytes, "Discarded unread input"),
                Err(e) => debug!(client, error = %e, "Discarding input failed"),
            }
            debug!(client, bytes_sent = conn.bytes_sent(), "Connection closed");
            // Dropping `conn` closes the descriptor.
        }
    }

    /// Cancel the outstanding operation of every idle connection. The
    /// connection closes when the cancelled completion comes back.
    fn sweep_idle(&mut self, now: Instant, timeout: Duration) -> io::Result<()> {
        for fd in self.connections.idle(now, timeout) {
            let Some(conn) = self.connections.lookup_mut(fd) else {
                continue;
            };
            if conn.socket.cancelled {
                continue;
            }

            let in_flight = conn.socket.in_flight;
            match in_flight {
                Some(target) => {
                    conn.socket.cancelled = true;
                    let token = self.tokens.alloc(OpType::Cancel);
                    let cancel = opcode::AsyncCancel::new(target).build().user_data(token);
                    if let Err(e) = push(&mut self.ring, &cancel) {
                        self.tokens.free(token);
                        return Err(e);
                    }
                }
                None => {
                    conn.close();
                    self.close_connection(fd);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::bind_listener;
    use crate::runtime::testing::{exchange, expected_response, hello, silent_close};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread::{self, JoinHandle};

    struct Running {
        addr: SocketAddr,
        stop: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        }
    }

    /// Run a server on a background thread until dropped. `None` when the
    /// kernel cannot create a ring or lacks timed waits.
    fn spawn(resource: StaticResource, config: Config) -> Option<Running> {
        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let listener = bind_listener(config.listen, config.backlog, false).unwrap();
            let mut server = match PipelinedServer::new(listener, resource, &config) {
                Ok(server) if server.supports_timed_wait() => server,
                Ok(_) => {
                    eprintln!("io_uring timed waits unavailable, skipping");
                    tx.send(None).unwrap();
                    return;
                }
                Err(e) => {
                    eprintln!("io_uring unavailable, skipping: {e}");
                    tx.send(None).unwrap();
                    return;
                }
            };
            tx.send(Some(server.local_addr().unwrap())).unwrap();
            while !flag.load(Ordering::Relaxed) {
                server.turn(Some(Duration::from_millis(10))).unwrap();
            }
        });

        match rx.recv().unwrap() {
            Some(addr) => Some(Running {
                addr,
                stop,
                handle: Some(handle),
            }),
            None => {
                handle.join().unwrap();
                None
            }
        }
    }

    #[test]
    fn test_hello_world_scenario() {
        let Some(server) = spawn(hello(), test_config()) else {
            return;
        };
        assert_eq!(
            exchange(server.addr, b"GET / HTTP/1.1\r\n\r\n"),
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 13\r\nConnection: close\r\n\r\nHello World!\n"
        );
    }

    #[test]
    fn test_zero_byte_client_gets_nothing() {
        let Some(server) = spawn(hello(), test_config()) else {
            return;
        };
        assert!(silent_close(server.addr).is_empty());
    }

    #[test]
    fn test_sequential_responses_identical() {
        let resource = hello();
        let Some(server) = spawn(resource.clone(), test_config()) else {
            return;
        };
        let expected = expected_response(&resource);
        for _ in 0..10 {
            assert_eq!(exchange(server.addr, b"GET /"), expected);
        }
    }

    #[test]
    fn test_silent_client_does_not_block_others() {
        let resource = hello();
        let Some(server) = spawn(resource.clone(), test_config()) else {
            return;
        };

        let mut silent = TcpStream::connect(server.addr).unwrap();
        thread::sleep(Duration::from_millis(50));

        assert_eq!(exchange(server.addr, b"GET /"), expected_response(&resource));

        silent.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        silent.write_all(b"GET /").unwrap();
        let mut received = Vec::new();
        silent.read_to_end(&mut received).unwrap();
        assert_eq!(received, expected_response(&resource));
    }

    #[test]
    fn test_large_body_intact() {
        let body: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let resource = StaticResource::from(body);
        let Some(server) = spawn(resource.clone(), test_config()) else {
            return;
        };

        let mut stream = TcpStream::connect(server.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        stream.write_all(b"GET /").unwrap();
        thread::sleep(Duration::from_millis(100));

        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        assert_eq!(received, expected_response(&resource));
    }

    /// A request line followed by far more than one read takes in.
    fn oversized_request() -> Vec<u8> {
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        request.extend(std::iter::repeat(b'X').take(16 * 1024));
        request
    }

    #[test]
    fn test_oversized_request_large_body_intact() {
        let body: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let resource = StaticResource::from(body);
        let Some(server) = spawn(resource.clone(), test_config()) else {
            return;
        };

        let expected = expected_response(&resource);
        for _ in 0..3 {
            let mut stream = TcpStream::connect(server.addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
            stream.write_all(&oversized_request()).unwrap();

            let mut received = Vec::new();
            stream.read_to_end(&mut received).unwrap();
            assert_eq!(received.len(), expected.len());
            assert!(received == expected);
        }
    }

    #[test]
    fn test_oversized_request_closes_cleanly() {
        let resource = hello();
        let Some(server) = spawn(resource.clone(), test_config()) else {
            return;
        };

        let expected = expected_response(&resource);
        for _ in 0..10 {
            assert_eq!(exchange(server.addr, &oversized_request()), expected);
        }
    }

    #[test]
    fn test_concurrent_clients() {
        let resource = hello();
        let Some(server) = spawn(resource.clone(), test_config()) else {
            return;
        };
        let addr = server.addr;

        let clients: Vec<_> = (0..16)
            .map(|_| thread::spawn(move || exchange(addr, b"GET / HTTP/1.1\r\n\r\n")))
            .collect();

        let expected = expected_response(&resource);
        for client in clients {
            assert_eq!(client.join().unwrap(), expected);
        }
    }

    #[test]
    fn test_idle_connection_is_cancelled_and_closed() {
        let config = Config {
            idle_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let Some(server) = spawn(hello(), config) else {
            return;
        };

        let mut stream = TcpStream::connect(server.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 128, false).unwrap();
        let Ok(mut server) = PipelinedServer::new(listener, hello(), &test_config()) else {
            return;
        };

        // Completions for a descriptor that was never (or is no longer) registered.
        server.handle_read(12345, 7, 18).unwrap();
        server.handle_write(12345, 7, 100).unwrap();
        server.handle_read(12345, 7, -libc::ECANCELED).unwrap();
        assert_eq!(server.connection_count(), 0);
        // Only the armed accept remains outstanding.
        assert_eq!(server.tokens.len(), 1);
    }

    #[test]
    fn test_completion_for_previous_owner_of_fd_is_ignored() {
        use crate::runtime::connection::ConnState;

        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 128, false).unwrap();
        let addr = listener.local_addr().unwrap();
        let Ok(mut server) = PipelinedServer::new(listener, hello(), &test_config()) else {
            return;
        };

        // The descriptor now belongs to a fresh connection; completions
        // tagged with an older identity must not touch it.
        let client = TcpStream::connect(addr).unwrap();
        let conn = server
            .connections
            .register(UringSocket::new(OwnedFd::from(client)));
        let (fd, current) = (conn.fd(), conn.identity());
        let stale = current + 41;

        server.handle_read(fd, stale, 18).unwrap();
        server.handle_write(fd, stale, 100).unwrap();
        server.handle_read(fd, stale, -libc::ECONNRESET).unwrap();

        let conn = server.connections.lookup(fd).unwrap();
        assert_eq!(conn.identity(), current);
        assert_eq!(conn.state(), ConnState::AwaitingRequest);
        assert_eq!(conn.bytes_sent(), 0);
        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.tokens.len(), 1);
    }
}
