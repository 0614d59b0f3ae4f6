//! One-operation-in-flight io_uring server.
//!
//! Each client goes through accept, read, vectored write and close, with
//! the loop blocked on every completion in between. The next accept is not
//! submitted until the previous client is done, so a client that never
//! sends stalls everyone behind it.

use super::{completion_error, discard_input, push, MAX_MESSAGE_LEN};
use crate::config::Config;
use crate::resource::StaticResource;
use crate::response::{Framing, Response};
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use tracing::{debug, info, warn};

pub struct SerialServer {
    ring: IoUring,
    listener: TcpListener,
    resource: StaticResource,
    request_buf: Vec<u8>,
    clients: u64,
}

impl SerialServer {
    pub fn new(
        listener: TcpListener,
        resource: StaticResource,
        config: &Config,
    ) -> io::Result<Self> {
        Ok(Self {
            ring: IoUring::new(config.ring_size)?,
            listener,
            resource,
            request_buf: vec![0u8; MAX_MESSAGE_LEN],
            clients: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients one at a time, forever.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            "Starting io_uring runtime (serial)"
        );

        loop {
            self.serve_one()?;
        }
    }

    /// Take one client through its whole lifecycle.
    ///
    /// Per-client failures are logged and swallowed; only ring errors are
    /// returned.
    pub fn serve_one(&mut self) -> io::Result<()> {
        let accept = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build();

        let result = self.complete(&accept)?;
        if result < 0 {
            warn!(error = %completion_error(result), "Accept failed");
            return Ok(());
        }

        self.clients += 1;
        let client = self.clients;
        // SAFETY: the kernel just handed us this descriptor; nothing else owns it.
        let socket = unsafe { OwnedFd::from_raw_fd(result) };
        let fd = socket.as_raw_fd();
        debug!(client, fd, "Accepted connection");

        let read = opcode::Recv::new(
            types::Fd(fd),
            self.request_buf.as_mut_ptr(),
            self.request_buf.len() as u32,
        )
        .build();

        let n = self.complete(&read)?;
        if n <= 0 {
            if n < 0 {
                debug!(client, error = %completion_error(n), "Read error");
            }
            debug!(client, "Connection closed by client");
            return Ok(());
        }
        debug!(client, bytes = n, "Received request");

        // Header and resource go out as two segments; the resource is never
        // copied into a combined buffer.
        let response = Response::new(&self.resource, Framing::Close);
        let (header, body) = (response.header(), response.body());
        let iovecs = [
            libc::iovec {
                iov_base: header.as_ptr() as *mut libc::c_void,
                iov_len: header.len(),
            },
            libc::iovec {
                iov_base: body.as_ptr() as *mut libc::c_void,
                iov_len: body.len(),
            },
        ];
        let total = response.len();

        let writev = opcode::Writev::new(types::Fd(fd), iovecs.as_ptr(), iovecs.len() as u32).build();
        let written = self.complete(&writev)?;

        // Closed whatever the outcome; a short write is not retried.
        if written < 0 {
            debug!(client, error = %completion_error(written), "Write error");
        } else if (written as usize) < total {
            warn!(client, written, total, "Short vectored write, remainder dropped");
        } else {
            debug!(client, bytes = total, "Response sent");
        }

        if let Err(e) = discard_input(&socket, &mut self.request_buf) {
            debug!(client, error = %e, "Discarding input failed");
        }
        drop(socket);
        debug!(client, "Connection closed");
        Ok(())
    }

    /// Submit a single entry and block until its completion arrives.
    fn complete(&mut self, entry: &squeue::Entry) -> io::Result<i32> {
        push(&mut self.ring, entry)?;

        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if let Some(cqe) = self.ring.completion().next() {
                return Ok(cqe.result());
            }
        }
    }
}
