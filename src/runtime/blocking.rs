//! One-connection-at-a-time baseline with blocking sockets.
//!
//! Reloads the resource for every request and answers `404 Not Found` when
//! it cannot be read. The header carries no `Connection: close`.

use crate::config::Config;
use crate::resource::StaticResource;
use crate::response::{self, Framing, NOT_FOUND};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct BlockingServer {
    listener: TcpListener,
    resource_path: PathBuf,
    request_buf: Vec<u8>,
}

impl BlockingServer {
    /// Wrap a bound, listening, blocking socket.
    pub fn new(listener: TcpListener, config: &Config) -> Self {
        Self {
            listener,
            resource_path: config.resource.clone(),
            request_buf: vec![0u8; config.read_buffer_size],
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve clients one at a time, forever.
    pub fn run(&mut self) -> io::Result<()> {
        info!(
            addr = %self.local_addr()?,
            resource = %self.resource_path.display(),
            "Starting blocking runtime"
        );

        loop {
            self.serve_one();
        }
    }

    /// Accept and answer a single client.
    pub fn serve_one(&mut self) {
        let (mut stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                return;
            }
        };
        debug!(peer = %peer, "Connection accepted");

        // The request content is never inspected.
        if let Err(e) = stream.read(&mut self.request_buf) {
            debug!(peer = %peer, error = %e, "Read error");
        }

        if let Err(e) = self.respond(&mut stream) {
            debug!(peer = %peer, error = %e, "Write error");
        }
        debug!(peer = %peer, "Connection closed");
    }

    fn respond(&self, stream: &mut TcpStream) -> io::Result<()> {
        match StaticResource::load(&self.resource_path) {
            Ok(resource) => {
                stream.write_all(&response::header(resource.len(), Framing::KeepOpen))?;
                stream.write_all(resource.as_bytes())
            }
            Err(e) => {
                warn!(error = %e, "Serving 404");
                stream.write_all(NOT_FOUND)
            }
        }
    }
}
