//! Event-driven runtimes serving the static resource.
//!
//! Platform-specific implementations:
//! - Linux/macOS: mio (epoll/kqueue) for readiness-based I/O
//! - Linux: io_uring for completion-based I/O
//! - Everywhere: a blocking one-client-at-a-time baseline
//!
//! The multiplexed engines share:
//! - `Connection`: the per-connection state machine
//! - `ConnectionRegistry`: live connections keyed by descriptor

pub mod blocking;
mod connection;

pub(crate) use connection::{ConnectionRegistry, Step};

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod mio;

#[cfg(target_os = "linux")]
pub mod uring;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::{Config, RuntimeType};
use crate::resource::StaticResource;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Run the configured engine. Returns only on a fatal error.
pub fn run(config: Config, resource: StaticResource) -> io::Result<()> {
    match config.runtime {
        RuntimeType::Mio => run_mio(config, resource),
        RuntimeType::IoUring => run_uring(config, resource),
        RuntimeType::Blocking => {
            // The baseline reloads the file per request; `resource` only
            // proved it was readable at startup.
            drop(resource);
            let listener = bind_listener(config.listen, config.backlog, false)?;
            blocking::BlockingServer::new(listener, &config).run()
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn run_mio(config: Config, resource: StaticResource) -> io::Result<()> {
    let listener = bind_listener(config.listen, config.backlog, true)?;
    mio::run(listener, resource, &config)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn run_mio(_config: Config, _resource: StaticResource) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Unsupported platform: mio runtime needs Linux or macOS",
    ))
}

#[cfg(target_os = "linux")]
fn run_uring(config: Config, resource: StaticResource) -> io::Result<()> {
    // io_uring waits on the socket itself, so it stays blocking.
    let listener = bind_listener(config.listen, config.backlog, false)?;
    uring::run(listener, resource, &config)
}

#[cfg(not(target_os = "linux"))]
fn run_uring(_config: Config, _resource: StaticResource) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Unsupported platform: io_uring is only available on Linux",
    ))
}

/// Create a listening TCP socket.
pub fn bind_listener(
    addr: SocketAddr,
    backlog: i32,
    nonblocking: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(SockProtocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(nonblocking)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
