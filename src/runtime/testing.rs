//! Client helpers shared by the runtime tests.

use crate::resource::StaticResource;
use crate::response::{self, Framing};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

pub fn hello() -> StaticResource {
    StaticResource::from(&b"Hello World!\n"[..])
}

/// Exact bytes a multiplexed engine sends for `resource`.
pub fn expected_response(resource: &StaticResource) -> Vec<u8> {
    let mut wire = response::header(resource.len(), Framing::Close).to_vec();
    wire.extend_from_slice(resource.as_bytes());
    wire
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream
}

/// Send `request` and read until the server closes.
pub fn exchange(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.write_all(request).unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    received
}

/// Connect, send nothing, half-close, and read until the server closes.
pub fn silent_close(addr: SocketAddr) -> Vec<u8> {
    let mut stream = connect(addr);
    stream.shutdown(Shutdown::Write).unwrap();
    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    received
}
