//! HTTP response framing.
//!
//! Every client receives the same canned `200 OK` carrying the static
//! resource. The header is formatted per connection, the body is a shared
//! view of the resource so it is never copied.

use crate::resource::StaticResource;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write;

/// Sent by the blocking baseline when the resource cannot be read.
pub const NOT_FOUND: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\n\r\nFile Not Found";

/// Whether the header announces that the server closes after responding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Connection: close` is sent (multiplexed engines).
    Close,
    /// No `Connection` header (blocking baseline).
    KeepOpen,
}

/// Format the response header for a body of `content_length` bytes.
pub fn header(content_length: usize, framing: Framing) -> Bytes {
    let mut buf = BytesMut::with_capacity(96);
    buf.put_slice(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n");
    // Writing into BytesMut cannot fail.
    let _ = write!(buf, "Content-Length: {content_length}\r\n");
    if framing == Framing::Close {
        buf.put_slice(b"Connection: close\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Outbound buffer of one connection: built once, never mutated.
#[derive(Debug, Clone)]
pub struct Response {
    header: Bytes,
    body: Bytes,
}

impl Response {
    pub fn new(resource: &StaticResource, framing: Framing) -> Self {
        Self {
            header: header(resource.len(), framing),
            body: resource.bytes(),
        }
    }

    /// Total bytes on the wire.
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Unsent header and body bytes, given `offset` bytes already sent.
    pub fn remaining(&self, offset: usize) -> (&[u8], &[u8]) {
        let header_len = self.header.len();
        if offset < header_len {
            (&self.header[offset..], &self.body[..])
        } else {
            let body_offset = (offset - header_len).min(self.body.len());
            (&[], &self.body[body_offset..])
        }
    }
}
