//! Byte-stream sockets
//!
//! A socket owns a fixed-capacity ring buffer. Two connected sockets form a
//! bidirectional pair where each side's `send` writes into the *peer's*
//! buffer and `recv` drains its own. Partial transfers are success with a
//! smaller count, never an error; a completely full peer buffer is the
//! reported `BufferFull` condition.
//!
//! The named registry supports the bind/connect discovery pattern:
//! `bind` stores an owned copy of the address string, `connect_by_name`
//! looks it up and splices the two endpoints.

use slab::Slab;
use std::collections::HashMap;

/// Local socket domain (the only one supported)
pub const AF_LOCAL: i32 = 1;

/// Stream socket type (the only one supported)
pub const SOCK_STREAM: i32 = 1;

/// Socket identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(pub usize);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock:{}", self.0)
    }
}

/// Socket errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketError {
    /// Socket id does not name a live socket
    NotFound,
    /// Operation requires a connected peer
    NotConnected,
    /// One of the endpoints already has a peer
    AlreadyConnected,
    /// Address string is already bound
    AddressInUse,
    /// No socket is bound to the address
    ConnectionRefused,
    /// Peer buffer has no free space at all
    BufferFull,
    /// Unsupported domain/type/protocol triple
    Unsupported,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::NotFound => write!(f, "socket not found"),
            SocketError::NotConnected => write!(f, "socket not connected"),
            SocketError::AlreadyConnected => write!(f, "socket already connected"),
            SocketError::AddressInUse => write!(f, "address already in use"),
            SocketError::ConnectionRefused => write!(f, "connection refused"),
            SocketError::BufferFull => write!(f, "socket buffer full"),
            SocketError::Unsupported => write!(f, "unsupported socket parameters"),
        }
    }
}

impl std::error::Error for SocketError {}

/// Fixed-capacity circular byte buffer
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    count: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.buf.len()
    }

    /// Free space in bytes.
    pub fn free(&self) -> usize {
        self.buf.len() - self.count
    }

    /// Append up to `free()` bytes from `data`, returning how many fit.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        for &byte in &data[..n] {
            self.buf[self.tail] = byte;
            self.tail = (self.tail + 1) % self.buf.len();
            self.count += 1;
        }
        n
    }

    /// Drain up to `out.len()` bytes, returning how many were read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.count);
        for slot in out.iter_mut().take(n) {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % self.buf.len();
            self.count -= 1;
        }
        n
    }
}

/// One socket endpoint
#[derive(Debug)]
pub struct Socket {
    pub id: SocketId,
    /// Connected peer; `None` until spliced
    pub peer: Option<SocketId>,
    buf: RingBuffer,
}

impl Socket {
    fn new(id: SocketId, capacity: usize) -> Self {
        Self {
            id,
            peer: None,
            buf: RingBuffer::new(capacity),
        }
    }

    /// Bytes queued for this endpoint to read.
    pub fn queued(&self) -> usize {
        self.buf.len()
    }
}

/// All sockets plus the named registry
pub struct SocketTable {
    sockets: Slab<Socket>,
    /// Owned copies of bound address strings
    names: HashMap<String, SocketId>,
    buffer_size: usize,
}

impl SocketTable {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            sockets: Slab::new(),
            names: HashMap::new(),
            buffer_size,
        }
    }

    /// Allocate an unconnected socket with an empty ring buffer.
    pub fn create(&mut self, domain: i32, stype: i32, _protocol: i32) -> Result<SocketId, SocketError> {
        if domain != AF_LOCAL || stype != SOCK_STREAM {
            return Err(SocketError::Unsupported);
        }
        let entry = self.sockets.vacant_entry();
        let id = SocketId(entry.key());
        entry.insert(Socket::new(id, self.buffer_size));
        Ok(id)
    }

    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(id.0)
    }

    /// Symmetric peer assignment.
    pub fn connect(&mut self, a: SocketId, b: SocketId) -> Result<(), SocketError> {
        if a == b {
            return Err(SocketError::Unsupported);
        }
        let sa = self.sockets.get(a.0).ok_or(SocketError::NotFound)?;
        let sb = self.sockets.get(b.0).ok_or(SocketError::NotFound)?;
        if sa.peer.is_some() || sb.peer.is_some() {
            return Err(SocketError::AlreadyConnected);
        }
        self.sockets[a.0].peer = Some(b);
        self.sockets[b.0].peer = Some(a);
        Ok(())
    }

    /// Write into the peer's buffer. Partial writes are success; a peer
    /// buffer with no free space at all is `BufferFull`.
    pub fn send(&mut self, id: SocketId, data: &[u8]) -> Result<usize, SocketError> {
        let peer = self
            .sockets
            .get(id.0)
            .ok_or(SocketError::NotFound)?
            .peer
            .ok_or(SocketError::NotConnected)?;
        let peer_sock = self.sockets.get_mut(peer.0).ok_or(SocketError::NotConnected)?;
        let written = peer_sock.buf.write(data);
        if written == 0 && !data.is_empty() {
            return Err(SocketError::BufferFull);
        }
        Ok(written)
    }

    /// Drain this endpoint's own buffer. An empty buffer reads zero bytes;
    /// already-queued data remains readable after the peer closes.
    pub fn recv(&mut self, id: SocketId, out: &mut [u8]) -> Result<usize, SocketError> {
        let sock = self.sockets.get_mut(id.0).ok_or(SocketError::NotFound)?;
        Ok(sock.buf.read(out))
    }

    /// Disconnect the peer side if any, then release the socket.
    pub fn close(&mut self, id: SocketId) -> Result<(), SocketError> {
        if !self.sockets.contains(id.0) {
            return Err(SocketError::NotFound);
        }
        let sock = self.sockets.remove(id.0);
        if let Some(peer) = sock.peer {
            if let Some(peer_sock) = self.sockets.get_mut(peer.0) {
                peer_sock.peer = None;
            }
        }
        self.names.retain(|_, &mut bound| bound != id);
        Ok(())
    }

    /// Bind `id` to an address. The registry owns its copy of the string.
    pub fn bind(&mut self, id: SocketId, address: &str) -> Result<(), SocketError> {
        if !self.sockets.contains(id.0) {
            return Err(SocketError::NotFound);
        }
        if self.names.contains_key(address) {
            return Err(SocketError::AddressInUse);
        }
        self.names.insert(address.to_string(), id);
        Ok(())
    }

    /// Look up the socket bound to `address`.
    pub fn lookup_name(&self, address: &str) -> Option<SocketId> {
        self.names.get(address).copied()
    }

    /// Look up `address` and splice `id` with the socket bound there.
    pub fn connect_by_name(&mut self, id: SocketId, address: &str) -> Result<SocketId, SocketError> {
        let target = self
            .lookup_name(address)
            .ok_or(SocketError::ConnectionRefused)?;
        self.connect(id, target)?;
        Ok(target)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(table: &mut SocketTable) -> (SocketId, SocketId) {
        let a = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        let b = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        table.connect(a, b).unwrap();
        (a, b)
    }

    #[test]
    fn test_ring_buffer_wraps() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.write(b"abc"), 3);
        let mut out = [0u8; 2];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(&out, b"ab");

        // Wraps across the end of the storage
        assert_eq!(ring.write(b"def"), 3);
        let mut out = [0u8; 8];
        let n = ring.read(&mut out);
        assert_eq!(&out[..n], b"cdef");
    }

    #[test]
    fn test_ring_buffer_partial_write() {
        let mut ring = RingBuffer::new(4);
        assert_eq!(ring.write(b"abcdef"), 4);
        assert!(ring.is_full());
        assert_eq!(ring.write(b"x"), 0);
    }

    #[test]
    fn test_send_recv_round_trip() {
        let mut table = SocketTable::new(64);
        let (a, b) = pair(&mut table);

        assert_eq!(table.send(a, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(table.recv(b, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_recv_returns_queued_not_requested() {
        let mut table = SocketTable::new(64);
        let (a, b) = pair(&mut table);

        table.send(a, b"abc").unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(table.recv(b, &mut buf).unwrap(), 3);
    }

    #[test]
    fn test_send_is_bidirectional() {
        let mut table = SocketTable::new(64);
        let (a, b) = pair(&mut table);

        table.send(a, b"ping").unwrap();
        table.send(b, b"pong").unwrap();
        let mut buf = [0u8; 4];
        table.recv(b, &mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        table.recv(a, &mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_send_unconnected() {
        let mut table = SocketTable::new(64);
        let a = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        assert_eq!(table.send(a, b"x"), Err(SocketError::NotConnected));
    }

    #[test]
    fn test_send_partial_then_full() {
        let mut table = SocketTable::new(4);
        let (a, b) = pair(&mut table);

        // Partial transfer is success with a smaller count
        assert_eq!(table.send(a, b"abcdef").unwrap(), 4);
        // No space at all is the reported full condition
        assert_eq!(table.send(a, b"x"), Err(SocketError::BufferFull));

        let mut buf = [0u8; 6];
        assert_eq!(table.recv(b, &mut buf).unwrap(), 4);
    }

    #[test]
    fn test_bind_and_connect_by_name() {
        let mut table = SocketTable::new(64);
        let server = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        table.bind(server, "svc.echo").unwrap();

        let client = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        let target = table.connect_by_name(client, "svc.echo").unwrap();
        assert_eq!(target, server);

        table.send(client, b"hi").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(table.recv(server, &mut buf).unwrap(), 2);
    }

    #[test]
    fn test_bind_address_in_use() {
        let mut table = SocketTable::new(64);
        let a = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        let b = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        table.bind(a, "svc.one").unwrap();
        assert_eq!(table.bind(b, "svc.one"), Err(SocketError::AddressInUse));
    }

    #[test]
    fn test_connect_by_name_refused() {
        let mut table = SocketTable::new(64);
        let client = table.create(AF_LOCAL, SOCK_STREAM, 0).unwrap();
        assert_eq!(
            table.connect_by_name(client, "svc.ghost"),
            Err(SocketError::ConnectionRefused)
        );
    }

    #[test]
    fn test_close_disconnects_peer_and_frees_name() {
        let mut table = SocketTable::new(64);
        let (a, b) = pair(&mut table);
        table.bind(a, "svc.tmp").unwrap();

        table.close(a).unwrap();
        assert!(table.get(a).is_none());
        assert_eq!(table.get(b).unwrap().peer, None);
        assert_eq!(table.lookup_name("svc.tmp"), None);

        // Peer can no longer send, but the error is reported, not a crash
        assert_eq!(table.send(b, b"x"), Err(SocketError::NotConnected));
    }

    #[test]
    fn test_queued_data_survives_peer_close() {
        let mut table = SocketTable::new(64);
        let (a, b) = pair(&mut table);
        table.send(a, b"late").unwrap();
        table.close(a).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(table.recv(b, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"late");
    }

    #[test]
    fn test_create_rejects_unsupported() {
        let mut table = SocketTable::new(64);
        assert_eq!(table.create(99, SOCK_STREAM, 0), Err(SocketError::Unsupported));
        assert_eq!(table.create(AF_LOCAL, 7, 0), Err(SocketError::Unsupported));
    }
}
