//! TCP transport between root and worker nodes.
//!
//! `Socket` wraps one `TcpStream` with blocking, fully-looped `write`/`read`
//! (short writes/reads from the kernel are retried until every byte has
//! moved). `SocketPool` owns every worker connection root talks to and
//! additionally supports `write_many`/`read_many`, which interleave I/O
//! across all sockets in round-robin non-blocking chunks so one slow peer
//! doesn't stall the others.

use shardllm_core::error::{Result, ShardLlmError, TransportSite};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

const NON_BLOCKING_CHUNK: usize = 64 * 1024;

fn set_nodelay(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true).map_err(|e| ShardLlmError::transport(TransportSite::Connect, &e))
}

/// One peer connection. Read/write always block until the full buffer has
/// moved or the peer disconnects.
pub struct Socket {
    stream: TcpStream,
}

impl Socket {
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        set_nodelay(&stream)?;
        Ok(Socket { stream })
    }

    pub fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| ShardLlmError::transport(TransportSite::Connect, &e))?;
        Self::from_stream(stream)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).map_err(|e| ShardLlmError::transport(TransportSite::Write, &e))
    }

    pub fn read(&mut self, data: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(data)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => ShardLlmError::PeerDisconnected(data.len()),
                _ => ShardLlmError::transport(TransportSite::Read, &e),
            })
    }

    pub fn try_clone(&self) -> Result<Self> {
        let stream = self.stream.try_clone().map_err(|e| ShardLlmError::transport(TransportSite::Connect, &e))?;
        Ok(Socket { stream })
    }
}

pub struct SocketServer {
    listener: TcpListener,
}

impl SocketServer {
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| ShardLlmError::transport(TransportSite::Accept, &e))?;
        Ok(SocketServer { listener })
    }

    pub fn accept(&self) -> Result<Socket> {
        let (stream, _addr) = self.listener.accept().map_err(|e| ShardLlmError::transport(TransportSite::Accept, &e))?;
        Socket::from_stream(stream)
    }

    /// The bound local port, useful when `bind(0)` picked an ephemeral one.
    pub fn local_port(&self) -> Result<u16> {
        self.listener.local_addr().map(|a| a.port()).map_err(|e| ShardLlmError::transport(TransportSite::Accept, &e))
    }
}

/// One scatter/gather unit: which socket, and the buffer to send from or
/// receive into.
pub struct SocketIo<'a> {
    pub socket_index: usize,
    pub data: &'a mut [u8],
}

/// Every worker connection root maintains, plus lifetime send/recv byte
/// counters for telemetry.
pub struct SocketPool {
    sockets: Vec<Socket>,
    sent_bytes: AtomicU64,
    recv_bytes: AtomicU64,
}

impl SocketPool {
    pub fn connect(addrs: &[String]) -> Result<Self> {
        let mut sockets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            sockets.push(Socket::connect(addr)?);
        }
        Ok(SocketPool {
            sockets,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
        })
    }

    /// Wrap already-established sockets (root's accepted worker
    /// connections, or a worker's single connection to root) into a pool.
    pub fn from_sockets(sockets: Vec<Socket>) -> Self {
        SocketPool {
            sockets,
            sent_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn write(&mut self, socket_index: usize, data: &[u8]) -> Result<()> {
        self.sockets[socket_index].write(data)?;
        self.sent_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn read(&mut self, socket_index: usize, data: &mut [u8]) -> Result<()> {
        self.sockets[socket_index].read(data)?;
        self.recv_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Send every `io.data` to its socket, advancing each in
    /// `NON_BLOCKING_CHUNK`-sized round-robin turns so no single large
    /// transfer monopolizes the thread ahead of the others.
    pub fn write_many(&mut self, ios: &mut [SocketIo]) -> Result<()> {
        let mut offsets = vec![0usize; ios.len()];
        let mut done = vec![false; ios.len()];
        let mut remaining = ios.len();

        for socket in self.sockets.iter_mut() {
            socket.stream.set_nonblocking(true).map_err(|e| ShardLlmError::transport(TransportSite::Write, &e))?;
        }

        while remaining > 0 {
            for (i, io) in ios.iter().enumerate() {
                if done[i] {
                    continue;
                }
                let start = offsets[i];
                let end = (start + NON_BLOCKING_CHUNK).min(io.data.len());
                let socket = &mut self.sockets[io.socket_index];
                match socket.stream.write(&io.data[start..end]) {
                    Ok(0) => {}
                    Ok(n) => {
                        offsets[i] += n;
                        self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        if offsets[i] >= io.data.len() {
                            done[i] = true;
                            remaining -= 1;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(ShardLlmError::transport(TransportSite::Write, &e)),
                }
            }
        }

        for socket in self.sockets.iter_mut() {
            socket.stream.set_nonblocking(false).map_err(|e| ShardLlmError::transport(TransportSite::Write, &e))?;
        }
        Ok(())
    }

    /// Receive into every `io.data`, round-robin as in `write_many`.
    pub fn read_many(&mut self, ios: &mut [SocketIo]) -> Result<()> {
        let mut offsets = vec![0usize; ios.len()];
        let mut done = vec![false; ios.len()];
        let mut remaining = ios.len();

        for socket in self.sockets.iter_mut() {
            socket.stream.set_nonblocking(true).map_err(|e| ShardLlmError::transport(TransportSite::Read, &e))?;
        }

        while remaining > 0 {
            for (i, io) in ios.iter_mut().enumerate() {
                if done[i] {
                    continue;
                }
                let start = offsets[i];
                let end = (start + NON_BLOCKING_CHUNK).min(io.data.len());
                let socket = &mut self.sockets[io.socket_index];
                match socket.stream.read(&mut io.data[start..end]) {
                    Ok(0) => {
                        return Err(ShardLlmError::PeerDisconnected(io.data.len() - offsets[i]));
                    }
                    Ok(n) => {
                        offsets[i] += n;
                        self.recv_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        if offsets[i] >= io.data.len() {
                            done[i] = true;
                            remaining -= 1;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(ShardLlmError::transport(TransportSite::Read, &e)),
                }
            }
        }

        for socket in self.sockets.iter_mut() {
            socket.stream.set_nonblocking(false).map_err(|e| ShardLlmError::transport(TransportSite::Read, &e))?;
        }
        Ok(())
    }

    /// Snapshot-and-reset the lifetime byte counters; returns `(sent, recv)`.
    pub fn take_stats(&self) -> (u64, u64) {
        (self.sent_bytes.swap(0, Ordering::Relaxed), self.recv_bytes.swap(0, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn socket_round_trips_a_payload() {
        let server = SocketServer::bind(0).unwrap();
        let port = server.listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let mut server_side = server.accept().unwrap();
            let mut buf = [0u8; 5];
            server_side.read(&mut buf).unwrap();
            server_side.write(&buf).unwrap();
        });

        let mut client = Socket::connect(&format!("127.0.0.1:{port}")).unwrap();
        client.write(b"hello").unwrap();
        let mut echoed = [0u8; 5];
        client.read(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");
        handle.join().unwrap();
    }

    #[test]
    fn read_past_disconnect_reports_peer_disconnected() {
        let server = SocketServer::bind(0).unwrap();
        let port = server.listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let _server_side = server.accept().unwrap();
        });

        let mut client = Socket::connect(&format!("127.0.0.1:{port}")).unwrap();
        handle.join().unwrap();
        let mut buf = [0u8; 4];
        let err = client.read(&mut buf);
        assert!(err.is_err());
    }
}
