//! Blocking socket wrapper.
//!
//! A thin handle over a shared `TcpStream` exposing exact reads, full
//! writes, and a `close` that interrupts a reader blocked in another
//! thread. Reads carry no application-level timeout; teardown closes the
//! socket and the blocked read returns an error.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct Connection {
    stream: Arc<TcpStream>,
}

impl Connection {
    /// Dial `addr` (`host:port`) with a per-address timeout.
    pub(crate) fn connect(addr: &str, timeout: Duration) -> io::Result<Connection> {
        let mut last_err = None;
        for resolved in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&resolved, timeout) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
        }))
    }

    /// Wrap an accepted stream.
    pub(crate) fn from_stream(stream: TcpStream) -> io::Result<Connection> {
        stream.set_nodelay(true)?;
        Ok(Connection {
            stream: Arc::new(stream),
        })
    }

    /// Read exactly `buf.len()` bytes.
    pub(crate) fn read_exact(&self, buf: &mut [u8]) -> io::Result<()> {
        (&*self.stream).read_exact(buf)
    }

    /// Write the whole buffer.
    pub(crate) fn send_all(&self, buf: &[u8]) -> io::Result<()> {
        (&*self.stream).write_all(buf)
    }

    /// Shut the socket down in both directions, waking any blocked reader.
    pub(crate) fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Remote address of the socket.
    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }
}
