use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;

use crate::transport::{not_connected, Transport};

/// Module server reached over TCP (Ethernet or a socket bridge).
pub struct TcpTransport {
    addr: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    /// Wraps an already connected stream, e.g. one accepted by a listener.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        let addr = stream.peer_addr()?.to_string();
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(not_connected)
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, timeout: Duration) -> io::Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("connected to {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve")
        }))
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let stream = self.stream()?;
        stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        stream.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.stream()?;
        stream.write_all(bytes)?;
        stream.flush()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
