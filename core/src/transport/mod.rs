//! Byte channels to a module server. No framing happens here.

pub mod memory;
pub mod serial;
pub mod tcp;

use std::io;
use std::time::Duration;

pub use memory::MemoryTransport;
pub use serial::SerialTransport;
pub use tcp::TcpTransport;

/// Duplex byte channel.
///
/// `read` waits at most `timeout`. A timeout surfaces as an error of kind
/// `TimedOut` (or `WouldBlock`); `Ok(0)` means the peer closed the channel.
pub trait Transport: Send {
    fn open(&mut self, timeout: Duration) -> io::Result<()>;
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn close(&mut self);
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, timeout: Duration) -> io::Result<()> {
        (**self).open(timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        (**self).read(buf, timeout)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

pub(crate) fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is not open")
}
