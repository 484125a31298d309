use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;

use crate::transport::{not_connected, Transport};

/// Module server behind a serial or USB CDC port.
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub const DEFAULT_BAUD_RATE: u32 = 3_000_000;

    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            port: None,
        }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn serialport::SerialPort>> {
        self.port.as_mut().ok_or_else(not_connected)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, timeout: Duration) -> io::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(self.path.as_str(), self.baud_rate)
            .timeout(timeout)
            .open()?;
        debug!("opened {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let port = self.port()?;
        port.set_timeout(timeout)?;
        match port.read(buf) {
            // A serial port has no notion of the peer closing; zero bytes is a quiet line.
            Ok(0) => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            other => other,
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn describe(&self) -> String {
        format!("serial://{}@{}", self.path, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_port_fails_to_open() {
        let mut transport = SerialTransport::new("/dev/does-not-exist-sweep", 115_200);
        assert!(transport.open(Duration::from_millis(10)).is_err());
        assert_eq!(transport.describe(), "serial:///dev/does-not-exist-sweep@115200");
    }
}
