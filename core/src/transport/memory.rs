use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::transport::{not_connected, Transport};

/// In-process duplex channel. Built in connected pairs; used for running a
/// module server in the same process and for tests.
pub struct MemoryTransport {
    name: String,
    tx: Option<Sender<Vec<u8>>>,
    rx: Option<Receiver<Vec<u8>>>,
    leftover: Vec<u8>,
}

impl MemoryTransport {
    /// Returns `(host_side, server_side)`.
    pub fn pair() -> (Self, Self) {
        let (host_tx, server_rx) = mpsc::channel();
        let (server_tx, host_rx) = mpsc::channel();
        (
            Self::new("memory://host", host_tx, host_rx),
            Self::new("memory://server", server_tx, server_rx),
        )
    }

    fn new(name: &str, tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            name: name.to_string(),
            tx: Some(tx),
            rx: Some(rx),
            leftover: Vec::new(),
        }
    }

    fn drain_leftover(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        n
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, _timeout: Duration) -> io::Result<()> {
        if self.rx.is_none() {
            return Err(not_connected());
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !self.leftover.is_empty() {
            return Ok(self.drain_leftover(buf));
        }
        let rx = self.rx.as_ref().ok_or_else(not_connected)?;
        match rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.leftover = chunk;
                Ok(self.drain_leftover(buf))
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => Ok(0),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(not_connected)?;
        tx.send(bytes.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))
    }

    fn close(&mut self) {
        self.tx = None;
        self.rx = None;
        self.leftover.clear();
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_delivers_bytes_in_order() {
        let (mut host, mut server) = MemoryTransport::pair();
        host.write_all(b"abc").unwrap();
        host.write_all(b"de").unwrap();

        let mut buf = [0u8; 2];
        let mut got = Vec::new();
        while got.len() < 5 {
            let n = server.read(&mut buf, Duration::from_millis(50)).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"abcde");
    }

    #[test]
    fn closed_peer_reads_as_end_of_stream() {
        let (mut host, mut server) = MemoryTransport::pair();
        server.close();
        let mut buf = [0u8; 4];
        assert_eq!(host.read(&mut buf, Duration::from_millis(10)).unwrap(), 0);
        assert!(host.write_all(b"x").is_err());
    }

    #[test]
    fn quiet_channel_times_out() {
        let (mut host, _server) = MemoryTransport::pair();
        let mut buf = [0u8; 4];
        let err = host.read(&mut buf, Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
