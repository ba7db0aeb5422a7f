//! In-memory transport implementation for testing

use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::Transport;

/// How long a read waits for data before reporting `WouldBlock`
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// In-memory transport backed by a pair of channels
///
/// ```
/// use std::io::{Read, Write};
/// use transport::io::{InMemoryTransport, Transport};
///
/// let (client, adapter) = InMemoryTransport::pair();
/// let (_client_reader, mut client_writer) = client.split()?;
/// let (mut adapter_reader, _adapter_writer) = adapter.split()?;
///
/// client_writer.write_all(b"hello")?;
/// let mut buf = [0u8; 5];
/// adapter_reader.read_exact(&mut buf)?;
/// assert_eq!(&buf, b"hello");
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct InMemoryTransport {
    reader: InMemoryReader,
    writer: InMemoryWriter,
}

/// Reader half of in-memory transport
///
/// When no data arrives within a short interval it returns `WouldBlock`, which
/// matches the read timeout behaviour of the TCP transport.
pub struct InMemoryReader {
    buffer: Cursor<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

/// Writer half of in-memory transport
pub struct InMemoryWriter {
    tx: Sender<Vec<u8>>,
}

impl InMemoryTransport {
    /// Create a connected pair of in-memory transports
    ///
    /// Data written to one end can be read from the other.
    pub fn pair() -> (Self, Self) {
        let (client_tx, server_rx) = crossbeam_channel::unbounded();
        let (server_tx, client_rx) = crossbeam_channel::unbounded();

        let client = Self {
            reader: InMemoryReader::new(client_rx),
            writer: InMemoryWriter { tx: client_tx },
        };

        let server = Self {
            reader: InMemoryReader::new(server_rx),
            writer: InMemoryWriter { tx: server_tx },
        };

        (client, server)
    }
}

impl Transport for InMemoryTransport {
    type Reader = InMemoryReader;
    type Writer = InMemoryWriter;

    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)> {
        Ok((self.reader, self.writer))
    }
}

impl InMemoryReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            buffer: Cursor::new(Vec::new()),
            rx,
        }
    }

    fn exhausted(&self) -> bool {
        self.buffer.position() >= self.buffer.get_ref().len() as u64
    }
}

impl Read for InMemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.exhausted() {
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(data) => self.buffer = Cursor::new(data),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "no data available",
                    ));
                }
                // peer dropped
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        self.buffer.read(buf)
    }
}

impl Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "channel disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_on_empty_channel() {
        let (client, _server) = InMemoryTransport::pair();
        let (mut reader, _writer) = client.split().unwrap();

        let mut buf = [0u8; 8];
        match reader.read(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn eof_on_disconnect() -> io::Result<()> {
        let (client, server) = InMemoryTransport::pair();
        let (mut reader, _writer) = client.split().unwrap();

        drop(server);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf)?, 0);
        Ok(())
    }

    #[test]
    fn multiple_writes_are_read_in_order() -> io::Result<()> {
        let (client, server) = InMemoryTransport::pair();
        let (mut client_reader, _client_writer) = client.split().unwrap();
        let (_server_reader, mut server_writer) = server.split().unwrap();

        server_writer.write_all(b"First")?;
        server_writer.write_all(b"Second")?;

        let mut buf = vec![0u8; 5];
        client_reader.read_exact(&mut buf)?;
        assert_eq!(&buf, b"First");

        let mut buf = vec![0u8; 6];
        client_reader.read_exact(&mut buf)?;
        assert_eq!(&buf, b"Second");
        Ok(())
    }
}
