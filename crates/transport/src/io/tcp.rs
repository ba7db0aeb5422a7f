//! TCP-based transport implementation

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use eyre::{Context, Result};

use super::Transport;

/// How long a read may block before the polling thread checks for shutdown
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP transport, used for debug adapters and the IPC bus
///
/// The reader is configured with a read timeout so that the background
/// polling thread periodically regains control.
///
/// ```no_run
/// use transport::io::TcpTransport;
///
/// let transport = TcpTransport::connect("127.0.0.1:5678")?;
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Result<Self> {
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("setting read timeout on TCP stream")?;
        stream
            .set_nodelay(true)
            .context("disabling Nagle on TCP stream")?;
        Ok(Self { stream })
    }

    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).context("connecting to peer")?;
        Self::new(stream)
    }
}

impl Transport for TcpTransport {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn split(self) -> Result<(Self::Reader, Self::Writer)> {
        let input = self
            .stream
            .try_clone()
            .context("cloning TCP stream for reader")?;
        Ok((input, self.stream))
    }
}
