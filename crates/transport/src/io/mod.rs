//! IO abstraction layer
//!
//! The core trait [`Transport`] lets the DAP client and the IPC bus run over
//! TCP sockets in production and over in-memory channels in tests.
//!
//! # Examples
//!
//! ```
//! use transport::io::InMemoryTransport;
//! use transport::Client;
//!
//! let (client_transport, _adapter_transport) = InMemoryTransport::pair();
//! let (tx, _rx) = crossbeam_channel::unbounded();
//! let client = Client::with_transport(client_transport, tx)?;
//! # Ok::<(), eyre::Error>(())
//! ```

use std::io::{Read, Write};

mod memory;
mod tcp;

pub use memory::{InMemoryReader, InMemoryTransport, InMemoryWriter};
pub use tcp::TcpTransport;

/// Bidirectional byte transport that can be split into independent halves
///
/// Readers should return `WouldBlock` or `TimedOut` when no data arrives
/// within their timeout, so that background polling threads can check for
/// shutdown; they return `Ok(0)` once the peer has gone away.
pub trait Transport: Send + 'static {
    type Reader: Read + Send + 'static;
    type Writer: Write + Send + 'static;

    /// Split the transport into separate reader and writer halves
    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)>;
}
