//! Wire-level plumbing for the debug adapter
//!
//! This crate contains the `Content-Length` framing shared by every channel,
//! the DAP client, JSON-RPC message types for language servers and the port
//! allocator.
pub mod bindings;
mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod io;
pub mod jsonrpc;
pub mod message;
pub mod reader;
pub mod requests;
pub mod responses;
pub mod types;

pub use bindings::{ListeningProbe, PortAllocator, PortProbe, PortReservation};
pub use client::{Client, DEFAULT_REQUEST_TIMEOUT};
pub use codec::FrameCodec;
pub use error::CodecError;
pub use io::{InMemoryTransport, TcpTransport, Transport};
pub use message::{Message, Seq};
pub use reader::{FrameReader, PollResult};
