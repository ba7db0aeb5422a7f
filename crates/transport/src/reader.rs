//! Blocking, timeout-aware frame reader
//!
//! Drives a [`FrameCodec`] over any [`Read`] implementation. Background
//! threads call [`FrameReader::poll_message`] in a loop and use the
//! [`PollResult::Timeout`] case to check for shutdown.

use std::io::{self, Read};

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use tokio_util::codec::Decoder;

use crate::codec::FrameCodec;
use crate::error::CodecError;

const READ_CHUNK: usize = 8 * 1024;

/// Result of a timeout-aware poll operation
#[derive(Debug)]
pub enum PollResult<T> {
    /// A message was successfully received
    Message(T),
    /// The connection was closed
    Closed,
    /// The read timed out before a complete message was received
    Timeout,
}

pub struct FrameReader<R, T> {
    input: R,
    codec: FrameCodec<T>,
    buffer: BytesMut,
}

impl<R, T> FrameReader<R, T>
where
    R: Read,
    T: DeserializeOwned,
{
    pub fn new(input: R) -> Self {
        Self {
            input,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read until a whole message is buffered, the peer closes, or the
    /// underlying reader times out.
    ///
    /// Frames whose body does not deserialise into `T` are logged and skipped.
    pub fn poll_message(&mut self) -> Result<PollResult<T>, CodecError> {
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => return Ok(PollResult::Message(message)),
                Ok(None) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "skipping unparseable frame");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.input.read(&mut chunk) {
                Ok(0) => return Ok(PollResult::Closed),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if is_timeout(&e) => return Ok(PollResult::Timeout),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
    }

    /// Block until the next message, skipping timeouts.
    ///
    /// Returns `None` once the peer has closed the stream.
    pub fn next_message(&mut self) -> Result<Option<T>, CodecError> {
        loop {
            match self.poll_message()? {
                PollResult::Message(message) => return Ok(Some(message)),
                PollResult::Timeout => continue,
                PollResult::Closed => return Ok(None),
            }
        }
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
