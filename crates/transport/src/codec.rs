//! `Content-Length` framing shared by every channel in the adapter.
//!
//! The debug adapter protocol, the Java backend's JSON-RPC stream and the
//! IPC bus all use the same framing:
//!
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <JSON body>
//! ```
//!
//! [`FrameCodec`] implements the tokio-util `Decoder`/`Encoder` traits so it
//! can be driven directly on a [`BytesMut`] buffer by the blocking readers in
//! [`crate::reader`].

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// Default maximum message size (16 MB).
const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const HEADER_NAME: &[u8] = b"Content-Length:";

/// Codec for `Content-Length` framed JSON messages of type `T`.
///
/// Decoding is lenient in two ways, both needed for language servers that
/// share their stdout with log output:
///
/// - the header may omit the space after the colon (`Content-Length:42`),
/// - bytes before the first `Content-Length:` header are discarded.
#[derive(Debug)]
pub struct FrameCodec<T> {
    max_message_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a codec rejecting frames larger than `max_message_size` with
    /// [`CodecError::MessageTooLarge`].
    pub fn with_max_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for FrameCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_size(self.max_message_size)
    }
}

impl<T> Decoder for FrameCodec<T>
where
    T: DeserializeOwned,
{
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        skip_noise(src);

        let Some(header_end) = find_header_end(src) else {
            return Ok(None);
        };

        let content_length = parse_content_length(&src[..header_end])?;
        if content_length > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                size: content_length,
                max: self.max_message_size,
            });
        }

        let total_length = header_end + 4 + content_length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        src.advance(header_end + 4);
        let body = src.split_to(content_length);
        match serde_json::from_slice(&body) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                tracing::debug!(
                    body = %String::from_utf8_lossy(&body),
                    "dropping frame that does not match the expected shape"
                );
                Err(CodecError::JsonDeserialize(e))
            }
        }
    }
}

impl<T, M> Encoder<M> for FrameCodec<T>
where
    M: Serialize,
{
    type Error = CodecError;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item).map_err(CodecError::JsonSerialize)?;
        encode_frame(&json, dst);
        Ok(())
    }
}

/// Write an already serialised body as a single frame.
pub fn encode_frame(body: &[u8], dst: &mut BytesMut) {
    dst.reserve(32 + body.len());
    dst.put_slice(b"Content-Length: ");
    dst.put_slice(body.len().to_string().as_bytes());
    dst.put_slice(b"\r\n\r\n");
    dst.put_slice(body);
}

/// Drop anything before the next header.
///
/// When no header is buffered yet, complete lines are dropped and a trailing
/// partial line is kept in case it is the start of a header.
fn skip_noise(src: &mut BytesMut) {
    match find(src, HEADER_NAME) {
        Some(0) => {}
        Some(offset) => {
            tracing::trace!(
                skipped = %String::from_utf8_lossy(&src[..offset]),
                "skipping bytes before frame header"
            );
            src.advance(offset);
        }
        None => {
            if let Some(last_newline) = src.iter().rposition(|b| *b == b'\n') {
                src.advance(last_newline + 1);
            }
        }
    }
}

/// Position of the first `\r` of the header/body separator.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    find(buf, b"\r\n\r\n")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_content_length(header: &[u8]) -> Result<usize, CodecError> {
    let header_str = std::str::from_utf8(header).map_err(|_| CodecError::InvalidUtf8)?;

    for line in header_str.split("\r\n") {
        if let Some(value) = line.strip_prefix("Content-Length:") {
            return value
                .trim()
                .parse()
                .map_err(|_| CodecError::MalformedContentLength);
        }
    }

    Err(CodecError::MissingContentLength)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn make_frame(json: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(format!("Content-Length: {}\r\n\r\n{}", json.len(), json).as_bytes());
        buf
    }

    #[test]
    fn decode_complete_message() {
        let mut codec = FrameCodec::<Value>::new();
        let json = r#"{"seq":1,"type":"event","event":"initialized"}"#;
        let mut buf = make_frame(json);

        let result = codec.decode(&mut buf).unwrap();
        assert_eq!(result.unwrap()["event"], "initialized");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete_header() {
        let mut codec = FrameCodec::<Value>::new();
        let mut buf = BytesMut::from("Content-Length: 10");

        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert!(!buf.is_empty());
    }

    #[test]
    fn decode_incomplete_body() {
        let mut codec = FrameCodec::<Value>::new();
        let mut buf = BytesMut::from("Content-Length: 100\r\n\r\n{\"partial\":");

        let result = codec.decode(&mut buf).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decode_header_without_space() {
        let mut codec = FrameCodec::<Value>::new();
        let json = r#"{"jsonrpc":"2.0","id":3,"result":33097}"#;
        let mut buf = BytesMut::from(format!("Content-Length:{}\r\n\r\n{}", json.len(), json).as_str());

        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message["result"], 33097);
    }

    #[test]
    fn decode_skips_log_lines_before_header() {
        let mut codec = FrameCodec::<Value>::new();
        let json = r#"{"id":1,"result":null}"#;
        let mut buf = BytesMut::from("WARNING: something logged\n");
        buf.put_slice(&make_frame(json));

        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message["id"], 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_keeps_partial_header_line() {
        let mut codec = FrameCodec::<Value>::new();
        let mut buf = BytesMut::from("noise\nContent-Len");

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"Content-Len");
    }

    #[test]
    fn decode_consumes_unparseable_frame() {
        let mut codec = FrameCodec::<Value>::new();
        let mut buf = make_frame("not json");
        buf.put_slice(&make_frame(r#"{"ok":true}"#));

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(err.is_recoverable());

        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(message["ok"], true);
    }

    #[test]
    fn decode_message_too_large() {
        let mut codec = FrameCodec::<Value>::with_max_size(10);
        let mut buf = BytesMut::from("Content-Length: 100\r\n\r\n");

        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::MessageTooLarge { .. })));
    }

    #[test]
    fn encode_writes_header() {
        let mut codec = FrameCodec::<Value>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(serde_json::json!({"command": "initialize"}), &mut buf)
            .unwrap();

        let s = std::str::from_utf8(&buf).unwrap();
        assert!(s.starts_with("Content-Length: 24\r\n\r\n"));
        assert!(s.ends_with(r#"{"command":"initialize"}"#));
    }
}
