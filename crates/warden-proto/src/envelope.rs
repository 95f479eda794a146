//! Length-prefixed response framing and request decoding.
//!
//! Responses are framed as a 10-byte left-justified, space-padded ASCII
//! decimal byte count followed by the UTF-8 JSON body. Requests arrive as
//! raw JSON with no prefix; the connection itself delimits them.

use crate::{Request, Response};
use thiserror::Error;

/// Width of the ASCII decimal length prefix on every response frame.
pub const LENGTH_PREFIX_WIDTH: usize = 10;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid JSON format.")]
    BadRequest(#[source] serde_json::Error),
    #[error("frame length prefix is not ASCII decimal")]
    BadLengthPrefix,
    #[error("frame shorter than length prefix")]
    Truncated,
}

/// Encodes a response into a prefixed frame. Absent `data` serializes as
/// JSON `null`; encoding itself cannot fail for this envelope.
pub fn encode(response: &Response) -> Vec<u8> {
    let body = serde_json::to_vec(response).expect("serialize response envelope");
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_WIDTH + body.len());
    frame.extend_from_slice(format!("{:<width$}", body.len(), width = LENGTH_PREFIX_WIDTH).as_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Parses a request from an already connection-delimited byte range.
pub fn decode_request(bytes: &[u8]) -> Result<Request, FrameError> {
    serde_json::from_slice(bytes).map_err(FrameError::BadRequest)
}

/// Reads the body length out of a frame's prefix. Used by controller-side
/// readers and tests; the agent only ever writes frames.
pub fn frame_length(prefix: &[u8]) -> Result<usize, FrameError> {
    if prefix.len() < LENGTH_PREFIX_WIDTH {
        return Err(FrameError::Truncated);
    }
    let text = std::str::from_utf8(&prefix[..LENGTH_PREFIX_WIDTH])
        .map_err(|_| FrameError::BadLengthPrefix)?;
    text.trim_end()
        .parse()
        .map_err(|_| FrameError::BadLengthPrefix)
}
