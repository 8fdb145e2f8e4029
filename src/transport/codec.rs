//! Envelope framing for worker stdio.
//!
//! The worker speaks one JSON envelope (`init`, `rpc`, `rpc_response`, ...)
//! per line in both directions. [`NdjsonCodec`] turns those lines into
//! [`Frame`]s for the reader task and serializes outbound values for the
//! writer task. A line that is not JSON becomes [`Frame::Malformed`] instead
//! of an error so one bad line from the worker does not end the stream.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Longest envelope line accepted from a worker: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded line from the worker's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A JSON value, handed to the bridge as-is.
    Message(Value),
    /// A non-blank line that failed to parse.
    Malformed {
        /// The offending line.
        line: String,
        /// Parser message.
        reason: String,
    },
}

/// Codec used by both halves of [`WorkerTransport`](super::WorkerTransport).
///
/// Blank lines are skipped. An envelope longer than [`MAX_LINE_BYTES`]
/// decodes to [`AppError::Transport`].
#[derive(Debug)]
pub struct NdjsonCodec {
    lines: LinesCodec,
}

impl NdjsonCodec {
    /// Codec limited to [`MAX_LINE_BYTES`] per inbound envelope.
    #[must_use]
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NdjsonCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.lines.decode(src).map_err(framing_error)? {
                Some(line) if line.trim().is_empty() => {}
                line => return Ok(line.map(parse_frame)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.lines.decode_eof(src).map_err(framing_error)? {
                Some(line) if line.trim().is_empty() => {}
                line => return Ok(line.map(parse_frame)),
            }
        }
    }
}

impl Encoder<Value> for NdjsonCodec {
    type Error = AppError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item)
            .map_err(|err| AppError::Transport(format!("unserializable envelope: {err}")))?;
        self.lines.encode(line, dst).map_err(framing_error)
    }
}

fn parse_frame(line: String) -> Frame {
    match serde_json::from_str(&line) {
        Ok(value) => Frame::Message(value),
        Err(err) => Frame::Malformed {
            line,
            reason: err.to_string(),
        },
    }
}

fn framing_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => AppError::Transport(format!(
            "envelope line too long: exceeded {MAX_LINE_BYTES} bytes"
        )),
        LinesCodecError::Io(err) => AppError::from(err),
    }
}
