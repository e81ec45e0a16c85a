//! Newline-delimited JSON framing.
//!
//! ```text
//! {"type":"chat","from":"12D3Koo...","payload":{"message":"hi"}}\n
//! ```
//!
//! The decoder yields raw lines so that a malformed envelope can be dropped
//! without losing the stream; only oversized frames and I/O errors are fatal.

use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use ychat_shared::constants::MAX_MESSAGE_SIZE;
use ychat_shared::Envelope;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_size: usize,
    /// Where to resume scanning for `\n` in a partial buffer.
    next_index: usize,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            next_index: 0,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = BytesMut;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = self.next_index.min(src.len());

        match src[start..].iter().position(|b| *b == b'\n') {
            Some(offset) => {
                let end = start + offset;
                self.next_index = 0;

                if end > self.max_frame_size {
                    return Err(FrameError::TooLarge {
                        size: end,
                        max: self.max_frame_size,
                    });
                }

                let mut line = src.split_to(end + 1);
                line.truncate(end);
                if line.last() == Some(&b'\r') {
                    line.truncate(end - 1);
                }
                Ok(Some(line))
            }
            None => {
                if src.len() > self.max_frame_size {
                    return Err(FrameError::TooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if src.is_empty() {
            Ok(None)
        } else {
            // Unterminated trailing frame.
            Ok(Some(src.split_to(src.len())))
        }
    }
}

impl<'a> Encoder<&'a Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &'a Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(item)?;
        if json.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size: json.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
