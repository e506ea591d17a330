//! Framed codec for envelopes on byte streams.
//!
//! 4-byte length prefix + serde_json body. Used for pipes and sockets; the
//! in-process hub carries `Envelope` values directly.

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::Envelope;

/// Frames larger than this are rejected on both encode and decode.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 100_000;

pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.frames.max_frame_length()
    }
}

/// Size of the JSON body `encode` would frame for this envelope.
pub fn encoded_len(envelope: &Envelope) -> Result<usize, serde_json::Error> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, envelope)?;
    Ok(counter.0)
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, io::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = body.len(), call_id = %envelope.id(), "Encoding envelope");
        if body.len() > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_bytes = body.len(),
                frame_kb = body.len() / 1024,
                "Large envelope being encoded"
            );
        }
        self.frames.encode(Bytes::from(body), dst)
    }
}
