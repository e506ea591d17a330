//! Duplex message channels.
//!
//! A channel is an ordered sink/stream pair of envelopes. Pairing requests
//! with responses is the bridge's job, not the channel's.
//!
//! - **pair**: in-memory byte pipe between two endpoints (framed by the codec)
//! - **from_io**: any AsyncRead/AsyncWrite, e.g. child stdio or a socket
//! - **ChannelHub**: named, reusable broadcast channels that outlive workers

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::EnvelopeCodec;
use super::protocol::Envelope;

pub type EnvelopeSink = Pin<Box<dyn Sink<Envelope, Error = io::Error> + Send>>;
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = io::Result<Envelope>> + Send>>;

const PAIR_BUFFER_BYTES: usize = 64 * 1024;
const DEFAULT_HUB_CAPACITY: usize = 1024;

pub struct Channel {
    label: String,
    sink: EnvelopeSink,
    stream: EnvelopeStream,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("label", &self.label).finish()
    }
}

impl Channel {
    pub fn new(label: impl Into<String>, sink: EnvelopeSink, stream: EnvelopeStream) -> Self {
        Self {
            label: label.into(),
            sink,
            stream,
        }
    }

    /// Channel over a byte stream using the length-delimited envelope codec.
    pub fn from_io<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::new(
            label,
            Box::pin(FramedWrite::new(writer, EnvelopeCodec::new())),
            Box::pin(FramedRead::new(reader, EnvelopeCodec::new())),
        )
    }

    /// Two connected endpoints. Closing one ends the other's stream.
    pub fn pair() -> (Channel, Channel) {
        let (left, right) = tokio::io::duplex(PAIR_BUFFER_BYTES);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Self::from_io("pair:left", left_read, left_write),
            Self::from_io("pair:right", right_read, right_write),
        )
    }

    /// Framed stdin/stdout; the worker side of a subprocess.
    pub fn stdio() -> Self {
        Self::from_io("stdio", tokio::io::stdin(), tokio::io::stdout())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn into_parts(self) -> (EnvelopeSink, EnvelopeStream) {
        (self.sink, self.stream)
    }
}

#[derive(Clone)]
struct HubFrame {
    from: uuid::Uuid,
    envelope: Envelope,
}

/// Registry of named broadcast channels shared by same-process contexts.
///
/// An envelope posted on an endpoint reaches every other endpoint opened
/// under the same name, never the poster. The stream of an endpoint never
/// ends while the hub is alive, so a controller bound to a name keeps working
/// across worker restarts.
#[derive(Clone)]
pub struct ChannelHub {
    channels: Arc<DashMap<String, broadcast::Sender<HubFrame>>>,
    capacity: usize,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Attach a new endpoint to the named channel, creating it if needed.
    pub fn open(&self, name: &str) -> Channel {
        let tx = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();
        let rx = tx.subscribe();
        let member = uuid::Uuid::new_v4();
        tracing::debug!(channel = name, %member, "Opened hub endpoint");

        let sink = futures::sink::unfold(tx, move |tx, envelope| async move {
            // No other member listening is not an error: the post is simply lost.
            let _ = tx.send(HubFrame {
                from: member,
                envelope,
            });
            Ok::<_, io::Error>(tx)
        });

        let channel_name = name.to_string();
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let channel_name = channel_name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) if frame.from == member => continue,
                        Ok(frame) => return Some((Ok(frame.envelope), rx)),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(channel = %channel_name, skipped, "Hub endpoint lagged, envelopes dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Channel::new(format!("hub:{name}"), Box::pin(sink), Box::pin(stream))
    }

    /// Number of endpoints currently attached to `name`.
    pub fn members(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
