use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Inbound datagrams buffered ahead of a pending read. The send side awaits
/// when the buffer is full, backpressuring the data-channel callback.
const INBOUND_BUFFER: usize = 64;

/// A peer channel surfaced to the host.
pub struct PeerHandle {
    pub peer_id: String,
    pub channel_id: String,
    pub conn: ChannelStream,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("data channel error: {0}")]
    Channel(#[from] webrtc::Error),
}

#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Message(Vec<u8>),
    Closed,
}

/// A data channel exposed as a bidirectional byte stream.
///
/// The transport is message-oriented: each `write` submits one datagram and
/// each `read` consumes one. Datagrams that arrive while no read is pending
/// are buffered in arrival order.
pub struct ChannelStream {
    channel: Arc<RTCDataChannel>,
    events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelStream {
    /// Hooks the channel's message callback up to a fresh stream. The
    /// returned sender delivers the close event; it shares the buffered
    /// queue so end-of-stream is observed behind any unread datagrams.
    pub(crate) fn wire(channel: Arc<RTCDataChannel>) -> (Self, mpsc::Sender<ChannelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(INBOUND_BUFFER);

        let message_tx = events_tx.clone();
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let events = message_tx.clone();
            Box::pin(async move {
                let _ = events.send(ChannelEvent::Message(message.data.to_vec())).await;
            })
        }));

        (
            Self {
                channel,
                events: events_rx,
            },
            events_tx,
        )
    }

    /// Waits for the next datagram and copies it into `buf`, returning the
    /// number of bytes copied. Bytes beyond `buf.len()` are discarded, so
    /// callers should size `buf` at least as large as the sender's datagrams.
    /// Returns `None` once the channel has closed and the buffer is drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        match self.events.recv().await {
            Some(ChannelEvent::Message(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Some(n)
            }
            Some(ChannelEvent::Closed) | None => None,
        }
    }

    /// Submits `buf` as a single datagram. Returns the number of bytes
    /// accepted by the channel.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, StreamError> {
        let written = self.channel.send(&Bytes::copy_from_slice(buf)).await?;
        Ok(written)
    }

    /// Closes the underlying channel. Pending reads observe end-of-stream
    /// after any buffered datagrams.
    pub async fn close(&self) -> Result<(), StreamError> {
        self.channel.close().await?;
        Ok(())
    }

    /// Label of the underlying data channel.
    pub fn label(&self) -> &str {
        self.channel.label()
    }
}
