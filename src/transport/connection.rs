//! A live connection to one broker endpoint.
//!
//! The outbound half is owned by a writer task fed through an unbounded
//! channel, so callers never hold the stream across an await. The inbound
//! half is handed back from [`Connection::open`] for the dispatcher to drive.

use bytes::Bytes;
use futures_util::SinkExt;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::codec::{DelimiterCodec, encode_payload};
use crate::transport::endpoint::Endpoint;
use crate::transport::message::Envelope;
use crate::transport::tcp::BoxedStream;
use crate::utils::{MqError, Result};

pub type InboundFrames = FramedRead<ReadHalf<BoxedStream>, DelimiterCodec>;

#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    endpoint: Endpoint,
    outbound: UnboundedSender<(String, Bytes)>,
    max_frame_length: usize,
    closing: CancellationToken,
}

impl Connection {
    /// Split `stream`, spawn the writer task and return the connection with
    /// its inbound frame stream.
    pub fn open(
        endpoint: Endpoint,
        stream: BoxedStream,
        max_frame_length: usize,
    ) -> (Self, InboundFrames) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel::<(String, Bytes)>();
        let conn = Self {
            id: format!("conn-{}", Uuid::new_v4().simple()),
            endpoint,
            outbound: tx,
            max_frame_length,
            closing: CancellationToken::new(),
        };

        let sink = FramedWrite::new(write_half, DelimiterCodec::new(max_frame_length));
        tokio::spawn(write_loop(conn.id.clone(), sink, rx, conn.closing.clone()));

        let inbound = FramedRead::new(read_half, DelimiterCodec::new(max_frame_length));
        (conn, inbound)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Encode an envelope and queue it for the writer task.
    ///
    /// An envelope that cannot be framed fails here with `MqError::Frame`,
    /// before anything is queued.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(MqError::transport(format!("connection {} is closed", self.id)));
        }
        let payload = encode_payload(&envelope, self.max_frame_length)?;
        self.outbound
            .send((envelope.trace_id, payload))
            .map_err(|_| MqError::transport(format!("connection {} writer stopped", self.id)))
    }

    /// Idempotent; stops the writer and signals the reader to exit.
    pub fn close(&self) {
        if !self.closing.is_cancelled() {
            debug!("closing connection {} to {}", self.id, self.endpoint);
            self.closing.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || self.outbound.is_closed()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await
    }
}

async fn write_loop(
    id: String,
    mut sink: FramedWrite<WriteHalf<BoxedStream>, DelimiterCodec>,
    mut rx: mpsc::UnboundedReceiver<(String, Bytes)>,
    closing: CancellationToken,
) {
    loop {
        // Queued envelopes go out before a close takes effect.
        tokio::select! {
            biased;
            next = rx.recv() => {
                let Some((trace_id, payload)) = next else { break };
                if let Err(e) = sink.send(payload).await {
                    warn!("connection {id} failed to write {trace_id}: {e}");
                    closing.cancel();
                    break;
                }
            }
            _ = closing.cancelled() => break,
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
    debug!("send loop closed for {id}");
}
