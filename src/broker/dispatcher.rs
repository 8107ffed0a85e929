//! Inbound dispatcher
//!
//! Drives the inbound half of every broker connection:
//! - response frames resolve the matching invoke correlator entry
//! - `MESSAGE_PUSH` request frames are handed to the listener and answered
//!   on the same connection with the consumption result
//! - malformed frames are logged and dropped, the connection stays open
//! - a transport fault closes the connection and is reported to the broker
//!   link, which starts a reconnect

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::consumer::listener::{ListenerContext, ListenerService};
use crate::invoke::InvokeCorrelator;
use crate::protocol::{ConsumerResultResp, ConsumerStatus, ConsumerType, MqMessage};
use crate::transport::{Connection, Envelope, InboundFrames, MethodType, RespCode};
use crate::utils::{MqError, Result};

/// A connection failed underneath the link.
#[derive(Debug, Clone)]
pub struct ConnectionFault {
    pub connection_id: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct InboundDispatcher {
    group_name: String,
    correlator: Arc<InvokeCorrelator>,
    listeners: Arc<ListenerService>,
    faults: UnboundedSender<ConnectionFault>,
}

impl InboundDispatcher {
    pub fn new(
        group_name: impl Into<String>,
        correlator: Arc<InvokeCorrelator>,
        listeners: Arc<ListenerService>,
        faults: UnboundedSender<ConnectionFault>,
    ) -> Self {
        Self {
            group_name: group_name.into(),
            correlator,
            listeners,
            faults,
        }
    }

    /// Read frames from `inbound` until the connection closes or faults.
    pub async fn run(self: Arc<Self>, conn: Connection, mut inbound: InboundFrames) {
        loop {
            tokio::select! {
                _ = conn.closed() => break,
                frame = inbound.next() => match frame {
                    Some(Ok(bytes)) => self.handle_frame(&conn, &bytes),
                    Some(Err(e)) => {
                        self.fail_connection(&conn, format!("inbound stream error: {e}"));
                        break;
                    }
                    None => {
                        self.fail_connection(&conn, "closed by peer".to_string());
                        break;
                    }
                }
            }
        }
        debug!("receive loop closed for {}", conn.id());
    }

    fn fail_connection(&self, conn: &Connection, reason: String) {
        if conn.is_closed() {
            return;
        }
        error!("connection {} to {} failed: {}", conn.id(), conn.endpoint(), reason);
        conn.close();
        let _ = self.faults.send(ConnectionFault {
            connection_id: conn.id().to_string(),
            reason,
        });
    }

    /// Handle one raw frame read from `conn`.
    pub fn handle_frame(&self, conn: &Connection, frame: &[u8]) {
        let envelope = match Envelope::from_slice(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    "dropping malformed frame on {}: {} | {}",
                    conn.id(),
                    e,
                    String::from_utf8_lossy(&frame[..frame.len().min(100)])
                );
                return;
            }
        };

        if !envelope.is_request {
            self.handle_response(envelope);
            return;
        }

        let reply = match self.dispatch(&envelope) {
            Ok(reply) => reply,
            Err(e) => {
                error!("cannot handle request {} on {}: {}", envelope.trace_id, conn.id(), e);
                match Envelope::response_to(&envelope, RespCode::Fail, &result_of(RespCode::Fail, None)) {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!("failed to encode failure reply: {e}");
                        return;
                    }
                }
            }
        };
        if let Err(e) = conn.send(reply) {
            warn!("failed to write response {} on {}: {}", envelope.trace_id, conn.id(), e);
        }
    }

    fn handle_response(&self, envelope: Envelope) {
        if envelope.trace_id.trim().is_empty() {
            debug!("discarding response without trace id: {:?}", envelope.method_type);
            return;
        }
        let trace_id = envelope.trace_id.clone();
        self.correlator.add_response(&trace_id, envelope);
    }

    /// Produce the reply for an inbound request.
    pub fn dispatch(&self, request: &Envelope) -> Result<Envelope> {
        debug!("received {} request {}", request.method_type, request.trace_id);
        match request.method_type {
            MethodType::MessagePush => {
                let resp = self.consume_pushed(request);
                Envelope::response_to(request, resp.resp_code, &resp)
            }
            other => Err(MqError::UnsupportedMethod(other.to_string())),
        }
    }

    fn consume_pushed(&self, request: &Envelope) -> ConsumerResultResp {
        let message: MqMessage = match request.body() {
            Ok(message) => message,
            Err(e) => {
                error!("undecodable pushed message {}: {}", request.trace_id, e);
                return result_of(RespCode::Fail, None);
            }
        };
        info!("received pushed message {} on topic {}", message.message_id(), message.topic);

        let context = ListenerContext {
            group_name: self.group_name.clone(),
            consumer_type: ConsumerType::Push,
        };
        match self.listeners.consume(&message, &context) {
            Ok(status) => result_of(RespCode::Success, Some(status)),
            Err(e) => {
                error!("listener failed on message {}: {:#}", message.message_id(), e);
                result_of(RespCode::Fail, None)
            }
        }
    }
}

fn result_of(code: RespCode, status: Option<ConsumerStatus>) -> ConsumerResultResp {
    ConsumerResultResp {
        resp_code: code,
        resp_message: code.message().to_string(),
        consumer_status: status,
    }
}
