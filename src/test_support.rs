//! In-memory broker for tests.
//!
//! `MockBroker` implements [`Transport`] by handing out one end of a
//! `tokio::io::duplex` pipe per connect and serving the other end itself,
//! speaking the same delimiter-framed envelopes as a real broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::broker::LinkSettings;
use crate::protocol::MqMessage;
use crate::transport::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::transport::{
    BoxedStream, DelimiterCodec, Endpoint, Envelope, MethodType, RespCode, Transport, new_trace_id,
};
use crate::utils::{MqError, Result};

/// What the mock does with one request.
pub enum Reply {
    /// Answer with this business object; `respCode` defaults to SUCCESS.
    Respond(Value),
    /// Never answer.
    Silent,
    /// Drop the connection without answering.
    Sever,
}

pub fn ok() -> Reply {
    Reply::Respond(json!({"respCode": "SUCCESS", "respMessage": "success"}))
}

pub fn fail() -> Reply {
    Reply::Respond(json!({"respCode": "FAIL", "respMessage": "failed"}))
}

type Responder = Arc<dyn Fn(&Endpoint, &Envelope) -> Reply + Send + Sync>;

enum Outbound {
    Envelope(Envelope),
    /// Written as-is, no framing added.
    Raw(Vec<u8>),
}

struct Session {
    endpoint: Endpoint,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

struct MockInner {
    responder: RwLock<Responder>,
    refused: Mutex<HashSet<String>>,
    requests: Mutex<Vec<(Endpoint, Envelope)>>,
    push_replies: Mutex<Vec<Envelope>>,
    sessions: Mutex<Vec<Session>>,
    connects: AtomicUsize,
}

#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<MockInner>,
}

impl MockBroker {
    /// Accepts every connection and answers every request with SUCCESS.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                responder: RwLock::new(Arc::new(|_: &Endpoint, _: &Envelope| ok())),
                refused: Mutex::new(HashSet::new()),
                requests: Mutex::new(Vec::new()),
                push_replies: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Endpoint, &Envelope) -> Reply + Send + Sync + 'static,
    {
        *self.inner.responder.write() = Arc::new(responder);
    }

    pub fn refuse(&self, endpoint: &Endpoint) {
        self.inner.refused.lock().insert(endpoint.to_string());
    }

    pub fn accept(&self, endpoint: &Endpoint) {
        self.inner.refused.lock().remove(&endpoint.to_string());
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn requests_of(&self, method: MethodType) -> Vec<Envelope> {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|(_, env)| env.method_type == method)
            .map(|(_, env)| env.clone())
            .collect()
    }

    pub fn count(&self, method: MethodType) -> usize {
        self.requests_of(method).len()
    }

    pub fn clear_requests(&self) {
        self.inner.requests.lock().clear();
    }

    /// Poll until at least `n` requests of `method` were seen.
    pub async fn wait_for(&self, method: MethodType, n: usize, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.count(method) >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.count(method) >= n
    }

    /// Drop every open connection from the broker side.
    pub fn sever_all(&self) {
        for session in self.inner.sessions.lock().drain(..) {
            session.cancel.cancel();
        }
    }

    /// Push `message` as a MESSAGE_PUSH request on the first live session.
    /// Returns the push trace id.
    pub fn push(&self, message: &MqMessage) -> Option<String> {
        let trace_id = new_trace_id();
        let envelope = Envelope::request(&trace_id, MethodType::MessagePush, message).ok()?;
        let sessions = self.inner.sessions.lock();
        let session = sessions.iter().find(|s| !s.cancel.is_cancelled())?;
        session.outbound.send(Outbound::Envelope(envelope)).ok()?;
        Some(trace_id)
    }

    /// Write `bytes` verbatim on the first live session; the caller supplies
    /// any delimiter.
    pub fn push_raw(&self, bytes: &[u8]) -> bool {
        let sessions = self.inner.sessions.lock();
        sessions
            .iter()
            .find(|s| !s.cancel.is_cancelled())
            .is_some_and(|s| s.outbound.send(Outbound::Raw(bytes.to_vec())).is_ok())
    }

    pub fn push_replies(&self) -> Vec<Envelope> {
        self.inner.push_replies.lock().clone()
    }

    pub async fn wait_for_push_replies(&self, n: usize, within: Duration) -> Vec<Envelope> {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline && self.push_replies().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.push_replies()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        if self.inner.refused.lock().contains(&endpoint.to_string()) {
            return Err(MqError::transport(format!("connection refused by {endpoint}")));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(256 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.inner.sessions.lock().push(Session {
            endpoint: endpoint.clone(),
            outbound: tx.clone(),
            cancel: cancel.clone(),
        });
        tokio::spawn(serve(self.inner.clone(), endpoint.clone(), server, tx, rx, cancel));
        Ok(Box::new(client))
    }
}

async fn serve(
    inner: Arc<MockInner>,
    endpoint: Endpoint,
    stream: tokio::io::DuplexStream,
    tx: mpsc::UnboundedSender<Outbound>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, DelimiterCodec::new(DEFAULT_MAX_FRAME_LENGTH));
    let mut sink = FramedWrite::new(write_half, DelimiterCodec::new(DEFAULT_MAX_FRAME_LENGTH));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(outbound) = rx.recv() => {
                let written = match outbound {
                    Outbound::Envelope(envelope) => sink.send(envelope).await.is_ok(),
                    Outbound::Raw(bytes) => {
                        let io = sink.get_mut();
                        io.write_all(&bytes).await.is_ok() && io.flush().await.is_ok()
                    }
                };
                if !written {
                    break;
                }
            }
            frame = frames.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Ok(envelope) = Envelope::from_slice(&frame) else { continue };
                if !envelope.is_request {
                    inner.push_replies.lock().push(envelope);
                    continue;
                }
                inner.requests.lock().push((endpoint.clone(), envelope.clone()));
                let responder = inner.responder.read().clone();
                match responder(&endpoint, &envelope) {
                    Reply::Respond(body) => {
                        let code = body
                            .get("respCode")
                            .cloned()
                            .and_then(|c| serde_json::from_value::<RespCode>(c).ok())
                            .unwrap_or(RespCode::Success);
                        if let Ok(reply) = Envelope::response_to(&envelope, code, &body) {
                            let _ = tx.send(Outbound::Envelope(reply));
                        }
                    }
                    Reply::Silent => {}
                    Reply::Sever => break,
                }
            }
        }
    }
    cancel.cancel();
}

/// Link settings with timings short enough for tests.
pub fn fast_settings(endpoints: Vec<Endpoint>) -> LinkSettings {
    let mut settings = LinkSettings::new("test-group", endpoints);
    settings.resp_timeout = Duration::from_millis(300);
    settings.heartbeat_interval = Duration::from_millis(100);
    settings.reconnect_interval = Duration::from_millis(100);
    settings.ready_wait = Duration::from_secs(2);
    settings
}

pub fn endpoint(port: u16) -> Endpoint {
    Endpoint::new("10.0.0.1", port)
}

pub fn message(topic: &str, trace_id: &str) -> MqMessage {
    MqMessage {
        trace_id: trace_id.to_string(),
        topic: topic.to_string(),
        tags: vec!["tagA".to_string()],
        payload: "hello".to_string(),
        ..Default::default()
    }
}
