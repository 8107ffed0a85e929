//! Listener capability: the application code that processes messages.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;
use tracing::warn;

use crate::protocol::{ConsumerStatus, ConsumerType, MqMessage};

/// Delivery context handed to a listener with every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerContext {
    pub group_name: String,
    pub consumer_type: ConsumerType,
}

/// Processes one message and reports the outcome. Runs on the delivering
/// task, so it must not block indefinitely.
pub trait MessageListener: Send + Sync {
    fn consume(&self, message: &MqMessage, context: &ListenerContext) -> anyhow::Result<ConsumerStatus>;
}

impl<F> MessageListener for F
where
    F: Fn(&MqMessage, &ListenerContext) -> anyhow::Result<ConsumerStatus> + Send + Sync,
{
    fn consume(&self, message: &MqMessage, context: &ListenerContext) -> anyhow::Result<ConsumerStatus> {
        self(message, context)
    }
}

/// Holds the single active listener.
#[derive(Default)]
pub struct ListenerService {
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
}

impl ListenerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any previously registered listener.
    pub fn register(&self, listener: Arc<dyn MessageListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn is_registered(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Run the registered listener. Without one the message is left for
    /// redelivery; a panicking listener is reported as an error.
    pub fn consume(&self, message: &MqMessage, context: &ListenerContext) -> anyhow::Result<ConsumerStatus> {
        let listener = self.listener.read().clone();
        let Some(listener) = listener else {
            warn!("no listener registered, message {} left for redelivery", message.message_id());
            return Ok(ConsumerStatus::Later);
        };
        match catch_unwind(AssertUnwindSafe(|| listener.consume(message, context))) {
            Ok(result) => result,
            Err(_) => Err(anyhow!("listener panicked on message {}", message.message_id())),
        }
    }
}

impl std::fmt::Debug for ListenerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerService")
            .field("registered", &self.is_registered())
            .finish()
    }
}
