use serde::{Deserialize, Serialize};

/// A message delivered to the consumer, by push or by pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqMessage {
    /// Broker-assigned message id; used as the acknowledgement key.
    pub trace_id: String,
    pub topic: String,
    pub tags: Vec<String>,
    pub payload: String,
    pub biz_key: Option<String>,
    pub sharding_key: Option<String>,
    pub group_name: Option<String>,
}

impl MqMessage {
    pub fn message_id(&self) -> &str {
        &self.trace_id
    }
}

/// Outcome of processing one message, reported back to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsumerStatus {
    #[serde(rename = "S")]
    Success,
    /// Processing should be retried later; the broker redelivers.
    #[serde(rename = "L")]
    Later,
    #[serde(rename = "F")]
    Failed,
}

impl ConsumerStatus {
    pub fn code(&self) -> &'static str {
        match self {
            ConsumerStatus::Success => "S",
            ConsumerStatus::Later => "L",
            ConsumerStatus::Failed => "F",
        }
    }
}

impl std::fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConsumerStatus::Success => "success",
            ConsumerStatus::Later => "later",
            ConsumerStatus::Failed => "failed",
        })
    }
}
