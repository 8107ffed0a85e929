//! Wire envelope exchanged between the consumer and a broker.
//!
//! Every request or response travels as one `Envelope`: a small JSON header
//! (trace id, direction, method, timestamps, response code) carrying the
//! business object as an embedded JSON string in `json`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodType {
    Register,
    UnRegister,
    Heartbeat,
    Subscribe,
    UnSubscribe,
    MessagePull,
    /// Broker to consumer delivery.
    MessagePush,
    ConsumerStatus,
    ConsumerStatusBatch,
    #[serde(other)]
    Unknown,
}

impl MethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MethodType::Register => "REGISTER",
            MethodType::UnRegister => "UN_REGISTER",
            MethodType::Heartbeat => "HEARTBEAT",
            MethodType::Subscribe => "SUBSCRIBE",
            MethodType::UnSubscribe => "UN_SUBSCRIBE",
            MethodType::MessagePull => "MESSAGE_PULL",
            MethodType::MessagePush => "MESSAGE_PUSH",
            MethodType::ConsumerStatus => "CONSUMER_STATUS",
            MethodType::ConsumerStatusBatch => "CONSUMER_STATUS_BATCH",
            MethodType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MethodType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response codes understood by the consumer.
///
/// `Timeout` is never sent by a broker; the invoke correlator synthesizes it
/// when a deadline elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RespCode {
    Success,
    Fail,
    Timeout,
    RegisterFailed,
    SubscribeFailed,
    UnSubscribeFailed,
    ConsumerStatusAckFailed,
    ConsumerStatusAckBatchFailed,
    InitFailed,
    #[serde(other)]
    Unknown,
}

impl RespCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RespCode::Success => "SUCCESS",
            RespCode::Fail => "FAIL",
            RespCode::Timeout => "TIMEOUT",
            RespCode::RegisterFailed => "REGISTER_FAILED",
            RespCode::SubscribeFailed => "SUBSCRIBE_FAILED",
            RespCode::UnSubscribeFailed => "UN_SUBSCRIBE_FAILED",
            RespCode::ConsumerStatusAckFailed => "CONSUMER_STATUS_ACK_FAILED",
            RespCode::ConsumerStatusAckBatchFailed => "CONSUMER_STATUS_ACK_BATCH_FAILED",
            RespCode::InitFailed => "INIT_FAILED",
            RespCode::Unknown => "UNKNOWN",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RespCode::Success => "success",
            RespCode::Timeout => "request timed out",
            _ => "failed",
        }
    }
}

impl std::fmt::Display for RespCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub trace_id: String,
    pub is_request: bool,
    pub method_type: MethodType,
    /// Epoch millis at which the envelope was built.
    pub request_time: i64,
    /// Business object, itself JSON encoded.
    #[serde(default)]
    pub json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_code: Option<RespCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp_message: Option<String>,
}

impl Envelope {
    /// Build a request envelope around an already-serializable body.
    pub fn request<T: Serialize>(trace_id: &str, method_type: MethodType, body: &T) -> Result<Self> {
        Ok(Self {
            trace_id: trace_id.to_string(),
            is_request: true,
            method_type,
            request_time: now_millis(),
            json: serde_json::to_string(body)?,
            resp_code: None,
            resp_message: None,
        })
    }

    /// Build the response to `req`, echoing its trace id and method type.
    pub fn response_to<T: Serialize>(req: &Envelope, code: RespCode, body: &T) -> Result<Self> {
        Ok(Self {
            trace_id: req.trace_id.clone(),
            is_request: false,
            method_type: req.method_type,
            request_time: now_millis(),
            json: serde_json::to_string(body)?,
            resp_code: Some(code),
            resp_message: Some(code.message().to_string()),
        })
    }

    /// Locally synthesized answer for a request whose deadline elapsed.
    pub fn timeout(trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            is_request: false,
            method_type: MethodType::Unknown,
            request_time: now_millis(),
            json: String::new(),
            resp_code: Some(RespCode::Timeout),
            resp_message: Some(RespCode::Timeout.message().to_string()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.resp_code == Some(RespCode::Timeout)
    }

    /// Decode the embedded business object.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.json)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// New UUID-class trace identifier, 32 hex chars without dashes.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
