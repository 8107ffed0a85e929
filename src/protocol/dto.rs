use serde::{Deserialize, Serialize};

use crate::protocol::message::{ConsumerStatus, MqMessage};
use crate::transport::{MethodType, RespCode};

/// Request body as the broker sees it: header fields followed by the
/// method-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    pub trace_id: String,
    pub method_type: MethodType,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Request<T> {
    pub fn new(trace_id: impl Into<String>, method_type: MethodType, body: T) -> Self {
        Self {
            trace_id: trace_id.into(),
            method_type,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonResp {
    pub resp_code: RespCode,
    #[serde(default)]
    pub resp_message: String,
}

impl CommonResp {
    pub fn of(code: RespCode) -> Self {
        Self {
            resp_code: code,
            resp_message: code.message().to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.resp_code == RespCode::Success
    }
}

/// Identity of a registering consumer, one per broker endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub group_name: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterReq {
    pub service_entry: ServiceEntry,
    #[serde(default)]
    pub app_key: String,
    #[serde(default)]
    pub app_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReq {
    pub address: String,
    pub port: u16,
    pub time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Push,
    Pull,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeReq {
    pub group_name: String,
    pub topic_name: String,
    pub tag_regex: String,
    pub consumer_type: ConsumerType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullReq {
    pub group_name: String,
    pub topic_name: String,
    pub tag_regex: String,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResp {
    pub resp_code: RespCode,
    #[serde(default)]
    pub resp_message: String,
    #[serde(default)]
    pub list: Vec<MqMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEntry {
    pub message_id: String,
    pub message_status: ConsumerStatus,
    pub consumer_group_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReq {
    #[serde(flatten)]
    pub entry: StatusEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBatchReq {
    pub status_list: Vec<StatusEntry>,
}

/// Answer the consumer writes back for a pushed message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResultResp {
    pub resp_code: RespCode,
    pub resp_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_status: Option<ConsumerStatus>,
}
