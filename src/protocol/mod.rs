//! Business objects carried inside an envelope's `json` field.
//!
//! Requests are wrapped in [`Request`], which prepends the trace id and
//! method type the broker expects inside every request body. Responses share
//! the `respCode`/`respMessage` header of [`CommonResp`].

pub mod dto;
pub mod message;

pub use dto::{
    CommonResp, ConsumerResultResp, ConsumerType, HeartbeatReq, PullReq, PullResp, RegisterReq,
    Request, ServiceEntry, StatusBatchReq, StatusEntry, StatusReq, SubscribeReq,
};
pub use message::{ConsumerStatus, MqMessage};
