//! # PopMQ consumer
//!
//! `popmq` is the client-side runtime of the popmq message queue. It keeps
//! live connections to one or more brokers, registers the consumer group,
//! subscribes to topics and reports consumption outcomes, riding out broker
//! restarts and network failures without operator intervention.
//!
//! ## Core Modules
//!
//! - `broker`: the broker link: connection pool, load balancing, inbound
//!   dispatch, heartbeat and the reconnect/resubscribe state machine.
//! - `consumer`: push and pull consumers and the listener capability.
//! - `invoke`: request/response correlation by trace id, with timeouts.
//! - `protocol`: business objects carried inside envelopes.
//! - `transport`: envelopes, delimiter framing, endpoints and connections.
//! - `config`: loading settings from file and environment.
//! - `utils`: the crate error type and logging setup.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod invoke;
pub mod protocol;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use broker::{BrokerLink, LinkSettings, LinkState, LoadBalanceKind};
pub use consumer::{ListenerContext, MessageListener, MqConsumer, PullConsumer, PushConsumer};
pub use protocol::{ConsumerStatus, MqMessage};
pub use utils::{MqError, Result};
