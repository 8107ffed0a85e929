//! The `broker` module owns everything about the consumer's side of the
//! broker connections: the pool, load balancing, the inbound dispatcher and
//! the `BrokerLink` that ties them together with registration, heartbeat and
//! reconnect.

pub mod balance;
pub mod dispatcher;
pub mod link;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod state;

pub use balance::{LoadBalance, LoadBalanceKind};
pub use dispatcher::{ConnectionFault, InboundDispatcher};
pub use link::{BrokerLink, LinkSettings};
pub use pool::ConnectionPool;
pub use registry::{SubscriptionRecord, SubscriptionRegistry};
pub use state::{LinkState, LinkStatus};

#[cfg(test)]
mod tests;
