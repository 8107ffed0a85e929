//! The `consumer` module is the application-facing side of the runtime.
//!
//! Two variants share the [`MqConsumer`] lifecycle:
//! - [`PushConsumer`]: the broker pushes messages over the link and the
//!   listener's verdict is written back on the same connection
//! - [`PullConsumer`]: a periodic task pulls from every local subscription,
//!   runs the listener and acknowledges, per message or once per cycle

use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::LinkState;
use crate::utils::Result;

pub mod core;
pub mod listener;
pub mod pull;
pub mod push;

pub use self::core::ConsumerCore;
pub use listener::{ListenerContext, ListenerService, MessageListener};
pub use pull::{CycleReport, PullConsumer};
pub use push::PushConsumer;

#[async_trait]
pub trait MqConsumer: Send + Sync {
    fn core(&self) -> &ConsumerCore;

    /// Runs once the link is ready. No-op unless a variant needs it.
    async fn after_init(&self) -> Result<()> {
        Ok(())
    }

    /// Connect and register with the brokers, then run [`after_init`](Self::after_init).
    async fn start(&self) -> Result<()> {
        self.core().start().await?;
        self.after_init().await
    }

    async fn subscribe(&self, topic: &str, tag_pattern: &str) -> Result<()>;

    async fn unsubscribe(&self, topic: &str, tag_pattern: &str) -> Result<()>;

    /// Replace the active listener.
    fn register_listener(&self, listener: Arc<dyn MessageListener>) {
        self.core().listeners().register(listener);
    }

    async fn shutdown(&self) {
        self.core().shutdown().await;
    }

    fn state(&self) -> LinkState {
        self.core().link().state()
    }
}
