//! Push consumer: deliveries arrive through the inbound dispatcher only.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConsumerSettings;
use crate::consumer::MqConsumer;
use crate::consumer::core::ConsumerCore;
use crate::protocol::ConsumerType;
use crate::transport::Transport;
use crate::utils::Result;

#[derive(Debug)]
pub struct PushConsumer {
    core: ConsumerCore,
}

impl PushConsumer {
    pub fn new(settings: ConsumerSettings) -> Result<Self> {
        Ok(Self {
            core: ConsumerCore::new(settings)?,
        })
    }

    pub fn with_transport(settings: ConsumerSettings, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self {
            core: ConsumerCore::with_transport(settings, transport)?,
        })
    }
}

#[async_trait]
impl MqConsumer for PushConsumer {
    fn core(&self) -> &ConsumerCore {
        &self.core
    }

    async fn subscribe(&self, topic: &str, tag_pattern: &str) -> Result<()> {
        self.core.link().subscribe(topic, tag_pattern, ConsumerType::Push).await
    }

    async fn unsubscribe(&self, topic: &str, tag_pattern: &str) -> Result<()> {
        self.core.link().unsubscribe(topic, tag_pattern, ConsumerType::Push).await
    }
}
