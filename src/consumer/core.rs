//! Lifecycle shared by push and pull consumers: configuration check, the
//! broker link and its listener service.

use std::sync::Arc;

use tracing::info;

use crate::broker::BrokerLink;
use crate::config::ConsumerSettings;
use crate::consumer::listener::ListenerService;
use crate::transport::{TcpTransport, Transport};
use crate::utils::Result;

#[derive(Debug)]
pub struct ConsumerCore {
    settings: ConsumerSettings,
    listeners: Arc<ListenerService>,
    link: BrokerLink,
}

impl ConsumerCore {
    /// Validate `settings` and build a link over TCP.
    pub fn new(settings: ConsumerSettings) -> Result<Self> {
        Self::with_transport(settings, Arc::new(TcpTransport::default()))
    }

    pub fn with_transport(settings: ConsumerSettings, transport: Arc<dyn Transport>) -> Result<Self> {
        let link_settings = settings.link_settings()?;
        let listeners = Arc::new(ListenerService::new());
        let link = BrokerLink::new(
            link_settings,
            transport,
            settings.load_balance.build(),
            listeners.clone(),
        );
        Ok(Self {
            settings,
            listeners,
            link,
        })
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            "starting consumer for group {} against {}",
            self.settings.group_name, self.settings.broker_address
        );
        self.link.start().await
    }

    /// Stop the link, draining outstanding calls for up to
    /// `wait_for_remain_request_ms`.
    pub async fn shutdown(&self) {
        info!("shutting down consumer for group {}", self.settings.group_name);
        self.link.shutdown(self.settings.drain_window()).await;
    }

    pub fn link(&self) -> &BrokerLink {
        &self.link
    }

    pub fn listeners(&self) -> &Arc<ListenerService> {
        &self.listeners
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn group_name(&self) -> &str {
        &self.settings.group_name
    }
}
