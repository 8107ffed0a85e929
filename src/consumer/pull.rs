//! Pull consumer
//!
//! Subscriptions are kept locally (deduplicated by topic, tag pattern and
//! group) and never sent to the broker. After start a task waits
//! `init_delay`, then every `period` runs one cycle:
//! - pull up to `size` messages for each subscription, in subscription order
//! - run the listener on every message; a listener error counts as `Failed`
//! - acknowledge each outcome immediately, or all of them in one batch call
//!   at the end of the cycle when `ack_batch` is set
//!
//! Pull failures and timeouts are logged and the cycle moves on to the next
//! subscription.
//!
//! Shutdown lets a cycle that is already running finish its current pull
//! and acknowledgements, then stops before the next subscription.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerLink, SubscriptionRecord, SubscriptionRegistry};
use crate::config::{ConsumerSettings, PullSettings};
use crate::consumer::MqConsumer;
use crate::consumer::core::ConsumerCore;
use crate::consumer::listener::{ListenerContext, ListenerService};
use crate::protocol::{ConsumerStatus, ConsumerType, StatusEntry};
use crate::transport::{RespCode, Transport};
use crate::utils::Result;

/// What one pull cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub subscriptions: usize,
    pub pulled: usize,
    pub acknowledged: usize,
    pub ack_failures: usize,
}

#[derive(Debug)]
pub struct PullConsumer {
    core: ConsumerCore,
    cycle: PullCycle,
    poller: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct PullCycle {
    link: BrokerLink,
    listeners: Arc<ListenerService>,
    settings: PullSettings,
    subscriptions: Arc<SubscriptionRegistry>,
    group_name: String,
    stopping: CancellationToken,
}

impl PullConsumer {
    pub fn new(settings: ConsumerSettings, pull: PullSettings) -> Result<Self> {
        Self::from_core(ConsumerCore::new(settings)?, pull)
    }

    pub fn with_transport(
        settings: ConsumerSettings,
        pull: PullSettings,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        Self::from_core(ConsumerCore::with_transport(settings, transport)?, pull)
    }

    fn from_core(core: ConsumerCore, pull: PullSettings) -> Result<Self> {
        pull.validate()?;
        let cancel = CancellationToken::new();
        let cycle = PullCycle {
            link: core.link().clone(),
            listeners: core.listeners().clone(),
            settings: pull,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            group_name: core.group_name().to_string(),
            stopping: cancel.clone(),
        };
        Ok(Self {
            core,
            cycle,
            poller: Mutex::new(None),
            cancel,
        })
    }

    /// Run one pull cycle now, outside the schedule.
    pub async fn poll_once(&self) -> CycleReport {
        self.cycle.run_once().await
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.cycle.subscriptions.snapshot()
    }

    fn record(&self, topic: &str, tag_pattern: &str) -> SubscriptionRecord {
        SubscriptionRecord::new(topic, tag_pattern, &self.cycle.group_name, ConsumerType::Pull)
    }
}

#[async_trait]
impl MqConsumer for PullConsumer {
    fn core(&self) -> &ConsumerCore {
        &self.core
    }

    async fn after_init(&self) -> Result<()> {
        let mut poller = self.poller.lock();
        if poller.is_none() {
            info!(
                "starting pull task: first cycle in {:?}, then every {:?}",
                self.cycle.settings.init_delay(),
                self.cycle.settings.period()
            );
            *poller = Some(tokio::spawn(poll_loop(self.cycle.clone(), self.cancel.clone())));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, tag_pattern: &str) -> Result<()> {
        if self.cycle.subscriptions.insert(self.record(topic, tag_pattern)) {
            info!("pull subscription added: {topic} [{tag_pattern}]");
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, tag_pattern: &str) -> Result<()> {
        if self.cycle.subscriptions.remove(&self.record(topic, tag_pattern)) {
            info!("pull subscription removed: {topic} [{tag_pattern}]");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let poller = self.poller.lock().take();
        if let Some(task) = poller {
            let window = self.core.settings().drain_window();
            let abort = task.abort_handle();
            if tokio::time::timeout(window, task).await.is_err() {
                warn!("pull cycle still running after {window:?}, aborting");
                abort.abort();
            }
        }
        self.core.shutdown().await;
    }
}

impl PullCycle {
    async fn run_once(&self) -> CycleReport {
        let subscriptions = self.subscriptions.snapshot();
        let mut report = CycleReport {
            subscriptions: subscriptions.len(),
            ..CycleReport::default()
        };
        if subscriptions.is_empty() {
            warn!("no pull subscriptions, nothing to do");
            return report;
        }

        let context = ListenerContext {
            group_name: self.group_name.clone(),
            consumer_type: ConsumerType::Pull,
        };
        let mut batch: Vec<StatusEntry> = Vec::new();

        for sub in &subscriptions {
            if self.stopping.is_cancelled() {
                debug!("stopping, {} left unpulled this cycle", sub.topic);
                break;
            }
            let resp = match self
                .link
                .pull(&sub.topic, &sub.tag_pattern, self.settings.size)
                .await
            {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    warn!("pull from {} timed out, skipping", sub.topic);
                    continue;
                }
                Err(e) => {
                    error!("pull from {} failed: {}", sub.topic, e);
                    continue;
                }
            };
            if resp.resp_code != RespCode::Success {
                error!(
                    "pull from {} refused: {} {}",
                    sub.topic, resp.resp_code, resp.resp_message
                );
                continue;
            }
            debug!("pulled {} messages from {}", resp.list.len(), sub.topic);

            for message in &resp.list {
                report.pulled += 1;
                let status = match self.listeners.consume(message, &context) {
                    Ok(status) => status,
                    Err(e) => {
                        error!("listener failed on message {}: {:#}", message.message_id(), e);
                        ConsumerStatus::Failed
                    }
                };
                info!("message {} consumed: {}", message.message_id(), status);

                if self.settings.ack_batch {
                    batch.push(StatusEntry {
                        message_id: message.message_id().to_string(),
                        message_status: status,
                        consumer_group_name: self.group_name.clone(),
                    });
                    continue;
                }
                match self.link.acknowledge(message.message_id(), status).await {
                    Ok(_) => report.acknowledged += 1,
                    Err(e) => {
                        error!("ack of message {} failed: {}", message.message_id(), e);
                        report.ack_failures += 1;
                    }
                }
            }
        }

        if !batch.is_empty() {
            let n = batch.len();
            match self.link.acknowledge_batch(batch).await {
                Ok(_) => {
                    info!("acknowledged {n} messages in one batch");
                    report.acknowledged += n;
                }
                Err(e) => {
                    error!("batch ack of {n} messages failed: {e}");
                    report.ack_failures += n;
                }
            }
        }
        report
    }
}

async fn poll_loop(cycle: PullCycle, cancel: CancellationToken) {
    let period = cycle.settings.period();
    let mut ticker = tokio::time::interval_at(Instant::now() + cycle.settings.init_delay(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let report = cycle.run_once().await;
        debug!("pull cycle finished: {report:?}");
    }
    debug!("pull task stopped");
}
