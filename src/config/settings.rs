use std::time::Duration;

use serde::Deserialize;

use crate::broker::{LinkSettings, LoadBalanceKind};
use crate::transport::Endpoint;
use crate::transport::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::utils::{MqError, Result};

pub const DEFAULT_GROUP_NAME: &str = "C_DEFAULT_GROUP_NAME";
pub const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:9999";

/// Top-level configuration settings for the consumer runtime.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub consumer: ConsumerSettings,
    pub pull: PullSettings,
    pub log: LogSettings,
}

/// Settings shared by push and pull consumers.
///
/// `broker_address` is a comma separated list of `host:port[:weight]`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub group_name: String,
    pub broker_address: String,
    /// Address reported to brokers in heartbeats.
    pub client_address: String,
    pub resp_timeout_ms: u64,
    pub check: bool,
    /// Drain window for outstanding calls at shutdown.
    pub wait_for_remain_request_ms: u64,
    pub subscribe_max_attempt: u32,
    pub unsubscribe_max_attempt: u32,
    pub consumer_status_max_attempt: u32,
    pub app_key: String,
    pub app_secret: String,
    pub load_balance: LoadBalanceKind,
    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub ready_wait_ms: u64,
    pub max_frame_length: usize,
}

/// Pull-only settings: batch size, schedule and acknowledgement mode.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PullSettings {
    pub size: usize,
    pub init_delay_ms: u64,
    pub period_ms: u64,
    pub ack_batch: bool,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub consumer: Option<PartialConsumerSettings>,
    pub pull: Option<PartialPullSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialConsumerSettings {
    pub group_name: Option<String>,
    pub broker_address: Option<String>,
    pub client_address: Option<String>,
    pub resp_timeout_ms: Option<u64>,
    pub check: Option<bool>,
    pub wait_for_remain_request_ms: Option<u64>,
    pub subscribe_max_attempt: Option<u32>,
    pub unsubscribe_max_attempt: Option<u32>,
    pub consumer_status_max_attempt: Option<u32>,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub load_balance: Option<String>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub ready_wait_ms: Option<u64>,
    pub max_frame_length: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPullSettings {
    pub size: Option<usize>,
    pub init_delay_ms: Option<u64>,
    pub period_ms: Option<u64>,
    pub ack_batch: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            consumer: ConsumerSettings::default(),
            pull: PullSettings::default(),
            log: LogSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_name: DEFAULT_GROUP_NAME.to_string(),
            broker_address: DEFAULT_BROKER_ADDRESS.to_string(),
            client_address: "127.0.0.1".to_string(),
            resp_timeout_ms: 5000,
            check: true,
            wait_for_remain_request_ms: 60_000,
            subscribe_max_attempt: 3,
            unsubscribe_max_attempt: 3,
            consumer_status_max_attempt: 3,
            app_key: String::new(),
            app_secret: String::new(),
            load_balance: LoadBalanceKind::default(),
            heartbeat_interval_ms: 5000,
            reconnect_interval_ms: 5000,
            ready_wait_ms: 30_000,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl Default for PullSettings {
    fn default() -> Self {
        Self {
            size: 10,
            init_delay_ms: 5000,
            period_ms: 5000,
            ack_batch: true,
        }
    }
}

impl Settings {
    /// Merge `partial` field by field over the defaults.
    pub fn merge(partial: PartialSettings) -> Result<Self> {
        let d = Settings::default();
        let c = partial.consumer.unwrap_or_default();
        let p = partial.pull.unwrap_or_default();
        let l = partial.log.unwrap_or_default();

        let load_balance = match c.load_balance {
            Some(name) => LoadBalanceKind::parse(&name)
                .ok_or_else(|| MqError::config(format!("unknown load balance strategy '{name}'")))?,
            None => d.consumer.load_balance,
        };

        Ok(Settings {
            consumer: ConsumerSettings {
                group_name: c.group_name.unwrap_or(d.consumer.group_name),
                broker_address: c.broker_address.unwrap_or(d.consumer.broker_address),
                client_address: c.client_address.unwrap_or(d.consumer.client_address),
                resp_timeout_ms: c.resp_timeout_ms.unwrap_or(d.consumer.resp_timeout_ms),
                check: c.check.unwrap_or(d.consumer.check),
                wait_for_remain_request_ms: c
                    .wait_for_remain_request_ms
                    .unwrap_or(d.consumer.wait_for_remain_request_ms),
                subscribe_max_attempt: c.subscribe_max_attempt.unwrap_or(d.consumer.subscribe_max_attempt),
                unsubscribe_max_attempt: c
                    .unsubscribe_max_attempt
                    .unwrap_or(d.consumer.unsubscribe_max_attempt),
                consumer_status_max_attempt: c
                    .consumer_status_max_attempt
                    .unwrap_or(d.consumer.consumer_status_max_attempt),
                app_key: c.app_key.unwrap_or(d.consumer.app_key),
                app_secret: c.app_secret.unwrap_or(d.consumer.app_secret),
                load_balance,
                heartbeat_interval_ms: c.heartbeat_interval_ms.unwrap_or(d.consumer.heartbeat_interval_ms),
                reconnect_interval_ms: c.reconnect_interval_ms.unwrap_or(d.consumer.reconnect_interval_ms),
                ready_wait_ms: c.ready_wait_ms.unwrap_or(d.consumer.ready_wait_ms),
                max_frame_length: c.max_frame_length.unwrap_or(d.consumer.max_frame_length),
            },
            pull: PullSettings {
                size: p.size.unwrap_or(d.pull.size),
                init_delay_ms: p.init_delay_ms.unwrap_or(d.pull.init_delay_ms),
                period_ms: p.period_ms.unwrap_or(d.pull.period_ms),
                ack_batch: p.ack_batch.unwrap_or(d.pull.ack_batch),
            },
            log: LogSettings {
                level: l.level.unwrap_or(d.log.level),
            },
        })
    }
}

impl ConsumerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.group_name.trim().is_empty() {
            return Err(MqError::config("group_name must not be empty"));
        }
        if self.broker_address.trim().is_empty() {
            return Err(MqError::config("broker_address must not be empty"));
        }
        Endpoint::parse_list(&self.broker_address)
            .map_err(|e| MqError::config(format!("invalid broker_address: {e}")))?;

        let durations = [
            ("resp_timeout_ms", self.resp_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("reconnect_interval_ms", self.reconnect_interval_ms),
            ("ready_wait_ms", self.ready_wait_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(MqError::config(format!("{name} must be greater than zero")));
        }

        let ceilings = [
            ("subscribe_max_attempt", self.subscribe_max_attempt),
            ("unsubscribe_max_attempt", self.unsubscribe_max_attempt),
            ("consumer_status_max_attempt", self.consumer_status_max_attempt),
        ];
        if let Some((name, _)) = ceilings.iter().find(|(_, v)| *v == 0) {
            return Err(MqError::config(format!("{name} must be at least 1")));
        }

        if self.max_frame_length == 0 {
            return Err(MqError::config("max_frame_length must be greater than zero"));
        }
        Ok(())
    }

    /// Validate and convert into what the broker link runs on.
    pub fn link_settings(&self) -> Result<LinkSettings> {
        self.validate()?;
        let mut link = LinkSettings::new(self.group_name.clone(), Endpoint::parse_list(&self.broker_address)?);
        link.client_address = self.client_address.clone();
        link.resp_timeout = Duration::from_millis(self.resp_timeout_ms);
        link.check = self.check;
        link.subscribe_max_attempt = self.subscribe_max_attempt;
        link.unsubscribe_max_attempt = self.unsubscribe_max_attempt;
        link.consumer_status_max_attempt = self.consumer_status_max_attempt;
        link.app_key = self.app_key.clone();
        link.app_secret = self.app_secret.clone();
        link.heartbeat_interval = Duration::from_millis(self.heartbeat_interval_ms);
        link.reconnect_interval = Duration::from_millis(self.reconnect_interval_ms);
        link.ready_wait = Duration::from_millis(self.ready_wait_ms);
        link.max_frame_length = self.max_frame_length;
        Ok(link)
    }

    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.wait_for_remain_request_ms)
    }
}

impl PullSettings {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(MqError::config("pull.size must be at least 1"));
        }
        if self.period_ms == 0 {
            return Err(MqError::config("pull.period_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}
