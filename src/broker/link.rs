//! Broker link
//!
//! Owns the connection pool and everything needed to talk to the brokers:
//! - registration on every connection at start, unregistration at shutdown
//! - request/response calls correlated by trace id, with a response timeout
//! - subscribe/unsubscribe/acknowledge with bounded immediate retry, and the
//!   resubscription registry replayed after a reconnect
//! - a heartbeat task whose failure (or a transport fault reported by the
//!   inbound dispatcher) tears the pool down and starts a recovery task
//!
//! State machine: `initializing -> ready | init-failed`,
//! `ready -> reconnecting -> ready`, and any state `-> stopped` on shutdown.
//! Only the `ready -> reconnecting` transition starts a recovery task, so at
//! most one runs at a time; it retries on a fixed period until it succeeds or
//! the link stops. Heartbeat ticks are skipped while not ready.
//!
//! Background tasks hold only a `Weak` reference to the link and stop on the
//! shutdown token, so dropping the last `BrokerLink` handle ends them.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::balance::LoadBalance;
use crate::broker::dispatcher::{ConnectionFault, InboundDispatcher};
use crate::broker::pool::ConnectionPool;
use crate::broker::registry::{SubscriptionRecord, SubscriptionRegistry};
use crate::broker::retry::retry;
use crate::broker::state::{LinkState, LinkStatus};
use crate::consumer::listener::ListenerService;
use crate::invoke::InvokeCorrelator;
use crate::protocol::{
    CommonResp, ConsumerStatus, ConsumerType, HeartbeatReq, PullReq, PullResp, RegisterReq, Request,
    ServiceEntry, StatusBatchReq, StatusEntry, StatusReq,
};
use crate::transport::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::transport::message::now_millis;
use crate::transport::{Connection, Endpoint, Envelope, MethodType, Transport, new_trace_id};
use crate::utils::{MqError, Result};

/// Everything the link needs to know about its brokers and policies.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub group_name: String,
    pub endpoints: Vec<Endpoint>,
    /// Address reported in heartbeats.
    pub client_address: String,
    pub resp_timeout: Duration,
    /// Fail start when no broker is reachable or accepts registration.
    pub check: bool,
    pub subscribe_max_attempt: u32,
    pub unsubscribe_max_attempt: u32,
    pub consumer_status_max_attempt: u32,
    pub app_key: String,
    pub app_secret: String,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    /// Bound on how long a caller waits for the link to become ready.
    pub ready_wait: Duration,
    pub max_frame_length: usize,
}

impl LinkSettings {
    pub fn new(group_name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        Self {
            group_name: group_name.into(),
            endpoints,
            client_address: "127.0.0.1".to_string(),
            resp_timeout: Duration::from_secs(5),
            check: true,
            subscribe_max_attempt: 3,
            unsubscribe_max_attempt: 3,
            consumer_status_max_attempt: 3,
            app_key: String::new(),
            app_secret: String::new(),
            heartbeat_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(5),
            ready_wait: Duration::from_secs(30),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

#[derive(Clone)]
pub struct BrokerLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    settings: LinkSettings,
    transport: Arc<dyn Transport>,
    balancer: Arc<dyn LoadBalance>,
    correlator: Arc<InvokeCorrelator>,
    dispatcher: Arc<InboundDispatcher>,
    pool: ConnectionPool,
    status: LinkStatus,
    registry: SubscriptionRegistry,
    faults: Mutex<Option<UnboundedReceiver<ConnectionFault>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.pool.teardown();
    }
}

impl BrokerLink {
    pub fn new(
        settings: LinkSettings,
        transport: Arc<dyn Transport>,
        balancer: Arc<dyn LoadBalance>,
        listeners: Arc<ListenerService>,
    ) -> Self {
        let correlator = Arc::new(InvokeCorrelator::new());
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(InboundDispatcher::new(
            settings.group_name.clone(),
            correlator.clone(),
            listeners,
            fault_tx,
        ));
        Self {
            inner: Arc::new(LinkInner {
                settings,
                transport,
                balancer,
                correlator,
                dispatcher,
                pool: ConnectionPool::new(),
                status: LinkStatus::new(),
                registry: SubscriptionRegistry::new(),
                faults: Mutex::new(Some(fault_rx)),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the pool, register on every connection and start the heartbeat.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.status.get() != LinkState::Initializing {
            return Err(MqError::config("broker link already started"));
        }
        info!(
            "starting broker link for group {} with {} endpoints",
            inner.settings.group_name,
            inner.settings.endpoints.len()
        );

        match self.connect_and_register(inner.settings.check).await {
            Ok(registered) => info!(
                "registered with {registered}/{} brokers",
                inner.settings.endpoints.len()
            ),
            Err(e) => {
                error!("broker link initialization failed: {e}");
                inner.status.set(LinkState::InitFailed);
                return Err(e);
            }
        }

        inner.status.set(LinkState::Ready);
        self.spawn_background_tasks();
        Ok(())
    }

    fn spawn_background_tasks(&self) {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(heartbeat_loop(
            weak.clone(),
            token.clone(),
            self.inner.settings.heartbeat_interval,
        )));
        if let Some(faults) = self.inner.faults.lock().take() {
            tasks.push(tokio::spawn(fault_loop(weak, token, faults)));
        }
    }

    /// Returns the number of brokers that accepted registration.
    async fn connect_and_register(&self, verify: bool) -> Result<usize> {
        let inner = &self.inner;
        inner
            .pool
            .initialize(
                &inner.settings.endpoints,
                inner.transport.as_ref(),
                &inner.dispatcher,
                inner.settings.max_frame_length,
                verify,
            )
            .await?;

        let registered = self.register_all().await;
        if registered == 0 && verify {
            error!("no broker accepted registration");
            return Err(MqError::RegistrationFailed);
        }
        Ok(registered)
    }

    async fn register_all(&self) -> usize {
        let settings = &self.inner.settings;
        let mut registered = 0;
        for conn in self.inner.pool.all() {
            let req = Request::new(
                new_trace_id(),
                MethodType::Register,
                RegisterReq {
                    service_entry: self.service_entry(&conn),
                    app_key: settings.app_key.clone(),
                    app_secret: settings.app_secret.clone(),
                },
            );
            info!("registering to broker {} ({})", conn.endpoint(), req.trace_id);
            match self.call::<_, CommonResp>(&conn, &req).await {
                Ok(resp) if resp.is_success() => {
                    info!("registered to broker {}", conn.endpoint());
                    registered += 1;
                }
                Ok(resp) => warn!(
                    "broker {} refused registration: {} {}",
                    conn.endpoint(),
                    resp.resp_code,
                    resp.resp_message
                ),
                Err(e) => warn!("registration to broker {} failed: {}", conn.endpoint(), e),
            }
        }
        registered
    }

    fn service_entry(&self, conn: &Connection) -> ServiceEntry {
        let endpoint = conn.endpoint();
        ServiceEntry {
            group_name: self.inner.settings.group_name.clone(),
            address: endpoint.address.clone(),
            port: endpoint.port,
            weight: endpoint.weight,
        }
    }

    /// Send `request` on `conn` and wait for the correlated response.
    ///
    /// A response that does not arrive within the configured timeout fails
    /// with `RequestTimeout`.
    pub async fn call<T, R>(&self, conn: &Connection, request: &Request<T>) -> Result<R>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        let trace_id = &request.trace_id;
        let envelope = Envelope::request(trace_id, request.method_type, request)?;

        let correlator = &self.inner.correlator;
        correlator.add_request(trace_id, self.inner.settings.resp_timeout)?;
        let _pending = correlator.guard(trace_id);
        conn.send(envelope)?;
        debug!("{} sent {} {}", conn.id(), request.method_type, trace_id);

        let response = correlator.get_response(trace_id).await;
        if response.is_timeout() {
            warn!(
                "{} {} to {} timed out",
                request.method_type,
                trace_id,
                conn.endpoint()
            );
            return Err(MqError::RequestTimeout {
                trace_id: trace_id.clone(),
            });
        }
        response.body()
    }

    /// Fire-and-forget: no correlator entry, no response awaited.
    pub fn notify<T: Serialize>(&self, conn: &Connection, request: &Request<T>) -> Result<()> {
        let envelope = Envelope::request(&request.trace_id, request.method_type, request)?;
        conn.send(envelope)?;
        debug!("{} sent one-way {} {}", conn.id(), request.method_type, request.trace_id);
        Ok(())
    }

    /// Wait (bounded) for the link to be ready, then pick a connection.
    pub async fn select(&self, key: Option<&str>) -> Result<Connection> {
        self.acquire(key, true).await
    }

    async fn acquire(&self, key: Option<&str>, wait_ready: bool) -> Result<Connection> {
        if wait_ready {
            self.inner.status.wait_ready(self.inner.settings.ready_wait).await?;
        }
        self.inner.pool.select(self.inner.balancer.as_ref(), key)
    }

    pub async fn subscribe(&self, topic: &str, tag_pattern: &str, consumer_type: ConsumerType) -> Result<()> {
        let record = SubscriptionRecord::new(topic, tag_pattern, &self.inner.settings.group_name, consumer_type);
        self.subscribe_record(&record, true).await
    }

    /// `wait_ready` is false while replaying subscriptions during recovery,
    /// when the link is deliberately not ready yet.
    async fn subscribe_record(&self, record: &SubscriptionRecord, wait_ready: bool) -> Result<()> {
        let this = self;
        retry("subscribe", self.inner.settings.subscribe_max_attempt, move |_| async move {
            let conn = this.acquire(None, wait_ready).await?;
            let req = Request::new(new_trace_id(), MethodType::Subscribe, record.to_request());
            let resp: CommonResp = this.call(&conn, &req).await?;
            ensure_success(resp)
        })
        .await
        .map_err(|ex| {
            ex.into_error(|attempts| MqError::SubscribeFailed {
                topic: record.topic.clone(),
                attempts,
            })
        })?;

        if self.inner.registry.insert(record.clone()) {
            info!("subscribed to {} [{}]", record.topic, record.tag_pattern);
        } else {
            debug!("subscription {} [{}] already registered", record.topic, record.tag_pattern);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str, tag_pattern: &str, consumer_type: ConsumerType) -> Result<()> {
        let record = SubscriptionRecord::new(topic, tag_pattern, &self.inner.settings.group_name, consumer_type);
        let this = self;
        let rec = &record;
        retry("unsubscribe", self.inner.settings.unsubscribe_max_attempt, move |_| async move {
            let conn = this.select(None).await?;
            let req = Request::new(new_trace_id(), MethodType::UnSubscribe, rec.to_request());
            let resp: CommonResp = this.call(&conn, &req).await?;
            ensure_success(resp)
        })
        .await
        .map_err(|ex| {
            ex.into_error(|attempts| MqError::UnsubscribeFailed {
                topic: record.topic.clone(),
                attempts,
            })
        })?;

        if self.inner.registry.remove(&record) {
            info!("unsubscribed from {} [{}]", record.topic, record.tag_pattern);
        }
        Ok(())
    }

    /// Replay every registered subscription, in subscription order.
    pub async fn resubscribe(&self) -> Result<()> {
        for record in self.inner.registry.snapshot() {
            self.subscribe_record(&record, false).await?;
        }
        Ok(())
    }

    /// Fetch up to `size` messages. The broker decides what is delivered.
    pub async fn pull(&self, topic: &str, tag_pattern: &str, size: usize) -> Result<PullResp> {
        let conn = self.select(None).await?;
        let req = Request::new(
            new_trace_id(),
            MethodType::MessagePull,
            PullReq {
                group_name: self.inner.settings.group_name.clone(),
                topic_name: topic.to_string(),
                tag_regex: tag_pattern.to_string(),
                size,
            },
        );
        self.call(&conn, &req).await
    }

    pub async fn acknowledge(&self, message_id: &str, status: ConsumerStatus) -> Result<CommonResp> {
        let entry = StatusEntry {
            message_id: message_id.to_string(),
            message_status: status,
            consumer_group_name: self.inner.settings.group_name.clone(),
        };
        let this = self;
        let entry = &entry;
        retry("consumer status ack", self.inner.settings.consumer_status_max_attempt, move |_| async move {
            let conn = this.select(None).await?;
            let req = Request::new(
                new_trace_id(),
                MethodType::ConsumerStatus,
                StatusReq { entry: entry.clone() },
            );
            let resp: CommonResp = this.call(&conn, &req).await?;
            ensure_success(resp)
        })
        .await
        .map_err(|ex| ex.into_error(|attempts| MqError::AcknowledgeFailed { attempts }))
    }

    pub async fn acknowledge_batch(&self, entries: Vec<StatusEntry>) -> Result<CommonResp> {
        let this = self;
        let entries = &entries;
        retry(
            "consumer status batch ack",
            self.inner.settings.consumer_status_max_attempt,
            move |_| async move {
                let conn = this.select(None).await?;
                let req = Request::new(
                    new_trace_id(),
                    MethodType::ConsumerStatusBatch,
                    StatusBatchReq {
                        status_list: entries.clone(),
                    },
                );
                let resp: CommonResp = this.call(&conn, &req).await?;
                ensure_success(resp)
            },
        )
        .await
        .map_err(|ex| ex.into_error(|attempts| MqError::AcknowledgeFailed { attempts }))
    }

    /// One heartbeat round over every connection; stops at the first
    /// timeout or transport failure. An empty pool counts as a failure.
    pub async fn heartbeat(&self) -> Result<()> {
        let connections = self.inner.pool.all();
        if connections.is_empty() {
            return Err(MqError::NoReachableBroker("connection pool is empty".into()));
        }
        for conn in connections {
            let req = Request::new(
                new_trace_id(),
                MethodType::Heartbeat,
                HeartbeatReq {
                    address: self.inner.settings.client_address.clone(),
                    port: 0,
                    time: now_millis(),
                },
            );
            debug!("heartbeat to {}", conn.endpoint());
            let resp: CommonResp = self.call(&conn, &req).await?;
            if !resp.is_success() {
                error!(
                    "broker {} answered heartbeat with {} {}",
                    conn.endpoint(),
                    resp.resp_code,
                    resp.resp_message
                );
            }
        }
        Ok(())
    }

    /// Move `ready -> reconnecting`, tear the pool down and start the
    /// recovery task. Returns `false` (and does nothing) unless the link was
    /// ready.
    pub fn trigger_reconnect(&self, reason: &str) -> bool {
        let inner = &self.inner;
        if !inner.status.transition(LinkState::Ready, LinkState::Reconnecting) {
            debug!(
                "reconnect requested ({reason}) while link is {}, ignored",
                inner.status.get()
            );
            return false;
        }
        warn!("broker link lost: {reason}; reconnecting");
        inner.pool.teardown();

        let handle = tokio::spawn(recovery_loop(
            Arc::downgrade(&self.inner),
            inner.shutdown.clone(),
            inner.settings.reconnect_interval,
        ));
        let mut tasks = inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        true
    }

    /// One recovery attempt: reopen the pool, re-register, replay the
    /// resubscription registry. Opening or registering nowhere is a failure
    /// regardless of the `check` flag.
    async fn recover_once(&self) -> Result<()> {
        let registered = self.connect_and_register(true).await?;
        info!("re-registered with {registered} brokers");
        self.resubscribe().await
    }

    /// Best-effort unregister on every connection, then pool teardown.
    pub fn destroy_all(&self) {
        let settings = &self.inner.settings;
        for conn in self.inner.pool.all() {
            let req = Request::new(
                new_trace_id(),
                MethodType::UnRegister,
                RegisterReq {
                    service_entry: self.service_entry(&conn),
                    app_key: settings.app_key.clone(),
                    app_secret: settings.app_secret.clone(),
                },
            );
            match self.notify(&conn, &req) {
                Ok(()) => info!("unregistered from broker {}", conn.endpoint()),
                Err(e) => warn!("failed to unregister from broker {}: {}", conn.endpoint(), e),
            }
        }
        self.inner.pool.teardown();
    }

    /// Stop handing out connections, let outstanding invocations drain for
    /// up to `drain_window`, unregister, and stop every background task.
    pub async fn shutdown(&self, drain_window: Duration) {
        let inner = &self.inner;
        if inner.status.get() == LinkState::Stopped {
            return;
        }
        inner.status.set(LinkState::Stopped);

        inner.correlator.wait_drained(drain_window).await;
        self.destroy_all();
        inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *inner.tasks.lock());
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        if tokio::time::timeout(Duration::from_secs(1), futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("broker link tasks did not stop in time, aborting");
            aborts.iter().for_each(|a| a.abort());
        }
        info!("broker link for group {} stopped", inner.settings.group_name);
    }

    pub fn state(&self) -> LinkState {
        self.inner.status.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.inner.status.subscribe()
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn correlator(&self) -> &Arc<InvokeCorrelator> {
        &self.inner.correlator
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.pool.all()
    }
}

impl std::fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerLink")
            .field("group", &self.inner.settings.group_name)
            .field("state", &self.state())
            .field("connections", &self.inner.pool.len())
            .field("subscriptions", &self.inner.registry.len())
            .finish()
    }
}

fn ensure_success(resp: CommonResp) -> Result<CommonResp> {
    if resp.is_success() {
        Ok(resp)
    } else {
        Err(MqError::Rejected {
            code: resp.resp_code.to_string(),
            message: resp.resp_message,
        })
    }
}

fn upgrade(link: &Weak<LinkInner>) -> Option<BrokerLink> {
    link.upgrade().map(|inner| BrokerLink { inner })
}

async fn heartbeat_loop(link: Weak<LinkInner>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(link) = upgrade(&link) else { break };
        let state = link.state();
        if state != LinkState::Ready {
            debug!("heartbeat skipped while link is {state}");
            continue;
        }
        let outcome = tokio::select! {
            _ = token.cancelled() => break,
            outcome = link.heartbeat() => outcome,
        };
        if let Err(e) = outcome {
            error!("heartbeat failed: {e}");
            link.trigger_reconnect(&format!("heartbeat failed: {e}"));
        }
    }
    debug!("heartbeat task stopped");
}

async fn fault_loop(
    link: Weak<LinkInner>,
    token: CancellationToken,
    mut faults: UnboundedReceiver<ConnectionFault>,
) {
    loop {
        let fault = tokio::select! {
            _ = token.cancelled() => break,
            fault = faults.recv() => match fault {
                Some(fault) => fault,
                None => break,
            },
        };
        let Some(link) = upgrade(&link) else { break };
        if link.inner.pool.contains(&fault.connection_id) {
            link.trigger_reconnect(&format!(
                "connection {} failed: {}",
                fault.connection_id, fault.reason
            ));
        } else {
            debug!("ignoring fault from retired connection {}", fault.connection_id);
        }
    }
}

async fn recovery_loop(link: Weak<LinkInner>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempt: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(link) = upgrade(&link) else { return };
        if link.state() != LinkState::Reconnecting {
            return;
        }
        attempt += 1;
        info!("reconnect attempt {attempt}");

        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            outcome = link.recover_once() => outcome,
        };
        match outcome {
            Ok(()) => {
                if link
                    .inner
                    .status
                    .transition(LinkState::Reconnecting, LinkState::Ready)
                {
                    info!("broker link recovered after {attempt} attempts");
                } else {
                    link.inner.pool.teardown();
                }
                return;
            }
            Err(e) => {
                error!("reconnect attempt {attempt} failed: {e}");
                link.inner.pool.teardown();
            }
        }
    }
}
