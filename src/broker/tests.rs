use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::broker::retry::retry;
use crate::consumer::listener::{ListenerContext, ListenerService};
use crate::invoke::InvokeCorrelator;
use crate::protocol::{
    ConsumerResultResp, ConsumerStatus, ConsumerType, MqMessage, RegisterReq, StatusEntry, SubscribeReq,
};
use crate::test_support::{MockBroker, Reply, endpoint, fail, fast_settings, message, ok};
use crate::transport::{DELIMITER, Envelope, MethodType, RespCode};
use crate::utils::MqError;

fn link_with(mock: &MockBroker, settings: LinkSettings, balance: LoadBalanceKind) -> BrokerLink {
    link_with_listeners(mock, settings, balance, Arc::new(ListenerService::new()))
}

fn link_with_listeners(
    mock: &MockBroker,
    settings: LinkSettings,
    balance: LoadBalanceKind,
    listeners: Arc<ListenerService>,
) -> BrokerLink {
    BrokerLink::new(settings, Arc::new(mock.clone()), balance.build(), listeners)
}

async fn started(mock: &MockBroker, endpoints: Vec<crate::transport::Endpoint>) -> BrokerLink {
    let link = link_with(mock, fast_settings(endpoints), LoadBalanceKind::RoundRobin);
    link.start().await.expect("link start");
    link
}

async fn wait_state(link: &BrokerLink, target: LinkState, within: Duration) -> bool {
    let mut rx = link.watch_state();
    tokio::time::timeout(within, rx.wait_for(|s| *s == target))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

fn subscribed_topics(mock: &MockBroker) -> Vec<String> {
    mock.requests_of(MethodType::Subscribe)
        .iter()
        .map(|env| env.body::<SubscribeReq>().unwrap().topic_name)
        .collect()
}

// ---- registry / retry / state ----

#[test]
fn test_registry_keeps_insertion_order_and_dedups() {
    let registry = SubscriptionRegistry::new();
    let a = SubscriptionRecord::new("t1", "*", "g", ConsumerType::Push);
    let b = SubscriptionRecord::new("t2", "tagA", "g", ConsumerType::Push);

    assert!(registry.insert(a.clone()));
    assert!(registry.insert(b.clone()));
    assert!(!registry.insert(a.clone()));
    assert_eq!(registry.snapshot(), vec![a.clone(), b.clone()]);

    assert!(registry.remove(&a));
    assert!(!registry.remove(&a));
    assert_eq!(registry.snapshot(), vec![b]);
}

#[test]
fn test_records_differ_by_tag_pattern() {
    let registry = SubscriptionRegistry::new();
    registry.insert(SubscriptionRecord::new("t1", "a", "g", ConsumerType::Push));
    registry.insert(SubscriptionRecord::new("t1", "b", "g", ConsumerType::Push));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_retry_stops_at_first_success() {
    let calls = AtomicUsize::new(0);
    let result = retry("op", 3, |n| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 3 {
                Err(MqError::transport("boom"))
            } else {
                Ok(n)
            }
        }
    })
    .await;
    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_runs_at_least_once_and_reports_attempts() {
    let result: Result<(), _> = retry("op", 0, |_| async { Err(MqError::transport("boom")) }).await;
    let exhausted = result.unwrap_err();
    assert_eq!(exhausted.attempts, 1);
    assert!(matches!(
        exhausted.into_error(|attempts| MqError::AcknowledgeFailed { attempts }),
        MqError::AcknowledgeFailed { attempts: 1 }
    ));
}

#[tokio::test]
async fn test_retry_does_not_retry_not_initialized() {
    let calls = AtomicUsize::new(0);
    let result: Result<(), _> = retry("op", 5, |_| {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(MqError::NotInitialized) }
    })
    .await;
    let err = result.unwrap_err().into_error(|attempts| MqError::AcknowledgeFailed { attempts });
    assert!(matches!(err, MqError::NotInitialized));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_transition_only_from_expected_state() {
    let status = LinkStatus::new();
    assert!(!status.transition(LinkState::Ready, LinkState::Reconnecting));
    status.set(LinkState::Ready);
    assert!(status.transition(LinkState::Ready, LinkState::Reconnecting));
    assert!(!status.transition(LinkState::Ready, LinkState::Reconnecting));
    assert_eq!(status.get(), LinkState::Reconnecting);
}

#[tokio::test]
async fn test_wait_ready_outcomes() {
    let status = LinkStatus::new();
    let err = status.wait_ready(Duration::from_millis(50)).await.unwrap_err();
    assert!(matches!(err, MqError::LinkUnavailable(_)));

    status.set(LinkState::InitFailed);
    let err = status.wait_ready(Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, MqError::NotInitialized));

    status.set(LinkState::Ready);
    assert!(status.wait_ready(Duration::from_millis(50)).await.is_ok());
}

#[tokio::test]
async fn test_wait_ready_wakes_on_transition() {
    let status = Arc::new(LinkStatus::new());
    let setter = status.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        setter.set(LinkState::Ready);
    });
    assert!(status.wait_ready(Duration::from_secs(2)).await.is_ok());
}

// ---- pool ----

fn dispatcher() -> Arc<InboundDispatcher> {
    let (tx, _rx) = mpsc::unbounded_channel();
    Arc::new(InboundDispatcher::new(
        "g",
        Arc::new(InvokeCorrelator::new()),
        Arc::new(ListenerService::new()),
        tx,
    ))
}

#[tokio::test]
async fn test_pool_skips_unreachable_endpoints() {
    let mock = MockBroker::new();
    mock.refuse(&endpoint(2));
    let pool = ConnectionPool::new();

    let opened = pool
        .initialize(&[endpoint(1), endpoint(2)], &mock, &dispatcher(), 65535, true)
        .await
        .unwrap();
    assert_eq!(opened, 1);
    assert_eq!(pool.all()[0].endpoint(), &endpoint(1));
}

#[tokio::test]
async fn test_pool_verify_fails_when_nothing_reachable() {
    let mock = MockBroker::new();
    mock.refuse(&endpoint(1));
    let pool = ConnectionPool::new();

    let err = pool
        .initialize(&[endpoint(1)], &mock, &dispatcher(), 65535, true)
        .await
        .unwrap_err();
    assert!(matches!(err, MqError::NoReachableBroker(_)));

    let opened = pool
        .initialize(&[endpoint(1)], &mock, &dispatcher(), 65535, false)
        .await
        .unwrap();
    assert_eq!(opened, 0);
}

#[tokio::test]
async fn test_pool_never_selects_torn_down_connections() {
    let mock = MockBroker::new();
    let pool = ConnectionPool::new();
    pool.initialize(&[endpoint(1)], &mock, &dispatcher(), 65535, true)
        .await
        .unwrap();
    let balancer = LoadBalanceKind::RoundRobin.build();

    let conn = pool.select(balancer.as_ref(), None).unwrap();
    pool.teardown();
    assert!(conn.is_closed());
    assert!(pool.is_empty());
    assert!(pool.select(balancer.as_ref(), None).is_err());
}

#[tokio::test]
async fn test_pool_reinitialize_replaces_connections() {
    let mock = MockBroker::new();
    let pool = ConnectionPool::new();
    let d = dispatcher();
    pool.initialize(&[endpoint(1)], &mock, &d, 65535, true).await.unwrap();
    let first = pool.all()[0].clone();

    pool.initialize(&[endpoint(1)], &mock, &d, 65535, true).await.unwrap();
    assert!(first.is_closed());
    assert!(!pool.contains(first.id()));
    assert_eq!(pool.len(), 1);
}

// ---- link lifecycle ----

#[tokio::test]
async fn test_start_registers_on_every_endpoint() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1), endpoint(2)]).await;

    assert_eq!(link.state(), LinkState::Ready);
    let registered: Vec<_> = mock
        .requests_of(MethodType::Register)
        .iter()
        .map(|env| env.body::<RegisterReq>().unwrap().service_entry)
        .collect();
    assert_eq!(registered.len(), 2);
    assert!(registered.iter().all(|e| e.group_name == "test-group"));
    assert_eq!(registered[0].port, 1);
    assert_eq!(registered[1].port, 2);
}

#[tokio::test]
async fn test_start_fails_when_no_broker_reachable() {
    let mock = MockBroker::new();
    mock.refuse(&endpoint(1));
    let link = link_with(&mock, fast_settings(vec![endpoint(1)]), LoadBalanceKind::RoundRobin);

    let err = link.start().await.unwrap_err();
    assert!(matches!(err, MqError::NoReachableBroker(_)));
    assert_eq!(link.state(), LinkState::InitFailed);

    let err = link.subscribe("t1", "*", ConsumerType::Push).await.unwrap_err();
    assert!(matches!(err, MqError::NotInitialized));
}

#[tokio::test]
async fn test_start_fails_when_every_registration_is_refused() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::Register => fail(),
        _ => ok(),
    });
    let link = link_with(&mock, fast_settings(vec![endpoint(1), endpoint(2)]), LoadBalanceKind::RoundRobin);

    let err = link.start().await.unwrap_err();
    assert!(matches!(err, MqError::RegistrationFailed));
    assert_eq!(link.state(), LinkState::InitFailed);
}

#[tokio::test]
async fn test_start_tolerates_partial_registration() {
    let mock = MockBroker::new();
    let refused = endpoint(2);
    mock.respond_with(move |ep, env| match env.method_type {
        MethodType::Register if *ep == refused => fail(),
        _ => ok(),
    });
    let mut settings = fast_settings(vec![endpoint(1), endpoint(2)]);
    settings.check = false;
    let link = link_with(&mock, settings, LoadBalanceKind::ConsistentHash);
    link.start().await.unwrap();
    assert_eq!(link.state(), LinkState::Ready);
    assert_eq!(link.connections().len(), 2);

    let chosen = link.select(Some("k")).await.unwrap();
    for _ in 0..5 {
        assert_eq!(link.select(Some("k")).await.unwrap().id(), chosen.id());
    }
}

#[tokio::test]
async fn test_start_without_check_tolerates_unreachable_brokers() {
    let mock = MockBroker::new();
    mock.refuse(&endpoint(1));
    let mut settings = fast_settings(vec![endpoint(1)]);
    settings.check = false;
    let link = link_with(&mock, settings, LoadBalanceKind::RoundRobin);

    link.start().await.unwrap();
    assert!(link.connections().is_empty());
}

#[tokio::test]
async fn test_select_before_start_waits_then_gives_up() {
    let mock = MockBroker::new();
    let mut settings = fast_settings(vec![endpoint(1)]);
    settings.ready_wait = Duration::from_millis(100);
    let link = link_with(&mock, settings, LoadBalanceKind::RoundRobin);

    let err = link.select(None).await.unwrap_err();
    assert!(matches!(err, MqError::LinkUnavailable(_)));
}

#[tokio::test]
async fn test_trigger_reconnect_ignored_unless_ready() {
    let mock = MockBroker::new();
    let link = link_with(&mock, fast_settings(vec![endpoint(1)]), LoadBalanceKind::RoundRobin);
    assert!(!link.trigger_reconnect("test"));
    assert_eq!(link.state(), LinkState::Initializing);
}

// ---- subscribe / ack / pull ----

#[tokio::test]
async fn test_subscribe_is_idempotent_in_registry() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();
    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();
    assert_eq!(link.registry().len(), 1);

    let req = mock.requests_of(MethodType::Subscribe)[0].body::<SubscribeReq>().unwrap();
    assert_eq!(req.group_name, "test-group");
    assert_eq!(req.topic_name, "t1");
    assert_eq!(req.tag_regex, "*");
}

#[tokio::test]
async fn test_subscribe_succeeds_on_last_allowed_attempt() {
    let mock = MockBroker::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    mock.respond_with(move |_, env| match env.method_type {
        MethodType::Subscribe if counter.fetch_add(1, Ordering::SeqCst) < 2 => fail(),
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();
    assert_eq!(mock.count(MethodType::Subscribe), 3);
    assert_eq!(link.registry().len(), 1);

    // every attempt carries its own trace id
    let ids: std::collections::HashSet<_> = mock
        .requests_of(MethodType::Subscribe)
        .into_iter()
        .map(|env| env.trace_id)
        .collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn test_subscribe_gives_up_after_ceiling() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::Subscribe => fail(),
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    let err = link.subscribe("t1", "*", ConsumerType::Push).await.unwrap_err();
    assert!(matches!(err, MqError::SubscribeFailed { attempts: 3, .. }));
    assert_eq!(mock.count(MethodType::Subscribe), 3);
    assert!(link.registry().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_removes_record() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;
    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();

    link.unsubscribe("t1", "*", ConsumerType::Push).await.unwrap();
    assert!(link.registry().is_empty());
    assert_eq!(mock.count(MethodType::UnSubscribe), 1);
}

#[tokio::test]
async fn test_unsubscribe_failure_keeps_record() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::UnSubscribe => fail(),
        _ => ok(),
    });
    let mut settings = fast_settings(vec![endpoint(1)]);
    settings.unsubscribe_max_attempt = 2;
    let link = link_with(&mock, settings, LoadBalanceKind::RoundRobin);
    link.start().await.unwrap();
    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();

    let err = link.unsubscribe("t1", "*", ConsumerType::Push).await.unwrap_err();
    assert!(matches!(err, MqError::UnsubscribeFailed { attempts: 2, .. }));
    assert_eq!(link.registry().len(), 1);
}

#[tokio::test]
async fn test_acknowledge_gives_up_after_ceiling() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::ConsumerStatus => fail(),
        _ => ok(),
    });
    let mut settings = fast_settings(vec![endpoint(1)]);
    settings.consumer_status_max_attempt = 2;
    let link = link_with(&mock, settings, LoadBalanceKind::RoundRobin);
    link.start().await.unwrap();

    let err = link.acknowledge("m1", ConsumerStatus::Success).await.unwrap_err();
    assert!(matches!(err, MqError::AcknowledgeFailed { attempts: 2 }));
    assert_eq!(mock.count(MethodType::ConsumerStatus), 2);
}

#[tokio::test]
async fn test_acknowledge_carries_flat_status_entry() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    link.acknowledge("m1", ConsumerStatus::Later).await.unwrap();
    let sent: serde_json::Value =
        serde_json::from_str(&mock.requests_of(MethodType::ConsumerStatus)[0].json).unwrap();
    assert_eq!(sent["messageId"], "m1");
    assert_eq!(sent["messageStatus"], "L");
    assert_eq!(sent["consumerGroupName"], "test-group");
}

#[tokio::test]
async fn test_pull_times_out_against_silent_broker() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::MessagePull => Reply::Silent,
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    let started_at = tokio::time::Instant::now();
    let err = link.pull("t1", "*", 10).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started_at.elapsed() >= Duration::from_millis(300));
    assert_eq!(link.correlator().remaining(), 0);
}

#[tokio::test]
async fn test_pull_returns_broker_list() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::MessagePull => Reply::Respond(serde_json::json!({
            "respCode": "SUCCESS",
            "respMessage": "success",
            "list": [{"traceId": "m1", "topic": "t1", "payload": "x"}],
        })),
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    let resp = link.pull("t1", "*", 5).await.unwrap();
    assert_eq!(resp.resp_code, RespCode::Success);
    assert_eq!(resp.list.len(), 1);
    assert_eq!(resp.list[0].message_id(), "m1");
}

// ---- selection ----

#[tokio::test]
async fn test_consistent_hash_selection_is_deterministic() {
    let mock = MockBroker::new();
    let link = link_with(
        &mock,
        fast_settings(vec![endpoint(1), endpoint(2)]),
        LoadBalanceKind::ConsistentHash,
    );
    link.start().await.unwrap();

    let first = link.select(Some("order-42")).await.unwrap();
    for _ in 0..10 {
        let again = link.select(Some("order-42")).await.unwrap();
        assert_eq!(again.id(), first.id());
    }
}

#[tokio::test]
async fn test_round_robin_spreads_over_endpoints() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1), endpoint(2)]).await;

    let a = link.select(None).await.unwrap();
    let b = link.select(None).await.unwrap();
    assert_ne!(a.endpoint(), b.endpoint());
}

// ---- heartbeat / reconnect ----

#[tokio::test]
async fn test_heartbeats_flow_while_ready() {
    let mock = MockBroker::new();
    let _link = started(&mock, vec![endpoint(1)]).await;
    assert!(mock.wait_for(MethodType::Heartbeat, 2, Duration::from_secs(2)).await);

    let body: serde_json::Value = serde_json::from_str(&mock.requests_of(MethodType::Heartbeat)[0].json).unwrap();
    assert_eq!(body["port"], 0);
    assert_eq!(body["address"], "127.0.0.1");
}

#[tokio::test]
async fn test_heartbeat_non_success_is_not_a_failure() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::Heartbeat => fail(),
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;
    assert!(link.heartbeat().await.is_ok());
}

#[tokio::test]
async fn test_silent_heartbeat_reconnects_and_replays_subscriptions_once() {
    let mock = MockBroker::new();
    let heartbeats = Arc::new(AtomicUsize::new(0));
    let counter = heartbeats.clone();
    mock.respond_with(move |_, env| match env.method_type {
        MethodType::Heartbeat if counter.fetch_add(1, Ordering::SeqCst) == 0 => Reply::Silent,
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;
    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();
    link.subscribe("t2", "tagA", ConsumerType::Push).await.unwrap();
    mock.clear_requests();

    assert!(wait_state(&link, LinkState::Reconnecting, Duration::from_secs(3)).await);
    assert!(wait_state(&link, LinkState::Ready, Duration::from_secs(3)).await);

    assert_eq!(mock.count(MethodType::Register), 1);
    assert_eq!(subscribed_topics(&mock), vec!["t1", "t2"]);
    assert_eq!(link.registry().len(), 2);
    assert_eq!(mock.connects(), 2);
}

#[tokio::test]
async fn test_severed_connection_triggers_reconnect() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;
    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();
    let before = link.connections()[0].id().to_string();
    mock.clear_requests();

    mock.sever_all();
    assert!(wait_state(&link, LinkState::Reconnecting, Duration::from_secs(2)).await);
    assert!(wait_state(&link, LinkState::Ready, Duration::from_secs(3)).await);

    assert_eq!(subscribed_topics(&mock), vec!["t1"]);
    let after = link.connections();
    assert_eq!(after.len(), 1);
    assert_ne!(after[0].id(), before);
}

#[tokio::test]
async fn test_recovery_keeps_retrying_and_suppresses_heartbeats() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    mock.refuse(&endpoint(1));
    mock.sever_all();
    assert!(wait_state(&link, LinkState::Reconnecting, Duration::from_secs(2)).await);
    mock.clear_requests();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(link.state(), LinkState::Reconnecting);
    assert_eq!(mock.count(MethodType::Heartbeat), 0);

    mock.accept(&endpoint(1));
    assert!(wait_state(&link, LinkState::Ready, Duration::from_secs(3)).await);
    assert!(mock.wait_for(MethodType::Heartbeat, 1, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_recovery_requires_registration() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    mock.respond_with(|_, env| match env.method_type {
        MethodType::Register => fail(),
        _ => ok(),
    });
    mock.sever_all();
    assert!(wait_state(&link, LinkState::Reconnecting, Duration::from_secs(2)).await);
    assert!(mock.wait_for(MethodType::Register, 3, Duration::from_secs(3)).await);
    assert_eq!(link.state(), LinkState::Reconnecting);

    mock.respond_with(|_, _| ok());
    assert!(wait_state(&link, LinkState::Ready, Duration::from_secs(3)).await);
}

// ---- shutdown ----

#[tokio::test]
async fn test_shutdown_unregisters_and_stops() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1), endpoint(2)]).await;

    link.shutdown(Duration::from_millis(100)).await;
    assert_eq!(link.state(), LinkState::Stopped);
    assert!(mock.wait_for(MethodType::UnRegister, 2, Duration::from_secs(2)).await);
    assert!(link.connections().is_empty());

    let heartbeats = mock.count(MethodType::Heartbeat);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock.count(MethodType::Heartbeat), heartbeats);

    let err = link.select(None).await.unwrap_err();
    assert!(matches!(err, MqError::LinkUnavailable(_)));
}

#[tokio::test]
async fn test_shutdown_waits_for_outstanding_calls() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::MessagePull => Reply::Silent,
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    let puller = link.clone();
    let pull = tokio::spawn(async move { puller.pull("t1", "*", 1).await });
    assert!(mock.wait_for(MethodType::MessagePull, 1, Duration::from_secs(1)).await);

    let started_at = tokio::time::Instant::now();
    link.shutdown(Duration::from_secs(5)).await;
    // the pull times out on its own deadline, well before the drain window
    assert!(started_at.elapsed() < Duration::from_secs(2));
    assert!(pull.await.unwrap().unwrap_err().is_timeout());
}

#[tokio::test]
async fn test_abandoned_call_leaves_nothing_outstanding() {
    let mock = MockBroker::new();
    mock.respond_with(|_, env| match env.method_type {
        MethodType::MessagePull => Reply::Silent,
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    let abandoned = tokio::time::timeout(Duration::from_millis(50), link.pull("t1", "*", 1)).await;
    assert!(abandoned.is_err());
    assert_eq!(link.correlator().remaining(), 0);

    let started_at = tokio::time::Instant::now();
    link.shutdown(Duration::from_secs(5)).await;
    assert!(started_at.elapsed() < Duration::from_secs(1));
}

// ---- framing ----

#[tokio::test]
async fn test_topic_containing_delimiter_reaches_broker_intact() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    let topic = format!("a{}b", String::from_utf8_lossy(DELIMITER));
    link.subscribe(&topic, "*", ConsumerType::Push).await.unwrap();
    assert_eq!(subscribed_topics(&mock), vec![topic]);
    assert_eq!(link.state(), LinkState::Ready);
}

#[tokio::test]
async fn test_oversized_batch_ack_fails_without_waiting() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    let entries: Vec<StatusEntry> = (0..2000)
        .map(|i| StatusEntry {
            message_id: format!("message-{i:0>32}"),
            message_status: ConsumerStatus::Success,
            consumer_group_name: "test-group".into(),
        })
        .collect();
    let started_at = tokio::time::Instant::now();
    let err = link.acknowledge_batch(entries).await.unwrap_err();
    assert!(matches!(err, MqError::Frame(_)));
    assert!(started_at.elapsed() < Duration::from_millis(200));
    assert_eq!(mock.count(MethodType::ConsumerStatusBatch), 0);
    assert_eq!(link.correlator().remaining(), 0);
}

// ---- inbound dispatch ----

fn listeners_with(status: ConsumerStatus) -> Arc<ListenerService> {
    let listeners = Arc::new(ListenerService::new());
    listeners.register(Arc::new(
        move |_: &MqMessage, _: &ListenerContext| -> anyhow::Result<ConsumerStatus> { Ok(status) },
    ));
    listeners
}

#[tokio::test]
async fn test_push_reply_carries_listener_status() {
    let mock = MockBroker::new();
    let link = link_with_listeners(
        &mock,
        fast_settings(vec![endpoint(1)]),
        LoadBalanceKind::RoundRobin,
        listeners_with(ConsumerStatus::Success),
    );
    link.start().await.unwrap();

    let trace_id = mock.push(&message("t1", "m1")).unwrap();
    let replies = mock.wait_for_push_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].trace_id, trace_id);
    assert_eq!(replies[0].method_type, MethodType::MessagePush);
    assert_eq!(replies[0].resp_code, Some(RespCode::Success));

    let body: ConsumerResultResp = replies[0].body().unwrap();
    assert_eq!(body.consumer_status, Some(ConsumerStatus::Success));
}

#[tokio::test]
async fn test_push_without_listener_asks_for_redelivery() {
    let mock = MockBroker::new();
    let _link = started(&mock, vec![endpoint(1)]).await;

    mock.push(&message("t1", "m1")).unwrap();
    let replies = mock.wait_for_push_replies(1, Duration::from_secs(2)).await;
    let body: ConsumerResultResp = replies[0].body().unwrap();
    assert_eq!(body.consumer_status, Some(ConsumerStatus::Later));
}

#[tokio::test]
async fn test_listener_error_answers_fail() {
    let mock = MockBroker::new();
    let listeners = Arc::new(ListenerService::new());
    listeners.register(Arc::new(
        |_: &MqMessage, _: &ListenerContext| -> anyhow::Result<ConsumerStatus> { anyhow::bail!("boom") },
    ));
    let link = link_with_listeners(&mock, fast_settings(vec![endpoint(1)]), LoadBalanceKind::RoundRobin, listeners);
    link.start().await.unwrap();

    mock.push(&message("t1", "m1")).unwrap();
    let replies = mock.wait_for_push_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies[0].resp_code, Some(RespCode::Fail));
    let body: ConsumerResultResp = replies[0].body().unwrap();
    assert_eq!(body.consumer_status, None);
}

#[tokio::test]
async fn test_malformed_frame_is_dropped_and_connection_survives() {
    let mock = MockBroker::new();
    let link = link_with_listeners(
        &mock,
        fast_settings(vec![endpoint(1)]),
        LoadBalanceKind::RoundRobin,
        listeners_with(ConsumerStatus::Success),
    );
    link.start().await.unwrap();

    let mut garbage = b"{not json".to_vec();
    garbage.extend_from_slice(DELIMITER);
    assert!(mock.push_raw(&garbage));
    mock.push(&message("t1", "m1")).unwrap();

    let replies = mock.wait_for_push_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(link.state(), LinkState::Ready);
    assert_eq!(mock.connects(), 1);
}

#[tokio::test]
async fn test_unsupported_inbound_request_answered_with_fail() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    let request = Envelope::request("abc123", MethodType::Heartbeat, &serde_json::json!({})).unwrap();
    let mut frame = serde_json::to_vec(&request).unwrap();
    frame.extend_from_slice(DELIMITER);
    assert!(mock.push_raw(&frame));

    let replies = mock.wait_for_push_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies[0].trace_id, "abc123");
    assert_eq!(replies[0].resp_code, Some(RespCode::Fail));
    assert_eq!(link.state(), LinkState::Ready);
}

#[tokio::test]
async fn test_stray_response_is_ignored() {
    let mock = MockBroker::new();
    let link = started(&mock, vec![endpoint(1)]).await;

    let stray = Envelope::response_to(
        &Envelope::request("nobody-waits", MethodType::Subscribe, &serde_json::json!({})).unwrap(),
        RespCode::Success,
        &serde_json::json!({"respCode": "SUCCESS"}),
    )
    .unwrap();
    let mut frame = serde_json::to_vec(&stray).unwrap();
    frame.extend_from_slice(DELIMITER);
    assert!(mock.push_raw(&frame));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.state(), LinkState::Ready);
    assert_eq!(link.correlator().remaining(), 0);
    link.subscribe("t1", "*", ConsumerType::Push).await.unwrap();
}

#[tokio::test]
async fn test_broker_dropping_mid_call_times_out_and_recovers() {
    let mock = MockBroker::new();
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = pulls.clone();
    mock.respond_with(move |_, env| match env.method_type {
        MethodType::MessagePull if counter.fetch_add(1, Ordering::SeqCst) == 0 => Reply::Sever,
        _ => ok(),
    });
    let link = started(&mock, vec![endpoint(1)]).await;

    let err = link.pull("t1", "*", 1).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(wait_state(&link, LinkState::Ready, Duration::from_secs(3)).await);
    assert_eq!(mock.connects(), 2);
    assert!(link.pull("t1", "*", 1).await.is_ok());
}
