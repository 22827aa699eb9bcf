//! # Gateway Flow Tests
//!
//! End-to-end behaviour of the processor and sender against the in-memory
//! broker: routing, fan-out, fault recovery, retry budget and shutdown.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_gateway::{
    codec, BrokerClient, BrokerError, BusMessage, ConnectionState, Disposition, Envelope,
    ExecutionCommand, ExecutionOptions, ExecutionRequest, FrontendRequester, GatewayConfig,
    HandlerRegistry, HealthCell, InMemoryBroker, MessageHandler, MessageSender, Processor,
    ProcessorState, SendStatus, Shutdown, ShutdownSignal, TenantContext, TransportFault,
    TypedHandler, MESSAGE_TYPE_HEADER, TENANT_HEADER,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Ping {}

impl BusMessage for Ping {
    const TYPE_NAME: &'static str = "Ping";
}

/// Collects the message text of every WARN event.
#[derive(Clone, Default)]
struct WarnCollector {
    messages: Arc<Mutex<Vec<String>>>,
}

impl WarnCollector {
    fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for WarnCollector {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.messages.lock().push(visitor.0);
        }
    }
}

fn capture_warnings() -> (WarnCollector, tracing::subscriber::DefaultGuard) {
    let collector = WarnCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (collector, guard)
}

struct CountingPing {
    calls: AtomicUsize,
}

impl CountingPing {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TypedHandler<Ping> for CountingPing {
    async fn handle(&self, _message: Ping, _signal: &ShutdownSignal) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

struct FixedResult {
    result: bool,
    calls: AtomicUsize,
}

impl FixedResult {
    fn new(result: bool) -> Arc<Self> {
        Arc::new(Self {
            result,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MessageHandler for FixedResult {
    fn can_handle(&self, message_type: &str) -> bool {
        message_type == "Ping"
    }

    async fn handle(&self, _body: &[u8], _signal: &ShutdownSignal) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
    }
}

struct Harness {
    broker: InMemoryBroker,
    processor: Arc<Processor>,
    shutdown: Shutdown,
    task: JoinHandle<()>,
}

impl Harness {
    async fn start(registry: HandlerRegistry) -> Self {
        Self::start_with(GatewayConfig::default(), registry).await
    }

    async fn start_with(config: GatewayConfig, registry: HandlerRegistry) -> Self {
        let broker = InMemoryBroker::new("test-ns");
        let processor = Arc::new(Processor::new(
            Arc::new(broker.clone()),
            &config,
            Arc::new(registry),
            Arc::new(HealthCell::new()),
        ));
        let shutdown = Shutdown::new();
        let task = tokio::spawn(Arc::clone(&processor).run(shutdown.signal()));

        let running = Arc::clone(&processor);
        wait_until(|| running.state() == ProcessorState::Running).await;

        Self {
            broker,
            processor,
            shutdown,
            task,
        }
    }

    fn publish(&self, envelope: Envelope) {
        self.broker.publish("requests", envelope);
    }

    async fn settle(&self, message_id: &str) -> Disposition {
        let broker = self.broker.clone();
        let id = message_id.to_string();
        wait_until(|| broker.disposition_of(&id).is_some()).await;
        self.broker
            .disposition_of(message_id)
            .expect("settlement recorded")
    }

    async fn stop(self) {
        self.shutdown.trigger();
        self.task.await.expect("processor task");
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Let spawned dispatches run to completion.
async fn settle_tasks() {
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }
}

fn ping(tenant: &str, id: &str) -> Envelope {
    let body = codec::encode(&Ping {}).expect("encode");
    Envelope::new(body, "Ping", tenant, id, codec::CONTENT_TYPE)
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_ping_handled_without_warning() {
    let (warnings, _guard) = capture_warnings();
    let handler = FixedResult::new(true);
    let harness = Harness::start(HandlerRegistry::default().with_handler(handler.clone())).await;

    harness.publish(Envelope::new(
        b"{}".to_vec(),
        "Ping",
        "t1",
        "c1",
        codec::CONTENT_TYPE,
    ));

    assert_eq!(harness.settle("c1").await, Disposition::Completed);
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.stats().snapshot().handled == 1).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.processor.stats().snapshot().dead_lettered, 0);
    assert_eq!(warnings.count(), 0, "warnings: {:?}", warnings.messages());

    harness.stop().await;
}

#[tokio::test]
async fn test_typed_handler_receives_decoded_payload() {
    let handler = CountingPing::new();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(Arc::clone(&handler)))
            .await;

    harness.publish(ping("t1", "c1"));
    assert_eq!(harness.settle("c1").await, Disposition::Completed);
    wait_until(|| handler.calls() == 1).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_unknown_type_completed_with_one_warning() {
    let (warnings, _guard) = capture_warnings();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(CountingPing::new()))
            .await;

    harness.publish(Envelope::new(
        b"{}".to_vec(),
        "Unknown",
        "t1",
        "c2",
        codec::CONTENT_TYPE,
    ));

    assert_eq!(harness.settle("c2").await, Disposition::Completed);
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.stats().snapshot().unhandled == 1).await;

    let messages = warnings.messages();
    assert_eq!(messages.len(), 1, "warnings: {messages:?}");
    assert!(messages[0].contains("No handler registered"));

    harness.stop().await;
}

#[tokio::test]
async fn test_invalid_headers_dead_lettered_without_dispatch() {
    let handler = CountingPing::new();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(Arc::clone(&handler)))
            .await;

    let cases: [(&str, fn(&mut Envelope), &str); 4] = [
        ("m1", |e| drop(e.remove_header(TENANT_HEADER)), "missing tenant header"),
        ("m2", |e| drop(e.remove_header(MESSAGE_TYPE_HEADER)), "missing type header"),
        ("m3", |e| e.set_header(TENANT_HEADER, ""), "empty tenant header"),
        ("m4", |e| e.set_header(MESSAGE_TYPE_HEADER, ""), "empty type header"),
    ];

    for (id, mutate, reason) in cases {
        let mut envelope = ping("t1", id);
        mutate(&mut envelope);
        harness.publish(envelope);

        assert_eq!(
            harness.settle(id).await,
            Disposition::DeadLettered {
                reason: reason.to_string()
            }
        );
    }

    settle_tasks().await;
    assert_eq!(handler.calls(), 0);
    assert_eq!(harness.processor.stats().snapshot().dead_lettered, 4);

    harness.stop().await;
}

#[tokio::test]
async fn test_header_key_is_case_sensitive() {
    let handler = CountingPing::new();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(Arc::clone(&handler)))
            .await;

    let mut envelope = ping("t1", "c1");
    envelope.remove_header(TENANT_HEADER);
    envelope.set_header("TenantId", "t1");
    harness.publish(envelope);

    assert_eq!(
        harness.settle("c1").await,
        Disposition::DeadLettered {
            reason: "missing tenant header".to_string()
        }
    );
    assert_eq!(handler.calls(), 0);

    harness.stop().await;
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn test_fan_out_any_success_no_warning() {
    let (warnings, _guard) = capture_warnings();
    let failing = FixedResult::new(false);
    let succeeding = FixedResult::new(true);
    let registry = HandlerRegistry::default()
        .with_handler(failing.clone())
        .with_handler(succeeding.clone());
    let harness = Harness::start(registry).await;

    harness.publish(ping("t1", "c1"));
    harness.settle("c1").await;
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.stats().snapshot().handled == 1).await;

    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    assert_eq!(succeeding.calls.load(Ordering::SeqCst), 1);
    assert!(
        !warnings
            .messages()
            .iter()
            .any(|m| m.contains("No handler succeeded")),
        "warnings: {:?}",
        warnings.messages()
    );

    harness.stop().await;
}

#[tokio::test]
async fn test_all_handlers_failed_warns_once() {
    let (warnings, _guard) = capture_warnings();
    let registry = HandlerRegistry::default()
        .with_handler(FixedResult::new(false))
        .with_handler(FixedResult::new(false));
    let harness = Harness::start(registry).await;

    harness.publish(ping("t1", "c1"));
    assert_eq!(harness.settle("c1").await, Disposition::Completed);
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.stats().snapshot().failed == 1).await;

    let messages = warnings.messages();
    assert_eq!(messages.len(), 1, "warnings: {messages:?}");
    assert!(messages[0].contains("No handler succeeded"));

    harness.stop().await;
}

// =============================================================================
// Fault Recovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_socket_error_reconnects_after_cooldown() {
    let handler = CountingPing::new();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(Arc::clone(&handler)))
            .await;
    assert_eq!(harness.broker.subscriptions_opened(), 1);

    harness.broker.inject_fault(
        "requests",
        "processor",
        BrokerError::Connection("connection reset".into()),
    );
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.state() == ProcessorState::Starting).await;
    assert_eq!(harness.processor.health(), ConnectionState::ConnectionFailed);

    // Published during the cool-down; must wait for the new subscription.
    harness.publish(ping("t1", "c1"));

    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(harness.broker.subscriptions_opened(), 1);
    assert_eq!(handler.calls(), 0);
    assert_eq!(harness.processor.stats().snapshot().received, 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.settle("c1").await, Disposition::Completed);
    assert_eq!(harness.broker.subscriptions_opened(), 2);
    assert_eq!(handler.calls(), 1);
    assert_eq!(harness.processor.health(), ConnectionState::Healthy);
    assert_eq!(harness.processor.stats().snapshot().reconnects, 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_link_drop_treated_as_connection_failure() {
    let harness = Harness::start(HandlerRegistry::default()).await;

    harness.broker.disconnect("requests", "processor");
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.state() == ProcessorState::Starting).await;
    assert_eq!(harness.processor.health(), ConnectionState::ConnectionFailed);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(harness.broker.subscriptions_opened(), 2);
    assert_eq!(harness.processor.state(), ProcessorState::Running);

    harness.stop().await;
}

#[tokio::test]
async fn test_auth_error_keeps_subscription() {
    let handler = CountingPing::new();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(Arc::clone(&handler)))
            .await;

    harness.broker.inject_fault(
        "requests",
        "processor",
        BrokerError::Unauthorized("token expired".into()),
    );
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.health() == ConnectionState::AuthFailed).await;

    harness.publish(ping("t1", "c1"));
    assert_eq!(harness.settle("c1").await, Disposition::Completed);
    wait_until(|| handler.calls() == 1).await;

    assert_eq!(harness.broker.subscriptions_opened(), 1);
    assert_eq!(harness.processor.health(), ConnectionState::Healthy);
    assert_eq!(harness.processor.stats().snapshot().reconnects, 0);

    harness.stop().await;
}

#[tokio::test]
async fn test_unclassified_error_leaves_health_alone() {
    let harness = Harness::start(HandlerRegistry::default()).await;

    harness
        .broker
        .inject_fault("requests", "processor", BrokerError::Other("quota".into()));
    settle_tasks().await;

    assert_eq!(harness.processor.health(), ConnectionState::Healthy);
    assert_eq!(harness.processor.state(), ProcessorState::Running);
    assert_eq!(harness.broker.subscriptions_opened(), 1);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_repeated_auth_faults_warn_once_per_window() {
    let (warnings, _guard) = capture_warnings();
    let config = GatewayConfig::default();
    let processor = Processor::new(
        Arc::new(InMemoryBroker::new("test-ns")),
        &config,
        Arc::new(HandlerRegistry::default()),
        Arc::new(HealthCell::new()),
    );
    let fault = || {
        TransportFault::new(
            "test-ns/requests/subscriptions/processor",
            BrokerError::Unauthorized("token expired".into()),
        )
    };

    for _ in 0..5 {
        processor.on_fault(&fault());
    }
    assert_eq!(warnings.count(), 1);

    tokio::time::sleep(config.error_log_window + Duration::from_secs(1)).await;
    processor.on_fault(&fault());
    assert_eq!(warnings.count(), 2);

    // A different resource is limited independently.
    processor.on_fault(&TransportFault::new(
        "test-ns/other/subscriptions/processor",
        BrokerError::Unauthorized("token expired".into()),
    ));
    assert_eq!(warnings.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_initial_subscribe_retried() {
    let broker = InMemoryBroker::new("test-ns");
    broker.fail_next_subscribe(BrokerError::Connection("dns lookup failed".into()));
    let health = Arc::new(HealthCell::new());
    let processor = Arc::new(Processor::new(
        Arc::new(broker.clone()),
        &GatewayConfig::default(),
        Arc::new(HandlerRegistry::default()),
        Arc::clone(&health),
    ));
    let shutdown = Shutdown::new();
    let task = tokio::spawn(Arc::clone(&processor).run(shutdown.signal()));

    settle_tasks().await;
    assert_eq!(health.current(), ConnectionState::ConnectionFailed);
    assert_eq!(broker.subscriptions_opened(), 0);

    tokio::time::sleep(Duration::from_secs(21)).await;
    assert_eq!(broker.subscriptions_opened(), 1);
    assert_eq!(health.current(), ConnectionState::Healthy);

    shutdown.trigger();
    task.await.expect("processor task");
}

// =============================================================================
// Producer
// =============================================================================

#[tokio::test]
async fn test_retry_budget_recreates_sender_after_budget_plus_one() {
    const BUDGET: i64 = 50;
    let broker = InMemoryBroker::new("test-ns");
    let sender = MessageSender::new(Arc::new(broker.clone()), "requests", BUDGET);
    broker.fail_all_sends(Some(BrokerError::Unauthorized("stale token".into())));

    let status = sender.send(&Ping {}, "t1", "c0").await.expect("send");
    assert_eq!(status, SendStatus::Dropped);
    let original = sender.current_sender_id().await.expect("sender created");

    for attempt in 1..=BUDGET {
        sender
            .send(&Ping {}, "t1", &format!("c{attempt}"))
            .await
            .expect("send");
        if attempt < BUDGET {
            assert_eq!(sender.current_sender_id().await, Some(original));
        }
    }

    // BUDGET + 1 consecutive failures: the sender was discarded.
    assert_eq!(sender.current_sender_id().await, None);
    assert_eq!(sender.auth_budget_remaining(), BUDGET);

    broker.fail_all_sends(None);
    let status = sender.send(&Ping {}, "t1", "after").await.expect("send");
    assert_eq!(status, SendStatus::Accepted);
    let replacement = sender.current_sender_id().await.expect("sender recreated");
    assert_ne!(original, replacement);
    assert_eq!(broker.senders_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_send_auth_failures_warn_once_per_window() {
    let (warnings, _guard) = capture_warnings();
    let config = GatewayConfig::default();
    let broker = InMemoryBroker::new("test-ns");
    let sender = MessageSender::from_config(Arc::new(broker.clone()), &config);
    broker.fail_all_sends(Some(BrokerError::Unauthorized("stale token".into())));

    for attempt in 0..5 {
        let status = sender
            .send(&Ping {}, "t1", &format!("c{attempt}"))
            .await
            .expect("send");
        assert_eq!(status, SendStatus::Dropped);
    }
    assert_eq!(warnings.count(), 1);

    tokio::time::sleep(config.error_log_window + Duration::from_secs(1)).await;
    sender.send(&Ping {}, "t1", "late").await.expect("send");
    assert_eq!(warnings.count(), 2);
}

struct RequestSink {
    seen: Mutex<Vec<ExecutionRequest>>,
}

#[async_trait]
impl TypedHandler<ExecutionRequest> for RequestSink {
    async fn handle(&self, message: ExecutionRequest, _signal: &ShutdownSignal) -> bool {
        self.seen.lock().push(message);
        true
    }
}

#[tokio::test]
async fn test_requester_to_processor_with_tenant_filter() {
    let sink = Arc::new(RequestSink {
        seen: Mutex::new(Vec::new()),
    });
    let config = GatewayConfig {
        tenant_id: Some("t1".into()),
        ..GatewayConfig::default()
    };
    let harness = Harness::start_with(
        config.clone(),
        HandlerRegistry::default().with_typed::<ExecutionRequest, _>(Arc::clone(&sink)),
    )
    .await;

    let client: Arc<dyn BrokerClient> = Arc::new(harness.broker.clone());
    let sender = Arc::new(MessageSender::from_config(Arc::clone(&client), &config));
    let ours = FrontendRequester::new(Arc::clone(&sender), TenantContext::new("t1"), "ops");
    let theirs = FrontendRequester::new(sender, TenantContext::new("t2"), "ops");

    let skipped = theirs
        .request_execution(ExecutionCommand::GitSync, "p0", ExecutionOptions::default())
        .await
        .expect("send");
    let receipt = ours
        .request_execution(ExecutionCommand::UpdateCache, "p1", ExecutionOptions::default())
        .await
        .expect("send");

    assert_eq!(harness.settle(&receipt.correlation_id).await, Disposition::Completed);
    wait_until(|| sink.seen.lock().len() == 1).await;
    settle_tasks().await;

    let seen = sink.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].command, ExecutionCommand::UpdateCache);
    assert_eq!(seen[0].tenant_id, "t1");
    assert_eq!(harness.broker.disposition_of(&skipped.correlation_id), None);

    harness.stop().await;
}

// =============================================================================
// Shutdown
// =============================================================================

struct Gated {
    entered: Notify,
    release: Notify,
    finished: AtomicUsize,
}

#[async_trait]
impl MessageHandler for Gated {
    fn can_handle(&self, message_type: &str) -> bool {
        message_type == "Ping"
    }

    async fn handle(&self, _body: &[u8], _signal: &ShutdownSignal) -> bool {
        self.entered.notify_one();
        self.release.notified().await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        true
    }
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_dispatch() {
    let gated = Arc::new(Gated {
        entered: Notify::new(),
        release: Notify::new(),
        finished: AtomicUsize::new(0),
    });
    let harness = Harness::start(HandlerRegistry::default().with_handler(gated.clone())).await;

    harness.publish(ping("t1", "c1"));
    gated.entered.notified().await;

    harness.shutdown.trigger();
    let processor = Arc::clone(&harness.processor);
    wait_until(|| processor.state() == ProcessorState::Stopping).await;
    settle_tasks().await;
    assert!(!harness.task.is_finished());
    assert_eq!(gated.finished.load(Ordering::SeqCst), 0);

    gated.release.notify_one();
    harness.task.await.expect("processor task");
    assert_eq!(gated.finished.load(Ordering::SeqCst), 1);
    assert_eq!(harness.processor.state(), ProcessorState::Stopped);
}

#[tokio::test]
async fn test_messages_after_shutdown_stay_queued() {
    let handler = CountingPing::new();
    let harness =
        Harness::start(HandlerRegistry::default().with_typed::<Ping, _>(Arc::clone(&handler)))
            .await;
    let broker = harness.broker.clone();
    harness.stop().await;

    broker.publish("requests", ping("t1", "late"));
    settle_tasks().await;

    assert_eq!(handler.calls(), 0);
    assert_eq!(broker.disposition_of("late"), None);
}
