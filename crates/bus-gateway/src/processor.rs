//! # Processor
//!
//! Long-running consumer for one topic/subscription pair.
//!
//! ## Lifecycle
//!
//! ```text
//! Stopped ──run()──→ Starting ──subscribed──→ Running ──shutdown──→ Stopping ──drained──→ Stopped
//!                       ↑                        │
//!                       └──── cool-down ←────────┘  (connection failure)
//! ```
//!
//! ## Per-Message Steps
//!
//! 1. Shutdown already requested: drop without settling (broker redelivers)
//! 2. Routing headers invalid: dead-letter with the header error as reason
//! 3. Complete the message (auto-complete on receipt)
//! 4. Fan out to every matching handler
//!
//! Messages are completed before dispatch so that slow handlers never hold a
//! broker lock. The cost is at-most-once delivery from the handler's point of
//! view.
//!
//! ## Fault Policy
//!
//! | Fault          | Health           | Action                                |
//! |----------------|------------------|---------------------------------------|
//! | Authentication | AuthFailed       | log (rate-limited), keep subscription |
//! | Connection     | ConnectionFailed | tear down, cool down, resubscribe     |
//! | Other          | unchanged        | log (rate-limited), keep subscription |

use crate::config::GatewayConfig;
use crate::envelope::Route;
use crate::error::{FaultKind, HeaderError};
use crate::handler::{HandlerRegistry, HandlerVerdict};
use crate::health::{ConnectionState, HealthCell, HealthSink};
use crate::rate_limiter::{RateLimiter, SharedRateLimiter};
use crate::shutdown::ShutdownSignal;
use crate::transport::{
    BrokerClient, Delivery, ReceivedMessage, Subscription, SubscriptionOptions, TransportFault,
};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Processor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProcessorState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ProcessorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ProcessorState::Starting,
            2 => ProcessorState::Running,
            3 => ProcessorState::Stopping,
            _ => ProcessorState::Stopped,
        }
    }
}

/// What happened to one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Shutdown was requested; left unsettled.
    Dropped,
    /// Routing headers invalid.
    DeadLettered(HeaderError),
    /// Completed, but no handler is registered for the type.
    Unhandled,
    /// At least one handler succeeded.
    Handled,
    /// Every matching handler returned `false`.
    AllHandlersFailed,
}

/// Reaction to a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Keep the subscription running.
    Continue,
    /// Tear down and recreate the subscription after the cool-down.
    Reconnect,
}

/// Processor counters.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    received: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    unhandled: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`ProcessorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dropped: u64,
    pub dead_lettered: u64,
    pub unhandled: u64,
    pub handled: u64,
    pub failed: u64,
    pub reconnects: u64,
}

impl ProcessorStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            unhandled: self.unhandled.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Dropped => &self.dropped,
            DispatchOutcome::DeadLettered(_) => &self.dead_lettered,
            DispatchOutcome::Unhandled => &self.unhandled,
            DispatchOutcome::Handled => &self.handled,
            DispatchOutcome::AllHandlersFailed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Subscription consumer.
pub struct Processor {
    broker: Arc<dyn BrokerClient>,
    topic: String,
    subscription: String,
    options: SubscriptionOptions,
    registry: Arc<HandlerRegistry>,
    health: Arc<HealthCell>,
    cooldown: Duration,
    error_log: SharedRateLimiter,
    state: AtomicU8,
    stats: ProcessorStats,
}

impl Processor {
    /// Create a processor for the configured (template-expanded) names.
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: &GatewayConfig,
        registry: Arc<HandlerRegistry>,
        health: Arc<HealthCell>,
    ) -> Self {
        Self {
            broker,
            topic: config.resolved_topic(),
            subscription: config.resolved_subscription(),
            options: config.subscription_options(),
            registry,
            health,
            cooldown: config.reconnect_cooldown,
            error_log: SharedRateLimiter::new(RateLimiter::with_config(
                config.error_log_window,
                config.error_log_capacity,
            )),
            state: AtomicU8::new(ProcessorState::Stopped as u8),
            stats: ProcessorStats::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    #[must_use]
    pub fn health(&self) -> ConnectionState {
        self.health.current()
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Consume until `shutdown` fires, then drain in-flight dispatches.
    ///
    /// Never returns early on broker errors; connection failures cycle
    /// through the reconnect cool-down.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownSignal) {
        self.set_state(ProcessorState::Starting);
        info!(
            namespace = %self.broker.namespace(),
            topic = %self.topic,
            subscription = %self.subscription,
            max_concurrent_calls = self.options.max_concurrent_calls,
            "Processor starting"
        );

        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_calls));
        let mut in_flight = JoinSet::new();

        while !shutdown.is_cancelled() {
            let mut subscription = match self
                .broker
                .subscribe(&self.topic, &self.subscription, &self.options)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    self.on_fault(&TransportFault::new(self.resource(), e));
                    if !self.cool_down(&shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            self.health.record(ConnectionState::Healthy);
            self.set_state(ProcessorState::Running);
            info!(topic = %self.topic, subscription = %self.subscription, "Subscription open");

            let reconnect = self
                .receive(subscription.as_mut(), &permits, &mut in_flight, &shutdown)
                .await;

            subscription.close().await;
            drop(subscription);

            if !reconnect {
                break;
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            self.set_state(ProcessorState::Starting);
            info!(
                topic = %self.topic,
                subscription = %self.subscription,
                cooldown_secs = self.cooldown.as_secs(),
                "Subscription torn down, reconnecting after cool-down"
            );
            if !self.cool_down(&shutdown).await {
                break;
            }
        }

        self.set_state(ProcessorState::Stopping);
        debug!(in_flight = in_flight.len(), "Draining in-flight dispatches");
        while let Some(result) = in_flight.join_next().await {
            Self::log_join(result);
        }

        self.set_state(ProcessorState::Stopped);
        info!(topic = %self.topic, subscription = %self.subscription, "Processor stopped");
    }

    /// Pump one subscription. Returns `true` when it must be recreated.
    async fn receive(
        self: &Arc<Self>,
        subscription: &mut dyn Subscription,
        permits: &Arc<Semaphore>,
        in_flight: &mut JoinSet<DispatchOutcome>,
        shutdown: &ShutdownSignal,
    ) -> bool {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return false,

                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    Self::log_join(result);
                }

                delivery = subscription.next_delivery() => match delivery {
                    Some(Delivery::Message(message)) => {
                        let permit = tokio::select! {
                            permit = Arc::clone(permits).acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => return false,
                            },
                            _ = shutdown.cancelled() => {
                                debug!(
                                    correlation_id = %message.envelope.correlation_id,
                                    "Shutdown while waiting for a dispatch slot, message left unsettled"
                                );
                                return false;
                            }
                        };

                        let processor = Arc::clone(self);
                        let signal = shutdown.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            processor.process_message(message, &signal).await
                        });
                    }
                    Some(Delivery::Fault(fault)) => {
                        if self.on_fault(&fault) == FaultAction::Reconnect {
                            return true;
                        }
                    }
                    None => {
                        warn!(
                            topic = %self.topic,
                            subscription = %self.subscription,
                            "Subscription stream ended"
                        );
                        self.health.record(ConnectionState::ConnectionFailed);
                        return true;
                    }
                },
            }
        }
    }

    /// Validate, settle and dispatch one message.
    pub async fn process_message(
        &self,
        message: ReceivedMessage,
        signal: &ShutdownSignal,
    ) -> DispatchOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let outcome = self.dispatch(&message, signal).await;
        self.stats.record(outcome);
        outcome
    }

    async fn dispatch(&self, message: &ReceivedMessage, signal: &ShutdownSignal) -> DispatchOutcome {
        let envelope = &message.envelope;

        if signal.is_cancelled() {
            info!(
                correlation_id = %envelope.correlation_id,
                "Shutdown requested, message dropped unsettled"
            );
            return DispatchOutcome::Dropped;
        }

        // A delivery proves the credentials work again.
        self.health
            .transition(ConnectionState::AuthFailed, ConnectionState::Healthy);

        let Route {
            tenant_id,
            message_type,
        } = match envelope.route() {
            Ok(route) => route,
            Err(reason) => {
                debug!(
                    correlation_id = %envelope.correlation_id,
                    reason = %reason,
                    "Invalid routing headers, dead-lettering"
                );
                if let Err(e) = message.dead_letter(&reason.to_string()).await {
                    warn!(correlation_id = %envelope.correlation_id, error = %e, "Dead-letter failed");
                }
                return DispatchOutcome::DeadLettered(reason);
            }
        };

        if let Err(e) = message.complete().await {
            warn!(
                correlation_id = %envelope.correlation_id,
                error = %e,
                "Complete failed, broker may redeliver"
            );
        }

        match self
            .registry
            .dispatch(message_type, &envelope.body, signal)
            .await
        {
            HandlerVerdict::NoHandlers => {
                warn!(
                    message_type,
                    tenant_id,
                    correlation_id = %envelope.correlation_id,
                    "No handler registered, message completed and dropped"
                );
                DispatchOutcome::Unhandled
            }
            HandlerVerdict::Handled {
                succeeded,
                attempted,
            } => {
                debug!(
                    message_type,
                    tenant_id,
                    correlation_id = %envelope.correlation_id,
                    succeeded,
                    attempted,
                    "Message handled"
                );
                DispatchOutcome::Handled
            }
            HandlerVerdict::AllFailed { attempted } => {
                warn!(
                    message_type,
                    tenant_id,
                    correlation_id = %envelope.correlation_id,
                    attempted,
                    "No handler succeeded"
                );
                DispatchOutcome::AllHandlersFailed
            }
        }
    }

    /// Apply the fault policy and update health.
    pub fn on_fault(&self, fault: &TransportFault) -> FaultAction {
        let key = fault.limiter_key();

        match fault.error.kind() {
            FaultKind::Authentication => {
                self.error_log.limit(&key, || {
                    warn!(
                        resource = %fault.resource,
                        error = %fault.error,
                        "Broker rejected credentials, waiting for token refresh"
                    );
                });
                self.health.record(ConnectionState::AuthFailed);
                FaultAction::Continue
            }
            FaultKind::Connection => {
                self.error_log.limit(&key, || {
                    error!(
                        resource = %fault.resource,
                        error = %fault.error,
                        "Broker connection failed"
                    );
                });
                self.health.record(ConnectionState::ConnectionFailed);
                FaultAction::Reconnect
            }
            FaultKind::Unclassified => {
                self.error_log.limit(&key, || {
                    error!(
                        resource = %fault.resource,
                        error = %fault.error,
                        "Broker error"
                    );
                });
                FaultAction::Continue
            }
        }
    }

    /// Sleep the cool-down. Returns `false` if shutdown fired first.
    async fn cool_down(&self, shutdown: &ShutdownSignal) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.cooldown) => true,
            _ = shutdown.cancelled() => false,
        }
    }

    fn resource(&self) -> String {
        format!(
            "{}/{}/subscriptions/{}",
            self.broker.namespace(),
            self.topic,
            self.subscription
        )
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn log_join(result: Result<DispatchOutcome, tokio::task::JoinError>) {
        if let Err(e) = result {
            error!(error = %e, "Dispatch task panicked");
        }
    }
}
