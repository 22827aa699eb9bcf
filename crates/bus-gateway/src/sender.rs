//! # Message Sender
//!
//! Publishes typed payloads to one topic through a lazily created broker
//! sender.
//!
//! ## Failure Handling
//!
//! - Empty tenant or correlation id: rejected before touching the broker
//! - Authentication failure: logged (rate-limited), retry budget decremented.
//!   Once the budget is spent the sender is dropped so the next call connects
//!   afresh, and the budget resets
//! - Any other broker failure: logged (rate-limited) and swallowed
//!
//! Broker failures never surface as `Err`; the returned [`SendStatus`] tells
//! callers whether the broker accepted the envelope.

use crate::codec::{self, BusMessage, CONTENT_TYPE};
use crate::config::GatewayConfig;
use crate::connection::ConnectionCell;
use crate::envelope::Envelope;
use crate::error::{BrokerError, FaultKind, SendError};
use crate::rate_limiter::{RateLimiter, SharedRateLimiter};
use crate::shutdown::ShutdownSignal;
use crate::transport::{BrokerClient, TopicSender};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The broker accepted the envelope.
    Accepted,
    /// The envelope was not published; the failure has been logged.
    Dropped,
}

/// Producer for one topic.
pub struct MessageSender {
    broker: Arc<dyn BrokerClient>,
    topic: String,
    sender: ConnectionCell<dyn TopicSender>,
    /// Remaining auth failures before the sender is recreated.
    auth_budget: AtomicI64,
    auth_budget_reset: i64,
    error_log: SharedRateLimiter,
}

impl MessageSender {
    /// Create a sender for `topic` with the given auth retry budget.
    #[must_use]
    pub fn new(broker: Arc<dyn BrokerClient>, topic: impl Into<String>, auth_retry_budget: i64) -> Self {
        Self {
            broker,
            topic: topic.into(),
            sender: ConnectionCell::new(),
            auth_budget: AtomicI64::new(auth_retry_budget),
            auth_budget_reset: auth_retry_budget,
            error_log: SharedRateLimiter::new(RateLimiter::new()),
        }
    }

    /// Create a sender for the configured (template-expanded) topic.
    #[must_use]
    pub fn from_config(broker: Arc<dyn BrokerClient>, config: &GatewayConfig) -> Self {
        let mut sender = Self::new(broker, config.resolved_topic(), config.auth_retry_budget);
        sender.error_log = SharedRateLimiter::new(RateLimiter::with_config(
            config.error_log_window,
            config.error_log_capacity,
        ));
        sender
    }

    /// Publish `payload` for `tenant_id`.
    ///
    /// The correlation id doubles as the broker message id.
    ///
    /// # Errors
    ///
    /// - `SendError::InvalidArgument` - empty tenant or correlation id
    /// - `SendError::Codec` - the payload could not be serialized
    pub async fn send<T: BusMessage>(
        &self,
        payload: &T,
        tenant_id: &str,
        correlation_id: &str,
    ) -> Result<SendStatus, SendError> {
        let envelope = Self::build_envelope(payload, tenant_id, correlation_id)?;
        Ok(self.publish(envelope).await)
    }

    /// [`MessageSender::send`] that gives up once `signal` fires.
    ///
    /// # Errors
    ///
    /// Same as [`MessageSender::send`].
    pub async fn send_cancellable<T: BusMessage>(
        &self,
        payload: &T,
        tenant_id: &str,
        correlation_id: &str,
        signal: &ShutdownSignal,
    ) -> Result<SendStatus, SendError> {
        let envelope = Self::build_envelope(payload, tenant_id, correlation_id)?;
        if signal.is_cancelled() {
            debug!(correlation_id, "Send skipped, shutdown requested");
            return Ok(SendStatus::Dropped);
        }

        tokio::select! {
            status = self.publish(envelope) => Ok(status),
            _ = signal.cancelled() => {
                debug!(correlation_id, "Send cancelled");
                Ok(SendStatus::Dropped)
            }
        }
    }

    /// Identity of the live broker sender, if one has been created.
    pub async fn current_sender_id(&self) -> Option<u64> {
        self.sender.current().await.map(|s| s.id())
    }

    /// Auth failures left before the sender is recreated.
    #[must_use]
    pub fn auth_budget_remaining(&self) -> i64 {
        self.auth_budget.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Release the broker sender. A later send reconnects.
    pub async fn close(&self) {
        if let Some(sender) = self.sender.invalidate().await {
            sender.close().await;
            debug!(topic = %self.topic, sender_id = sender.id(), "Sender closed");
        }
    }

    fn build_envelope<T: BusMessage>(
        payload: &T,
        tenant_id: &str,
        correlation_id: &str,
    ) -> Result<Envelope, SendError> {
        if tenant_id.is_empty() {
            return Err(SendError::InvalidArgument("tenant_id must not be empty"));
        }
        if correlation_id.is_empty() {
            return Err(SendError::InvalidArgument("correlation_id must not be empty"));
        }

        let body = codec::encode(payload)?;
        Ok(Envelope::new(
            body,
            T::TYPE_NAME,
            tenant_id,
            correlation_id,
            CONTENT_TYPE,
        ))
    }

    async fn publish(&self, envelope: Envelope) -> SendStatus {
        let correlation_id = envelope.correlation_id.clone();

        let sender = match self
            .sender
            .get_or_create(|| self.broker.create_sender(&self.topic))
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                self.on_failure(&e, &correlation_id).await;
                return SendStatus::Dropped;
            }
        };

        match sender.send(envelope).await {
            Ok(()) => {
                self.auth_budget
                    .store(self.auth_budget_reset, Ordering::Release);
                debug!(
                    topic = %self.topic,
                    correlation_id = %correlation_id,
                    sender_id = sender.id(),
                    "Message sent"
                );
                SendStatus::Accepted
            }
            Err(e) => {
                self.on_failure(&e, &correlation_id).await;
                SendStatus::Dropped
            }
        }
    }

    async fn on_failure(&self, error: &BrokerError, correlation_id: &str) {
        let key = format!("{}:{}", self.topic, error.type_name());

        match error.kind() {
            FaultKind::Authentication => {
                self.error_log.limit(&key, || {
                    warn!(
                        topic = %self.topic,
                        correlation_id,
                        error = %error,
                        "Send rejected: authentication failed"
                    );
                });
                self.spend_auth_budget().await;
            }
            FaultKind::Connection | FaultKind::Unclassified => {
                self.error_log.limit(&key, || {
                    error!(
                        topic = %self.topic,
                        correlation_id,
                        error = %error,
                        "Send failed, message dropped"
                    );
                });
            }
        }
    }

    async fn spend_auth_budget(&self) {
        let remaining = self.auth_budget.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining >= 0 {
            return;
        }

        self.auth_budget
            .store(self.auth_budget_reset, Ordering::Release);
        if let Some(stale) = self.sender.invalidate().await {
            info!(
                topic = %self.topic,
                sender_id = stale.id(),
                "Auth retry budget spent, sender will be recreated"
            );
            stale.close().await;
        }
    }
}
