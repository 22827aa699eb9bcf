//! # Broker Transport
//!
//! The seam between the gateway and a concrete broker client. The gateway
//! only ever talks to these traits; [`crate::InMemoryBroker`] is the
//! single-node implementation.

use crate::envelope::Envelope;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Longest lock renewal the gateway asks for.
pub const MAX_LOCK_RENEWAL: Duration = Duration::MAX;

/// Client for one broker namespace.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fully-qualified namespace, used in log fields and limiter keys.
    fn namespace(&self) -> &str;

    /// Open a publisher for `topic`.
    async fn create_sender(&self, topic: &str) -> Result<Arc<dyn TopicSender>, BrokerError>;

    /// Open a read lane on `topic/subscription`.
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// Publisher bound to one topic.
#[async_trait]
pub trait TopicSender: Send + Sync {
    /// Identity of this sender instance. Changes whenever it is recreated.
    fn id(&self) -> u64;

    async fn send(&self, envelope: Envelope) -> Result<(), BrokerError>;

    async fn close(&self);
}

/// An open subscription.
///
/// Yields received messages and transport faults in arrival order. `None`
/// means the link ended.
#[async_trait]
pub trait Subscription: Send {
    async fn next_delivery(&mut self) -> Option<Delivery>;

    /// Stop receiving and release the link.
    async fn close(&mut self);
}

/// Settles one received message with the broker.
#[async_trait]
pub trait MessageSettler: Send + Sync {
    async fn complete(&self) -> Result<(), BrokerError>;

    async fn dead_letter(&self, reason: &str) -> Result<(), BrokerError>;

    async fn abandon(&self) -> Result<(), BrokerError>;
}

/// Subscription tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Messages dispatched in parallel.
    pub max_concurrent_calls: usize,
    /// Lock renewal requested from the broker.
    pub max_auto_lock_renewal: Duration,
    /// Server-side rule: only deliver envelopes whose tenant header equals
    /// this value (case-sensitive).
    pub tenant_filter: Option<String>,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            max_concurrent_calls: crate::DEFAULT_MAX_CONCURRENT_CALLS,
            max_auto_lock_renewal: MAX_LOCK_RENEWAL,
            tenant_filter: None,
        }
    }
}

/// Something read off a subscription.
pub enum Delivery {
    Message(ReceivedMessage),
    Fault(TransportFault),
}

/// A message plus the handle to settle it.
pub struct ReceivedMessage {
    pub envelope: Envelope,
    /// 1 on first delivery.
    pub delivery_count: u32,
    settler: Box<dyn MessageSettler>,
}

impl ReceivedMessage {
    #[must_use]
    pub fn new(envelope: Envelope, delivery_count: u32, settler: Box<dyn MessageSettler>) -> Self {
        Self {
            envelope,
            delivery_count,
            settler,
        }
    }

    pub async fn complete(&self) -> Result<(), BrokerError> {
        self.settler.complete().await
    }

    pub async fn dead_letter(&self, reason: &str) -> Result<(), BrokerError> {
        self.settler.dead_letter(reason).await
    }

    pub async fn abandon(&self) -> Result<(), BrokerError> {
        self.settler.abandon().await
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("envelope", &self.envelope)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}

/// A transport or authentication error raised on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    /// Namespace and entity path the error relates to.
    pub resource: String,
    pub error: BrokerError,
}

impl TransportFault {
    #[must_use]
    pub fn new(resource: impl Into<String>, error: BrokerError) -> Self {
        Self {
            resource: resource.into(),
            error,
        }
    }

    /// `(resource, error type)` key for log rate limiting.
    #[must_use]
    pub fn limiter_key(&self) -> String {
        format!("{}:{}", self.resource, self.error.type_name())
    }
}
