//! # In-Memory Broker
//!
//! Single-node implementation of the transport traits. Each
//! `topic/subscription` pair is a durable lane: messages published while no
//! receiver is attached wait in the lane until the subscription reopens.
//! Distributed deployments plug a real broker client in behind the same
//! traits.
//!
//! Faults can be injected for exercising the gateway's recovery paths.

use crate::envelope::{Disposition, Envelope, TENANT_HEADER};
use crate::error::BrokerError;
use crate::transport::{
    BrokerClient, Delivery, MessageSettler, ReceivedMessage, Subscription, SubscriptionOptions,
    TopicSender, TransportFault,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum LaneItem {
    Message { envelope: Envelope, delivery_count: u32 },
    Fault(TransportFault),
    Disconnect,
}

struct Lane {
    tx: mpsc::UnboundedSender<LaneItem>,
    /// `None` while a subscription holds the receiver.
    rx: Option<mpsc::UnboundedReceiver<LaneItem>>,
    tenant_filter: Option<String>,
}

impl Lane {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Some(rx),
            tenant_filter: None,
        }
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        match &self.tenant_filter {
            Some(tenant) => envelope.header(TENANT_HEADER) == Some(tenant.as_str()),
            None => true,
        }
    }
}

#[derive(Default)]
struct State {
    /// topic -> subscription name -> lane
    topics: HashMap<String, HashMap<String, Lane>>,
    settlements: Vec<(String, Disposition)>,
    published: Vec<Envelope>,
    send_failures: VecDeque<BrokerError>,
    persistent_send_failure: Option<BrokerError>,
    subscribe_failures: VecDeque<BrokerError>,
}

struct Shared {
    namespace: String,
    state: Mutex<State>,
    next_sender_id: AtomicU64,
    senders_created: AtomicU64,
    subscriptions_opened: AtomicU64,
}

impl Shared {
    fn resource(&self, topic: &str, subscription: &str) -> String {
        format!("{}/{}/subscriptions/{}", self.namespace, topic, subscription)
    }

    fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        let mut state = self.state.lock();
        state.published.push(envelope.clone());

        let Some(lanes) = state.topics.get(topic) else {
            debug!(topic, correlation_id = %envelope.correlation_id, "No subscriptions, message dropped");
            return 0;
        };

        let mut delivered = 0;
        for lane in lanes.values().filter(|lane| lane.accepts(&envelope)) {
            let item = LaneItem::Message {
                envelope: envelope.clone(),
                delivery_count: 1,
            };
            if lane.tx.send(item).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    fn settle(&self, message_id: &str, disposition: Disposition) {
        self.state
            .lock()
            .settlements
            .push((message_id.to_string(), disposition));
    }

    fn redeliver(&self, topic: &str, subscription: &str, envelope: Envelope, delivery_count: u32) {
        let state = self.state.lock();
        if let Some(lane) = state.topics.get(topic).and_then(|t| t.get(subscription)) {
            let _ = lane.tx.send(LaneItem::Message {
                envelope,
                delivery_count: delivery_count.saturating_add(1),
            });
        }
    }

    fn push_to_lane(&self, topic: &str, subscription: &str, item: LaneItem) -> bool {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|t| t.get(subscription))
            .map(|lane| lane.tx.send(item).is_ok())
            .unwrap_or(false)
    }

    fn return_receiver(&self, topic: &str, subscription: &str, rx: mpsc::UnboundedReceiver<LaneItem>) {
        let mut state = self.state.lock();
        if let Some(lane) = state.topics.get_mut(topic).and_then(|t| t.get_mut(subscription)) {
            lane.rx = Some(rx);
        }
    }
}

/// Single-node broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create a broker for the given namespace name.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                namespace: namespace.into(),
                state: Mutex::new(State::default()),
                next_sender_id: AtomicU64::new(1),
                senders_created: AtomicU64::new(0),
                subscriptions_opened: AtomicU64::new(0),
            }),
        }
    }

    /// Provision a subscription lane so messages published before the first
    /// receiver attaches are retained.
    pub fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.shared.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_insert_with(Lane::new);
    }

    /// Publish directly, bypassing any sender. Returns the number of lanes
    /// the envelope was queued on.
    pub fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        self.shared.publish(topic, envelope)
    }

    /// Raise a transport error on an open or provisioned subscription.
    pub fn inject_fault(&self, topic: &str, subscription: &str, error: BrokerError) -> bool {
        let fault = TransportFault::new(self.shared.resource(topic, subscription), error);
        self.shared
            .push_to_lane(topic, subscription, LaneItem::Fault(fault))
    }

    /// End the current receiver's stream as if the link dropped.
    pub fn disconnect(&self, topic: &str, subscription: &str) -> bool {
        self.shared
            .push_to_lane(topic, subscription, LaneItem::Disconnect)
    }

    /// Fail the next `count` sends with `error`.
    pub fn fail_next_sends(&self, error: BrokerError, count: usize) {
        let mut state = self.shared.state.lock();
        state
            .send_failures
            .extend(std::iter::repeat(error).take(count));
    }

    /// Fail every send with `error` until cleared with `None`.
    pub fn fail_all_sends(&self, error: Option<BrokerError>) {
        self.shared.state.lock().persistent_send_failure = error;
    }

    /// Fail the next subscribe call with `error`.
    pub fn fail_next_subscribe(&self, error: BrokerError) {
        self.shared.state.lock().subscribe_failures.push_back(error);
    }

    /// Every settlement so far, in order, keyed by message id.
    #[must_use]
    pub fn settlements(&self) -> Vec<(String, Disposition)> {
        self.shared.state.lock().settlements.clone()
    }

    /// Settlement recorded for `message_id`, if any.
    #[must_use]
    pub fn disposition_of(&self, message_id: &str) -> Option<Disposition> {
        self.shared
            .state
            .lock()
            .settlements
            .iter()
            .rev()
            .find(|(id, _)| id == message_id)
            .map(|(_, d)| d.clone())
    }

    /// Every envelope accepted for publishing.
    #[must_use]
    pub fn published(&self) -> Vec<Envelope> {
        self.shared.state.lock().published.clone()
    }

    #[must_use]
    pub fn senders_created(&self) -> u64 {
        self.shared.senders_created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn subscriptions_opened(&self) -> u64 {
        self.shared.subscriptions_opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    async fn create_sender(&self, topic: &str) -> Result<Arc<dyn TopicSender>, BrokerError> {
        let id = self.shared.next_sender_id.fetch_add(1, Ordering::Relaxed);
        self.shared.senders_created.fetch_add(1, Ordering::Relaxed);
        debug!(topic, sender_id = id, "Sender created");

        Ok(Arc::new(InMemorySender {
            id,
            topic: topic.to_string(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn Subscription>, BrokerError> {
        let mut state = self.shared.state.lock();
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }

        let lane = state
            .topics
            .entry(topic.to_string())
            .or_default()
            .entry(subscription.to_string())
            .or_insert_with(Lane::new);

        let rx = lane.rx.take().ok_or_else(|| {
            BrokerError::Other(format!(
                "{topic}/{subscription} already has an active receiver"
            ))
        })?;
        lane.tenant_filter = options.tenant_filter.clone();
        drop(state);

        self.shared
            .subscriptions_opened
            .fetch_add(1, Ordering::Relaxed);
        debug!(topic, subscription, "Subscription opened");

        Ok(Box::new(InMemorySubscription {
            rx: Some(rx),
            topic: topic.to_string(),
            name: subscription.to_string(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct InMemorySender {
    id: u64,
    topic: String,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

#[async_trait]
impl TopicSender for InMemorySender {
    fn id(&self) -> u64 {
        self.id
    }

    async fn send(&self, envelope: Envelope) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }

        {
            let mut state = self.shared.state.lock();
            if let Some(error) = state.persistent_send_failure.clone() {
                return Err(error);
            }
            if let Some(error) = state.send_failures.pop_front() {
                return Err(error);
            }
        }

        self.shared.publish(&self.topic, envelope);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

struct InMemorySubscription {
    rx: Option<mpsc::UnboundedReceiver<LaneItem>>,
    topic: String,
    name: String,
    shared: Arc<Shared>,
}

impl InMemorySubscription {
    fn release(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.shared.return_receiver(&self.topic, &self.name, rx);
        }
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let rx = self.rx.as_mut()?;
        match rx.recv().await? {
            LaneItem::Message {
                envelope,
                delivery_count,
            } => {
                let settler = InMemorySettler {
                    envelope: envelope.clone(),
                    delivery_count,
                    topic: self.topic.clone(),
                    subscription: self.name.clone(),
                    shared: Arc::clone(&self.shared),
                    settled: AtomicBool::new(false),
                };
                Some(Delivery::Message(ReceivedMessage::new(
                    envelope,
                    delivery_count,
                    Box::new(settler),
                )))
            }
            LaneItem::Fault(fault) => Some(Delivery::Fault(fault)),
            LaneItem::Disconnect => {
                warn!(topic = %self.topic, subscription = %self.name, "Subscription link dropped");
                self.release();
                None
            }
        }
    }

    async fn close(&mut self) {
        self.release();
        debug!(topic = %self.topic, subscription = %self.name, "Subscription closed");
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

struct InMemorySettler {
    envelope: Envelope,
    delivery_count: u32,
    topic: String,
    subscription: String,
    shared: Arc<Shared>,
    settled: AtomicBool,
}

impl InMemorySettler {
    fn claim(&self) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::Other(format!(
                "message {} already settled",
                self.envelope.message_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSettler for InMemorySettler {
    async fn complete(&self) -> Result<(), BrokerError> {
        self.claim()?;
        self.shared
            .settle(&self.envelope.message_id, Disposition::Completed);
        Ok(())
    }

    async fn dead_letter(&self, reason: &str) -> Result<(), BrokerError> {
        self.claim()?;
        self.shared.settle(
            &self.envelope.message_id,
            Disposition::DeadLettered {
                reason: reason.to_string(),
            },
        );
        Ok(())
    }

    async fn abandon(&self) -> Result<(), BrokerError> {
        self.claim()?;
        self.shared
            .settle(&self.envelope.message_id, Disposition::Abandoned);
        self.shared.redeliver(
            &self.topic,
            &self.subscription,
            self.envelope.clone(),
            self.delivery_count,
        );
        Ok(())
    }
}
