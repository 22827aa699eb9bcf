//! Tracks the most recent heartbeat seen from each service.

use async_trait::async_trait;
use bus_gateway::{ShutdownSignal, StatusNotification, TypedHandler};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Last heartbeat reported by one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartBeatRecord {
    pub version: String,
    /// When the service stamped the heartbeat.
    pub sent_at: DateTime<Utc>,
    /// When this process received it.
    pub received_at: DateTime<Utc>,
}

/// Heartbeat bookkeeping, keyed by service name.
#[derive(Debug, Default)]
pub struct HeartBeatTracker {
    last_seen: RwLock<HashMap<String, HeartBeatRecord>>,
}

impl HeartBeatTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_heartbeat(&self, service: &str) -> Option<HeartBeatRecord> {
        self.last_seen.read().get(service).cloned()
    }

    /// Whether `service` reported within `max_age` of now.
    #[must_use]
    pub fn is_alive(&self, service: &str, max_age: Duration) -> bool {
        self.last_seen
            .read()
            .get(service)
            .is_some_and(|record| Utc::now() - record.received_at <= max_age)
    }

    /// Services that have reported at least once.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<_> = self.last_seen.read().keys().cloned().collect();
        services.sort();
        services
    }

    fn record(&self, service: String, version: String, sent_at: DateTime<Utc>) {
        let record = HeartBeatRecord {
            version,
            sent_at,
            received_at: Utc::now(),
        };
        debug!(service = %service, version = %record.version, "Heartbeat received");
        self.last_seen.write().insert(service, record);
    }
}

#[async_trait]
impl TypedHandler<StatusNotification> for HeartBeatTracker {
    async fn handle(&self, message: StatusNotification, _signal: &ShutdownSignal) -> bool {
        match message {
            StatusNotification::HeartBeat {
                service,
                version,
                at,
            } => self.record(service, version, at),
            other => trace!(kind = ?other, "Not a heartbeat, ignored"),
        }
        true
    }
}
