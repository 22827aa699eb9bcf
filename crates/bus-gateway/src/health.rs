//! # Connection Health
//!
//! One cell per gateway instance. The processor and sender write it; a
//! health-check endpoint reads it synchronously from another task.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// No subscription opened yet.
    Starting = 0,
    /// Connected and receiving.
    Healthy = 1,
    /// Socket or name-resolution failure; reconnect cycle in progress.
    ConnectionFailed = 2,
    /// Credentials rejected; waiting for a token refresh.
    AuthFailed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Healthy,
            2 => ConnectionState::ConnectionFailed,
            3 => ConnectionState::AuthFailed,
            _ => ConnectionState::Starting,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Starting => write!(f, "starting"),
            ConnectionState::Healthy => write!(f, "healthy"),
            ConnectionState::ConnectionFailed => write!(f, "connection-failed"),
            ConnectionState::AuthFailed => write!(f, "auth-failed"),
        }
    }
}

/// Write side of the health surface.
pub trait HealthSink: Send + Sync {
    /// Record the latest connection state.
    fn record(&self, state: ConnectionState);
}

/// Atomic single-writer, multi-reader health cell.
#[derive(Debug)]
pub struct HealthCell {
    state: AtomicU8,
}

impl HealthCell {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Starting as u8),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.current() == ConnectionState::Healthy
    }

    /// Move to `to` only if the current state is `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for HealthCell {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSink for HealthCell {
    fn record(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
