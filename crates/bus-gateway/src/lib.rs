//! # Bus Gateway - Tenant-Aware Message Bus Gateway
//!
//! Connects the platform's services to a shared broker topic.
//!
//! ## Flow
//!
//! ```text
//! ┌──────────────┐   send()    ┌──────────────┐   subscribe()   ┌──────────────┐
//! │ MessageSender│ ──────────→ │    Broker    │ ──────────────→ │  Processor   │
//! │ (+ façades)  │             │ topic / sub  │                 │              │
//! └──────────────┘             └──────────────┘                 └──────┬───────┘
//!        ↑                                                             │
//!        │ replies                                 HandlerRegistry::dispatch
//!        │                                                             ↓
//!        └───────────────────────────────────────────── application handlers
//! ```
//!
//! ## Routing
//!
//! Every envelope carries two routing headers: `MessageType` and the
//! lower-cased tenant header. Envelopes missing either are dead-lettered.
//! The broker's subscription filter keeps one tenant's traffic on its own
//! lane; there is no ordering across tenants.
//!
//! ## Failure Policy
//!
//! Nothing inside the gateway terminates the hosting process. Every failure
//! resolves to "log and continue" or "log and restart the subscription".
//! Repeated identical failures are logged once per window via
//! [`RateLimiter`].

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod codec;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod handler;
pub mod health;
pub mod memory;
pub mod messages;
pub mod processor;
pub mod rate_limiter;
pub mod sender;
pub mod shutdown;
pub mod transport;

// Re-export main types
pub use codec::{BusMessage, CONTENT_TYPE};
pub use config::GatewayConfig;
pub use connection::ConnectionCell;
pub use envelope::{Disposition, Envelope, Route, MESSAGE_TYPE_HEADER, TENANT_HEADER};
pub use error::{BrokerError, CodecError, ConfigError, FaultKind, GatewayError, HeaderError, SendError};
pub use facade::{BackendNotifier, FrontendRequester, SendReceipt, TenantContext};
pub use handler::{HandlerRegistry, HandlerVerdict, MessageHandler, TypedAdapter, TypedHandler};
pub use health::{ConnectionState, HealthCell, HealthSink};
pub use memory::InMemoryBroker;
pub use messages::{
    ExecutionCommand, ExecutionOptions, ExecutionRequest, ProgressStatus, StatusNotification,
};
pub use processor::{
    DispatchOutcome, FaultAction, Processor, ProcessorState, ProcessorStats, StatsSnapshot,
};
pub use rate_limiter::{RateLimiter, SharedRateLimiter};
pub use sender::{MessageSender, SendStatus};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use transport::{
    BrokerClient, Delivery, MessageSettler, ReceivedMessage, Subscription, SubscriptionOptions,
    TopicSender, TransportFault,
};

/// Default number of consecutive auth failures tolerated before the
/// producer recreates its sender.
pub const DEFAULT_AUTH_RETRY_BUDGET: i64 = 50;

/// Fixed cool-down between tearing a subscription down and recreating it.
pub const DEFAULT_RECONNECT_COOLDOWN_SECS: u64 = 20;

/// Window within which identical transport errors are logged once.
pub const DEFAULT_ERROR_LOG_WINDOW_SECS: u64 = 60;

/// Distinct error keys remembered by the error log limiter.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 10;

/// Messages dispatched in parallel by one processor.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 16;
