//! # Gateway Runtime
//!
//! Hosts one gateway instance. The library half exists so the wiring can be
//! exercised from tests; `main.rs` is the process entry point.
//!
//! ## Wiring
//!
//! ```text
//!                  ┌──────────────── HandlerRegistry ────────────────┐
//!  Processor ────→ │ HeartBeatTracker        (StatusNotification)     │
//!                  │ ExecutionRequestHandler (ExecutionRequest) ──────┼──→ work queue
//!                  └──────────────────────────────┬───────────────────┘
//!                                                 │ replies
//!                                                 ↓
//!                                   BackendNotifier → MessageSender
//! ```

pub mod handlers;

use bus_gateway::{
    BackendNotifier, BrokerClient, ConfigError, ConnectionState, ExecutionRequest,
    FrontendRequester, GatewayConfig, HandlerRegistry, HealthCell, MessageSender, Processor,
    Shutdown, StatusNotification, TenantContext,
};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use handlers::{ExecutionRequestHandler, HeartBeatRecord, HeartBeatTracker};

/// Name stamped on heartbeats sent by this process.
pub const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Version stamped on heartbeats sent by this process.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Work requests buffered before the handler applies back-pressure.
pub const WORK_QUEUE_CAPACITY: usize = 256;

/// Runtime lifecycle errors
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime already started")]
    AlreadyStarted,
}

/// One gateway instance: processor, producer and handlers.
pub struct GatewayRuntime {
    config: GatewayConfig,
    health: Arc<HealthCell>,
    processor: Arc<Processor>,
    sender: Arc<MessageSender>,
    heartbeats: Arc<HeartBeatTracker>,
    work: Mutex<Option<mpsc::Receiver<ExecutionRequest>>>,
    shutdown: Shutdown,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayRuntime {
    /// Build the registry, producer and processor.
    ///
    /// Nothing connects until [`GatewayRuntime::start`].
    ///
    /// # Errors
    ///
    /// `RuntimeError::Config` if `config` does not validate.
    pub fn new(config: GatewayConfig, broker: Arc<dyn BrokerClient>) -> Result<Self, RuntimeError> {
        config.validate()?;
        info!(
            namespace = %config.namespace,
            topic = %config.resolved_topic(),
            subscription = %config.resolved_subscription(),
            tenant_id = ?config.tenant_id,
            "Creating gateway runtime"
        );

        let health = Arc::new(HealthCell::new());
        let sender = Arc::new(MessageSender::from_config(Arc::clone(&broker), &config));
        let heartbeats = Arc::new(HeartBeatTracker::new());
        let (executor, work) = ExecutionRequestHandler::new(
            Arc::clone(&sender),
            SERVICE_NAME,
            SERVICE_VERSION,
            WORK_QUEUE_CAPACITY,
        );

        let registry = HandlerRegistry::default()
            .with_typed::<StatusNotification, _>(Arc::clone(&heartbeats))
            .with_typed::<ExecutionRequest, _>(executor);

        let processor = Arc::new(Processor::new(
            broker,
            &config,
            Arc::new(registry),
            Arc::clone(&health),
        ));

        Ok(Self {
            config,
            health,
            processor,
            sender,
            heartbeats,
            work: Mutex::new(Some(work)),
            shutdown: Shutdown::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawn the processor task. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `RuntimeError::AlreadyStarted` on a second call.
    pub fn start(&self) -> Result<(), RuntimeError> {
        let mut task = self.task.lock();
        if task.is_some() || self.shutdown.is_triggered() {
            return Err(RuntimeError::AlreadyStarted);
        }

        info!("===========================================");
        info!("  {} v{}", SERVICE_NAME, SERVICE_VERSION);
        info!("===========================================");

        *task = Some(tokio::spawn(
            Arc::clone(&self.processor).run(self.shutdown.signal()),
        ));
        Ok(())
    }

    /// Stop receiving, drain in-flight handlers and release the sender.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.shutdown.trigger();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Processor task failed");
            }
        }

        self.sender.close().await;
        info!("Shutdown complete");
    }

    /// Current broker connection state.
    #[must_use]
    pub fn health(&self) -> ConnectionState {
        self.health.current()
    }

    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    #[must_use]
    pub fn processor(&self) -> Arc<Processor> {
        Arc::clone(&self.processor)
    }

    #[must_use]
    pub fn sender(&self) -> Arc<MessageSender> {
        Arc::clone(&self.sender)
    }

    #[must_use]
    pub fn heartbeats(&self) -> Arc<HeartBeatTracker> {
        Arc::clone(&self.heartbeats)
    }

    /// Receiving end of the work queue. Yields `Some` once.
    pub fn take_work_queue(&self) -> Option<mpsc::Receiver<ExecutionRequest>> {
        self.work.lock().take()
    }

    /// Front-end façade for `tenant_id`.
    #[must_use]
    pub fn requester(&self, tenant_id: &str, requested_by: &str) -> FrontendRequester {
        FrontendRequester::new(self.sender(), TenantContext::new(tenant_id), requested_by)
    }

    /// Back-end façade for `tenant_id`.
    #[must_use]
    pub fn notifier(&self, tenant_id: &str) -> BackendNotifier {
        BackendNotifier::new(
            self.sender(),
            TenantContext::new(tenant_id),
            SERVICE_NAME,
            SERVICE_VERSION,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_gateway::InMemoryBroker;

    #[test]
    fn test_invalid_config_rejected() {
        let config = GatewayConfig {
            subscription: String::new(),
            ..GatewayConfig::default()
        };
        let result = GatewayRuntime::new(config, Arc::new(InMemoryBroker::new("ns")));
        assert!(matches!(result, Err(RuntimeError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let runtime =
            GatewayRuntime::new(GatewayConfig::default(), Arc::new(InMemoryBroker::new("ns")))
                .unwrap();
        runtime.start().unwrap();
        assert!(matches!(runtime.start(), Err(RuntimeError::AlreadyStarted)));
        runtime.shutdown().await;
        assert!(matches!(runtime.start(), Err(RuntimeError::AlreadyStarted)));
    }

    #[test]
    fn test_work_queue_taken_once() {
        let runtime =
            GatewayRuntime::new(GatewayConfig::default(), Arc::new(InMemoryBroker::new("ns")))
                .unwrap();
        assert!(runtime.take_work_queue().is_some());
        assert!(runtime.take_work_queue().is_none());
    }
}
