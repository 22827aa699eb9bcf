//! # Gateway Runtime
//!
//! Process entry point for a single gateway instance.
//!
//! ## Startup Sequence
//!
//! 1. Initialize telemetry
//! 2. Load gateway configuration from the environment
//! 3. Provision the broker subscription
//! 4. Start the processor and the work queue consumer
//! 5. Run until Ctrl+C, then shut down gracefully

use std::sync::Arc;

use anyhow::{Context, Result};
use bus_gateway::{ExecutionRequest, GatewayConfig, InMemoryBroker, ProgressStatus};
use bus_telemetry::{init_telemetry, TelemetryConfig};
use gateway_runtime::{GatewayRuntime, SERVICE_NAME, SERVICE_VERSION};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Consume queued work, reporting progress back to the requesting tenant.
async fn run_worker(runtime: Arc<GatewayRuntime>, mut work: mpsc::Receiver<ExecutionRequest>) {
    while let Some(request) = work.recv().await {
        let notifier = runtime.notifier(&request.tenant_id);
        info!(
            correlation_id = %request.id,
            tenant_id = %request.tenant_id,
            command = ?request.command,
            "Executing request"
        );

        for (status, percentage, message) in [
            (ProgressStatus::InProgress, 0.0, "Started"),
            (ProgressStatus::Completed, 1.0, "Completed"),
        ] {
            if let Err(e) = notifier
                .send_progress(&request.progress_id, status, percentage, message)
                .await
            {
                warn!(correlation_id = %request.id, error = %e, "Progress notification not sent");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = init_telemetry(TelemetryConfig::for_service(SERVICE_NAME, SERVICE_VERSION))
        .context("Failed to initialize telemetry")?;

    let config = GatewayConfig::from_env().context("Invalid gateway configuration")?;

    let broker = InMemoryBroker::new(config.namespace.clone());
    broker.create_subscription(&config.resolved_topic(), &config.resolved_subscription());

    let runtime = Arc::new(GatewayRuntime::new(config, Arc::new(broker))?);
    runtime.start()?;

    let worker = runtime
        .take_work_queue()
        .map(|work| tokio::spawn(run_worker(Arc::clone(&runtime), work)));

    info!("Gateway is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    runtime.shutdown().await;
    if let Some(worker) = worker {
        worker.abort();
    }

    Ok(())
}
