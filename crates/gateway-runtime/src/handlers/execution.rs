//! Receives execution requests on the back end.
//!
//! Liveness probes and cancellations are answered inline through a
//! [`BackendNotifier`] for the request's tenant. Every other command is queued
//! for a worker and acknowledged with a `Queued` progress notification.

use async_trait::async_trait;
use bus_gateway::{
    BackendNotifier, ExecutionCommand, ExecutionRequest, MessageSender, ProgressStatus,
    SendStatus, ShutdownSignal, TenantContext, TypedHandler,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ExecutionRequestHandler {
    sender: Arc<MessageSender>,
    service: String,
    version: String,
    queue: mpsc::Sender<ExecutionRequest>,
}

impl ExecutionRequestHandler {
    /// Create the handler and the receiving end of its work queue.
    #[must_use]
    pub fn new(
        sender: Arc<MessageSender>,
        service: impl Into<String>,
        version: impl Into<String>,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<ExecutionRequest>) {
        let (queue, work) = mpsc::channel(queue_capacity.max(1));
        let handler = Self {
            sender,
            service: service.into(),
            version: version.into(),
            queue,
        };
        (handler, work)
    }

    /// Notifier replying on behalf of `tenant_id`.
    #[must_use]
    pub fn notifier(&self, tenant_id: &str) -> BackendNotifier {
        BackendNotifier::new(
            Arc::clone(&self.sender),
            TenantContext::new(tenant_id),
            self.service.clone(),
            self.version.clone(),
        )
    }

    async fn enqueue(&self, request: ExecutionRequest, signal: &ShutdownSignal) -> bool {
        let tenant_id = request.tenant_id.clone();
        let progress_id = request.progress_id.clone();
        let correlation_id = request.id.clone();
        let command = request.command;

        let queued = tokio::select! {
            result = self.queue.send(request) => result.is_ok(),
            _ = signal.cancelled() => false,
        };
        if !queued {
            warn!(correlation_id = %correlation_id, ?command, "Work queue closed, request not accepted");
            return false;
        }

        info!(correlation_id = %correlation_id, tenant_id = %tenant_id, ?command, "Request queued");
        if let Err(e) = self
            .notifier(&tenant_id)
            .send_progress(&progress_id, ProgressStatus::Queued, 0.0, "Queued")
            .await
        {
            warn!(correlation_id = %correlation_id, error = %e, "Queued notification not sent");
        }
        true
    }
}

#[async_trait]
impl TypedHandler<ExecutionRequest> for ExecutionRequestHandler {
    async fn handle(&self, request: ExecutionRequest, signal: &ShutdownSignal) -> bool {
        match request.command {
            ExecutionCommand::CheckHeartBeat => {
                debug!(tenant_id = %request.tenant_id, "Heartbeat check");
                match self.notifier(&request.tenant_id).send_heartbeat().await {
                    Ok(receipt) => receipt.status == SendStatus::Accepted,
                    Err(e) => {
                        warn!(tenant_id = %request.tenant_id, error = %e, "Heartbeat reply failed");
                        false
                    }
                }
            }
            ExecutionCommand::Cancel => {
                info!(
                    progress_id = %request.progress_id,
                    requested_by = %request.requested_by,
                    "Cancellation requested"
                );
                let message = format!("Cancelled by {}", request.requested_by);
                match self
                    .notifier(&request.tenant_id)
                    .send_progress(&request.progress_id, ProgressStatus::Cancelled, 1.0, &message)
                    .await
                {
                    Ok(receipt) => receipt.status == SendStatus::Accepted,
                    Err(e) => {
                        warn!(progress_id = %request.progress_id, error = %e, "Cancel reply failed");
                        false
                    }
                }
            }
            _ => self.enqueue(request, signal).await,
        }
    }
}
