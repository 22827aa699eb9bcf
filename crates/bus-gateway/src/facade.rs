//! # Producer Façades
//!
//! Typed entry points above [`MessageSender`]. Each call builds one concrete
//! message, takes the tenant from its [`TenantContext`] and stamps a fresh
//! correlation id. Heartbeats are the exception: their correlation id is
//! derived from the tenant so repeated probes collapse onto one trace.

use crate::error::SendError;
use crate::messages::{
    heartbeat_correlation_id, ExecutionCommand, ExecutionOptions, ExecutionRequest,
    ProgressStatus, StatusNotification,
};
use crate::sender::{MessageSender, SendStatus};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Tenant on whose behalf a façade publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    tenant_id: String,
}

impl TenantContext {
    #[must_use]
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
        }
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

/// Result of a façade call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Correlation id stamped on the envelope.
    pub correlation_id: String,
    pub status: SendStatus,
}

fn fresh_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Back end → front end notifications.
pub struct BackendNotifier {
    sender: Arc<MessageSender>,
    tenant: TenantContext,
    service: String,
    version: String,
}

impl BackendNotifier {
    /// `service` and `version` are stamped on heartbeats.
    #[must_use]
    pub fn new(
        sender: Arc<MessageSender>,
        tenant: TenantContext,
        service: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            tenant,
            service: service.into(),
            version: version.into(),
        }
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    /// Report progress of a long-running command.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn send_progress(
        &self,
        progress_id: &str,
        status: ProgressStatus,
        percentage: f64,
        message: &str,
    ) -> Result<SendReceipt, SendError> {
        let note = StatusNotification::Progress {
            progress_id: progress_id.to_string(),
            status,
            percentage: percentage.clamp(0.0, 1.0),
            message: message.to_string(),
        };
        self.publish(&note, fresh_correlation_id()).await
    }

    /// Announce that this service is alive.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn send_heartbeat(&self) -> Result<SendReceipt, SendError> {
        let note = StatusNotification::heartbeat(&self.service, &self.version);
        let correlation_id = heartbeat_correlation_id(self.tenant.tenant_id());
        self.publish(&note, correlation_id).await
    }

    /// Announce that one rule's metadata changed.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn send_rule_metadata_updated(&self, rule_id: &str) -> Result<SendReceipt, SendError> {
        let note = StatusNotification::RuleMetadataUpdated {
            rule_id: Some(rule_id.to_string()),
        };
        self.publish(&note, fresh_correlation_id()).await
    }

    /// Announce that every rule's metadata changed.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn send_all_rule_metadata_updated(&self) -> Result<SendReceipt, SendError> {
        let note = StatusNotification::RuleMetadataUpdated { rule_id: None };
        self.publish(&note, fresh_correlation_id()).await
    }

    async fn publish(
        &self,
        note: &StatusNotification,
        correlation_id: String,
    ) -> Result<SendReceipt, SendError> {
        let status = self
            .sender
            .send(note, self.tenant.tenant_id(), &correlation_id)
            .await?;
        Ok(SendReceipt {
            correlation_id,
            status,
        })
    }
}

/// Front end → back end requests.
pub struct FrontendRequester {
    sender: Arc<MessageSender>,
    tenant: TenantContext,
    requested_by: String,
}

impl FrontendRequester {
    /// `requested_by` identifies the requesting user or service.
    #[must_use]
    pub fn new(
        sender: Arc<MessageSender>,
        tenant: TenantContext,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            tenant,
            requested_by: requested_by.into(),
        }
    }

    #[must_use]
    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    /// Ask the back end to run `command`, reporting against `progress_id`.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn request_execution(
        &self,
        command: ExecutionCommand,
        progress_id: &str,
        options: ExecutionOptions,
    ) -> Result<SendReceipt, SendError> {
        let request = ExecutionRequest {
            id: fresh_correlation_id(),
            tenant_id: self.tenant.tenant_id().to_string(),
            progress_id: progress_id.to_string(),
            command,
            requested_by: self.requested_by.clone(),
            requested_at: Utc::now(),
            options,
        };
        self.publish(&request).await
    }

    /// Ask the back end to cancel the work tracked by `progress_id`.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn request_cancel(&self, progress_id: &str) -> Result<SendReceipt, SendError> {
        self.request_execution(ExecutionCommand::Cancel, progress_id, ExecutionOptions::default())
            .await
    }

    /// Probe whether the back end for this tenant is alive.
    ///
    /// # Errors
    ///
    /// See [`MessageSender::send`].
    pub async fn check_heartbeat(&self) -> Result<SendReceipt, SendError> {
        let request = ExecutionRequest::heartbeat_check(self.tenant.tenant_id());
        self.publish(&request).await
    }

    async fn publish(&self, request: &ExecutionRequest) -> Result<SendReceipt, SendError> {
        let status = self
            .sender
            .send(request, self.tenant.tenant_id(), request.correlation_id())
            .await?;
        Ok(SendReceipt {
            correlation_id: request.correlation_id().to_string(),
            status,
        })
    }
}
