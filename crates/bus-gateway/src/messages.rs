//! # Message Catalogue
//!
//! Payloads exchanged between the front end and the processing back end.
//!
//! - [`ExecutionRequest`] - front end → back end: queue work or probe liveness
//! - [`StatusNotification`] - back end → front end: progress, heartbeats and
//!   metadata change notices. A polymorphic base type: the payload tag names
//!   the concrete subtype.

use crate::codec::BusMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Work the back end can be asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionCommand {
    ProcessDateRange,
    BuildRule,
    DeleteRule,
    UpdateCache,
    RebuildSearchIndex,
    ProcessCalculatedPoints,
    GitSync,
    RunDiagnostics,
    CheckHeartBeat,
    Cancel,
}

/// Optional parameters carried by an execution request.
///
/// Extend this rather than adding fields to [`ExecutionRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Rule the command applies to, empty for all.
    pub rule_id: String,
    /// Bypass caches for commands that normally use them.
    pub force: bool,
    /// Start of a date-range run; the back end resumes from its last
    /// completed point when absent.
    pub start_date: Option<DateTime<Utc>>,
    /// Target end of a date-range run.
    pub target_end_date: Option<DateTime<Utc>>,
    /// Recreate the search index before updating it.
    pub recreate_index: bool,
    /// Requester's email, if the command acts on their behalf.
    pub user_email: String,
}

/// A request for the back end to do something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Correlation id of this request.
    pub id: String,
    pub tenant_id: String,
    /// Progress record the back end reports against.
    pub progress_id: String,
    pub command: ExecutionCommand,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    /// Deterministic heartbeat probe for a tenant.
    #[must_use]
    pub fn heartbeat_check(tenant_id: &str) -> Self {
        Self {
            id: heartbeat_correlation_id(tenant_id),
            tenant_id: tenant_id.to_string(),
            progress_id: String::new(),
            command: ExecutionCommand::CheckHeartBeat,
            requested_by: "heartbeat".to_string(),
            requested_at: Utc::now(),
            options: ExecutionOptions::default(),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.id
    }
}

impl BusMessage for ExecutionRequest {
    const TYPE_NAME: &'static str = "ExecutionRequest";
}

/// Progress of a long-running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressStatus {
    Queued,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

/// Back-end notifications. The runtime tag is the variant name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StatusNotification {
    Progress {
        progress_id: String,
        status: ProgressStatus,
        /// 0.0 ..= 1.0
        percentage: f64,
        message: String,
    },
    HeartBeat {
        service: String,
        version: String,
        at: DateTime<Utc>,
    },
    RuleMetadataUpdated {
        /// `None` means every rule changed.
        rule_id: Option<String>,
    },
}

impl StatusNotification {
    /// Heartbeat for `service`, stamped now.
    #[must_use]
    pub fn heartbeat(service: &str, version: &str) -> Self {
        StatusNotification::HeartBeat {
            service: service.to_string(),
            version: version.to_string(),
            at: Utc::now(),
        }
    }
}

impl BusMessage for StatusNotification {
    const TYPE_NAME: &'static str = "StatusNotification";

    fn runtime_type(&self) -> &'static str {
        match self {
            StatusNotification::Progress { .. } => "Progress",
            StatusNotification::HeartBeat { .. } => "HeartBeat",
            StatusNotification::RuleMetadataUpdated { .. } => "RuleMetadataUpdated",
        }
    }

    fn accepts_runtime_type(tag: &str) -> bool {
        matches!(
            tag,
            "StatusNotification" | "Progress" | "HeartBeat" | "RuleMetadataUpdated"
        )
    }
}

/// Correlation id used by every heartbeat for a tenant.
#[must_use]
pub fn heartbeat_correlation_id(tenant_id: &str) -> String {
    format!("heartbeat-{tenant_id}")
}
