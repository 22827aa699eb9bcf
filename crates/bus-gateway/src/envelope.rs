//! # Envelope
//!
//! The header + body unit exchanged through the broker.

use crate::error::HeaderError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical type name of the payload.
pub const MESSAGE_TYPE_HEADER: &str = "MessageType";

/// Tenant (environment) routing key.
///
/// Lower-cased because the broker's subscription filter is case-sensitive.
pub const TENANT_HEADER: &str = "tenantid";

/// Correlation id header, echoed alongside the broker message id.
pub const CORRELATION_ID_HEADER: &str = "CorrelationId";

/// A message as it travels through the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Serialized payload.
    pub body: Vec<u8>,
    /// Application headers. Lookup is case-sensitive.
    pub headers: BTreeMap<String, String>,
    /// Broker message id. Equal to the correlation id for idempotent re-publish.
    pub message_id: String,
    /// Caller-assigned trace id.
    pub correlation_id: String,
    /// Media type of `body`.
    pub content_type: String,
}

/// Validated routing information borrowed from an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<'a> {
    pub tenant_id: &'a str,
    pub message_type: &'a str,
}

impl Envelope {
    /// Create an envelope with routing headers stamped.
    #[must_use]
    pub fn new(
        body: Vec<u8>,
        message_type: &str,
        tenant_id: &str,
        correlation_id: &str,
        content_type: &str,
    ) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(MESSAGE_TYPE_HEADER.to_string(), message_type.to_string());
        headers.insert(TENANT_HEADER.to_string(), tenant_id.to_string());
        headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.to_string());

        Self {
            body,
            headers,
            message_id: correlation_id.to_string(),
            correlation_id: correlation_id.to_string(),
            content_type: content_type.to_string(),
        }
    }

    /// Get a header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Set or replace a header.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Remove a header, returning its previous value.
    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    /// Validate the routing headers.
    ///
    /// Presence is checked for both headers before emptiness, tenant first.
    ///
    /// # Errors
    ///
    /// The returned [`HeaderError`] doubles as the dead-letter reason.
    pub fn route(&self) -> Result<Route<'_>, HeaderError> {
        let tenant_id = self.header(TENANT_HEADER).ok_or(HeaderError::MissingTenant)?;
        let message_type = self
            .header(MESSAGE_TYPE_HEADER)
            .ok_or(HeaderError::MissingType)?;

        if tenant_id.is_empty() {
            return Err(HeaderError::EmptyTenant);
        }
        if message_type.is_empty() {
            return Err(HeaderError::EmptyType);
        }

        Ok(Route {
            tenant_id,
            message_type,
        })
    }
}

/// Terminal state of a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledged; removed from the subscription.
    Completed,
    /// Removed from normal delivery without requeue.
    DeadLettered { reason: String },
    /// Released back to the broker before acknowledgement.
    Abandoned,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Completed => write!(f, "completed"),
            Disposition::DeadLettered { reason } => write!(f, "dead-lettered ({reason})"),
            Disposition::Abandoned => write!(f, "abandoned"),
        }
    }
}
