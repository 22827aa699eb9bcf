//! Error types for the bus gateway.

use std::fmt;
use thiserror::Error;

/// Failures reported by the broker client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Credentials were rejected or the token expired.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Name resolution or socket-level failure.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The topic or subscription does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// The client, sender or subscription was already closed.
    #[error("Broker link closed")]
    Closed,

    /// Anything the broker client could not classify.
    #[error("Broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Recovery class of this error.
    #[must_use]
    pub fn kind(&self) -> FaultKind {
        match self {
            BrokerError::Unauthorized(_) => FaultKind::Authentication,
            BrokerError::Connection(_) => FaultKind::Connection,
            BrokerError::EntityNotFound(_) | BrokerError::Closed | BrokerError::Other(_) => {
                FaultKind::Unclassified
            }
        }
    }

    /// Stable name of the variant, used as part of rate-limiter keys.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            BrokerError::Unauthorized(_) => "Unauthorized",
            BrokerError::Connection(_) => "Connection",
            BrokerError::EntityNotFound(_) => "EntityNotFound",
            BrokerError::Closed => "Closed",
            BrokerError::Other(_) => "Other",
        }
    }
}

/// How the gateway reacts to a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Recoverable by token refresh; never triggers a reconnect.
    Authentication,
    /// Triggers the stop / cool-down / restart cycle.
    Connection,
    /// Logged and otherwise ignored.
    Unclassified,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Authentication => write!(f, "authentication"),
            FaultKind::Connection => write!(f, "connection"),
            FaultKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Payload encoding and decoding errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The body is not a tagged JSON document.
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// The body has no `$type` tag.
    #[error("Payload has no type tag")]
    MissingTypeTag,

    /// The tag names a type the target cannot represent.
    #[error("Payload type {found} is not a {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    /// The tag matched but the body did not fit the type.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CodecError {
    /// Whether the payload is structurally not the declared type.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CodecError::Malformed(_) | CodecError::MissingTypeTag | CodecError::TypeMismatch { .. }
        )
    }
}

/// Routing header violations. The display string is the dead-letter reason.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    #[error("missing tenant header")]
    MissingTenant,

    #[error("missing type header")]
    MissingType,

    #[error("empty tenant header")]
    EmptyTenant,

    #[error("empty type header")]
    EmptyType,
}

/// Errors the producer surfaces to callers.
///
/// Broker failures are not among them: those are logged and reported as
/// [`crate::SendStatus::Dropped`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Top-level gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        assert_eq!(
            BrokerError::Unauthorized("expired".into()).kind(),
            FaultKind::Authentication
        );
        assert_eq!(
            BrokerError::Connection("dns".into()).kind(),
            FaultKind::Connection
        );
        assert_eq!(BrokerError::Closed.kind(), FaultKind::Unclassified);
        assert_eq!(
            BrokerError::EntityNotFound("topic".into()).kind(),
            FaultKind::Unclassified
        );
    }

    #[test]
    fn test_header_error_reasons() {
        assert_eq!(HeaderError::MissingTenant.to_string(), "missing tenant header");
        assert_eq!(HeaderError::MissingType.to_string(), "missing type header");
        assert_eq!(HeaderError::EmptyTenant.to_string(), "empty tenant header");
        assert_eq!(HeaderError::EmptyType.to_string(), "empty type header");
    }

    #[test]
    fn test_structural_codec_errors() {
        assert!(CodecError::MissingTypeTag.is_structural());
        assert!(CodecError::Malformed("eof".into()).is_structural());
        assert!(!CodecError::Serialization("missing field".into()).is_structural());
    }
}
