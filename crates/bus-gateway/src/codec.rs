//! # Tagged Payload Codec
//!
//! Payloads describe their own runtime type so that a handler registered
//! for a base type can receive any of its subtypes.
//!
//! ```text
//! {"$type": "<runtime type>", "body": { ...payload fields... }}
//! ```
//!
//! The tag is read before the body is decoded. A tag the target type does not
//! accept is a structural mismatch, not a serialization error.

use crate::error::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Media type stamped on every envelope produced by this codec.
pub const CONTENT_TYPE: &str = "application/json";

/// A payload type that can travel through the gateway.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Base type name. The `MessageType` header always carries this name;
    /// subtypes travel only in the payload tag.
    const TYPE_NAME: &'static str;

    /// Concrete runtime type of this value, written as the payload tag.
    fn runtime_type(&self) -> &'static str {
        Self::TYPE_NAME
    }

    /// Whether a payload tagged `tag` can be decoded as `Self`.
    fn accepts_runtime_type(tag: &str) -> bool {
        tag == Self::TYPE_NAME
    }
}

#[derive(Serialize)]
struct TaggedRef<'a, T> {
    #[serde(rename = "$type")]
    type_tag: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
struct TaggedRaw {
    #[serde(rename = "$type")]
    type_tag: Option<String>,
    #[serde(default)]
    body: serde_json::Value,
}

/// Serialize a payload with its runtime type tag.
///
/// # Errors
///
/// `CodecError::Serialization` if the payload cannot be represented as JSON.
pub fn encode<T: BusMessage>(value: &T) -> Result<Vec<u8>, CodecError> {
    let tagged = TaggedRef {
        type_tag: value.runtime_type(),
        body: value,
    };
    serde_json::to_vec(&tagged).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Read only the runtime type tag.
///
/// # Errors
///
/// `Malformed` for non-JSON input, `MissingTypeTag` if the tag is absent.
pub fn peek_type(bytes: &[u8]) -> Result<String, CodecError> {
    let raw: TaggedRaw =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    raw.type_tag.ok_or(CodecError::MissingTypeTag)
}

/// Decode a tagged payload into `T`.
///
/// # Errors
///
/// - `Malformed` - not a tagged JSON document
/// - `MissingTypeTag` - no `$type`
/// - `TypeMismatch` - `T` does not accept the tag
/// - `Serialization` - the body does not fit `T`
pub fn decode<T: BusMessage>(bytes: &[u8]) -> Result<T, CodecError> {
    let raw: TaggedRaw =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let tag = raw.type_tag.ok_or(CodecError::MissingTypeTag)?;

    if !T::accepts_runtime_type(&tag) {
        return Err(CodecError::TypeMismatch {
            expected: T::TYPE_NAME,
            found: tag,
        });
    }

    serde_json::from_value(raw.body).map_err(|e| CodecError::Serialization(e.to_string()))
}
