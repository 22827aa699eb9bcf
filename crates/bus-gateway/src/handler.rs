//! # Handler Contract
//!
//! Application handlers are registered once at start-up. The processor asks
//! the registry for every handler whose `can_handle` accepts the envelope's
//! `MessageType` and invokes all of them (fan-out, not first-match).

use crate::codec::{self, BusMessage};
use crate::shutdown::ShutdownSignal;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw handler over undecoded bodies.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Whether this handler processes envelopes of `message_type`.
    fn can_handle(&self, message_type: &str) -> bool;

    /// Process a body. Returns `true` on success.
    ///
    /// Long-running handlers must watch `signal` so shutdown is not blocked.
    async fn handle(&self, body: &[u8], signal: &ShutdownSignal) -> bool;
}

/// Strongly typed handler for one payload type.
#[async_trait]
pub trait TypedHandler<T: BusMessage>: Send + Sync {
    async fn handle(&self, message: T, signal: &ShutdownSignal) -> bool;
}

#[async_trait]
impl<T, H> TypedHandler<T> for Arc<H>
where
    T: BusMessage,
    H: TypedHandler<T> + ?Sized,
{
    async fn handle(&self, message: T, signal: &ShutdownSignal) -> bool {
        (**self).handle(message, signal).await
    }
}

/// Decodes the tagged body into `T` and forwards to a [`TypedHandler`].
pub struct TypedAdapter<T, H> {
    inner: H,
    _payload: PhantomData<fn() -> T>,
}

impl<T, H> TypedAdapter<T, H>
where
    T: BusMessage,
    H: TypedHandler<T>,
{
    #[must_use]
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _payload: PhantomData,
        }
    }

    /// Wrap and erase into a registry entry.
    #[must_use]
    pub fn boxed(inner: H) -> Arc<dyn MessageHandler>
    where
        H: 'static,
    {
        Arc::new(Self::new(inner))
    }

    #[must_use]
    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<T, H> MessageHandler for TypedAdapter<T, H>
where
    T: BusMessage,
    H: TypedHandler<T>,
{
    fn can_handle(&self, message_type: &str) -> bool {
        message_type == T::TYPE_NAME
    }

    async fn handle(&self, body: &[u8], signal: &ShutdownSignal) -> bool {
        match codec::decode::<T>(body) {
            Ok(message) => self.inner.handle(message, signal).await,
            Err(e) if e.is_structural() => {
                warn!(expected = T::TYPE_NAME, error = %e, "Payload is not the declared type");
                false
            }
            Err(e) => {
                warn!(expected = T::TYPE_NAME, error = %e, "Failed to deserialize payload");
                false
            }
        }
    }
}

/// Aggregate result of invoking every matching handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Nothing is registered for the type.
    NoHandlers,
    /// At least one handler returned `true`.
    Handled { succeeded: usize, attempted: usize },
    /// Every matching handler returned `false`.
    AllFailed { attempted: usize },
}

impl HandlerVerdict {
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, HandlerVerdict::Handled { .. })
    }
}

/// Read-only set of handlers, built once at start-up.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
        Self { handlers }
    }

    /// Add a handler while building.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Add a typed handler while building.
    #[must_use]
    pub fn with_typed<T, H>(self, handler: H) -> Self
    where
        T: BusMessage,
        H: TypedHandler<T> + 'static,
    {
        self.with_handler(TypedAdapter::<T, H>::boxed(handler))
    }

    /// Every handler accepting `message_type` (exact match).
    #[must_use]
    pub fn resolve(&self, message_type: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .iter()
            .filter(|h| h.can_handle(message_type))
            .cloned()
            .collect()
    }

    /// Invoke every matching handler with the same body and signal.
    pub async fn dispatch(
        &self,
        message_type: &str,
        body: &[u8],
        signal: &ShutdownSignal,
    ) -> HandlerVerdict {
        let handlers = self.resolve(message_type);
        if handlers.is_empty() {
            return HandlerVerdict::NoHandlers;
        }

        let attempted = handlers.len();
        let mut succeeded = 0;
        for handler in handlers {
            if handler.handle(body, signal).await {
                succeeded += 1;
            }
        }

        debug!(message_type, attempted, succeeded, "Handlers invoked");

        if succeeded > 0 {
            HandlerVerdict::Handled {
                succeeded,
                attempted,
            }
        } else {
            HandlerVerdict::AllFailed { attempted }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
