//! Handler and watcher capabilities.
//!
//! Handlers process incoming messages and steer their acknowledgement;
//! watchers observe notifications for messages handled elsewhere. Both are
//! object-safe async traits with blanket implementations for async
//! closures, so plain `|msg| async move { ... }` functions work directly.

use crate::message::Message;
use futures_util::future::BoxFuture;
use std::future::Future;

/// What a handler decided about an incoming message.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum HandlerOutcome {
    /// Leave the message unchanged and mark it handled (or not).
    Handled(bool),
    /// Replace the message's parameters and return value for the
    /// acknowledgement, and mark it handled (or not).
    Mutated {
        /// The rewritten message; its params and return value are used
        /// for the acknowledgement.
        message: Message,
        /// Whether the rewritten message counts as handled.
        handled: bool,
    },
    /// Acknowledge unchanged, not handled.
    Ignored,
}

/// An installed message handler.
///
/// The returned future runs as a cooperative task; all handlers selected
/// for one incoming message are joined before the acknowledgement is sent.
pub trait MessageHandler: Send + Sync {
    /// Process one incoming message.
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerOutcome>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, HandlerOutcome> {
        Box::pin(self(message))
    }
}

/// A watcher for messages handled elsewhere.
///
/// Watchers observe; they cannot influence acknowledgement.
pub trait NotificationWatcher: Send + Sync {
    /// Observe one notification.
    fn notify(&self, message: Message) -> BoxFuture<'static, ()>;
}

impl<F, Fut> NotificationWatcher for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn notify(&self, message: Message) -> BoxFuture<'static, ()> {
        Box::pin(self(message))
    }
}
