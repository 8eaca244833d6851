//! Message handlers invoked by a channel's consumer task.
//!
//! Every channel owns exactly one handler. The consumer task calls
//! [`MessageHandler::on_message`] once per message, in queue order and never
//! concurrently, then [`MessageHandler::on_close`] once after the queue has
//! been closed and drained.

use std::sync::{Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channels::id::ChannelId;
use crate::channels::registry::Registry;

/// Per-message consumer callback: `(sequence_number, message)`.
pub type ConsumerFn<M> = Box<dyn Fn(u64, M) + Send + Sync>;

/// Close notification callback.
pub type CloseFn = Box<dyn FnOnce() + Send>;

/// Capability implemented by whatever consumes a channel's messages.
#[async_trait]
pub trait MessageHandler<M>: Send + Sync {
    /// Handle one message. `seq` starts at 1 and increases by one per message.
    async fn on_message(&self, seq: u64, message: M);

    /// Called once when the consumer task is about to stop.
    async fn on_close(&self) {}
}

/// Handler that discards messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

#[async_trait]
impl<M: Send + 'static> MessageHandler<M> for NoopHandler {
    async fn on_message(&self, _seq: u64, _message: M) {}
}

/// Handler built from user-supplied closures.
///
/// The close listener runs at most once, even if `on_close` is invoked again.
pub struct FnHandler<M> {
    consumer: Option<ConsumerFn<M>>,
    close_listener: Mutex<Option<CloseFn>>,
}

impl<M> FnHandler<M> {
    pub fn new(consumer: Option<ConsumerFn<M>>, close_listener: Option<CloseFn>) -> Self {
        Self {
            consumer,
            close_listener: Mutex::new(close_listener),
        }
    }
}

impl<M> std::fmt::Debug for FnHandler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("consumer", &self.consumer.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<M: Send + 'static> MessageHandler<M> for FnHandler<M> {
    async fn on_message(&self, seq: u64, message: M) {
        if let Some(consumer) = &self.consumer {
            consumer(seq, message);
        }
    }

    async fn on_close(&self) {
        let listener = self
            .close_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener();
        }
    }
}

/// Wraps a custom handler so a separately configured close listener still
/// runs after the handler's own `on_close`.
pub(crate) struct WithCloseListener<M> {
    handler: Box<dyn MessageHandler<M>>,
    listener: Mutex<Option<CloseFn>>,
}

impl<M> WithCloseListener<M> {
    pub(crate) fn new(handler: Box<dyn MessageHandler<M>>, listener: CloseFn) -> Self {
        Self {
            handler,
            listener: Mutex::new(Some(listener)),
        }
    }
}

#[async_trait]
impl<M: Send + 'static> MessageHandler<M> for WithCloseListener<M> {
    async fn on_message(&self, seq: u64, message: M) {
        self.handler.on_message(seq, message).await;
    }

    async fn on_close(&self) {
        self.handler.on_close().await;
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener();
        }
    }
}

/// Relay installed on child channels.
///
/// Re-sends every message into the parent's queue and, on close, removes the
/// child from the parent's registry. The registry is held weakly: the parent
/// registry owns the child's handle, so a strong reference here would keep
/// both consumer tasks alive after every handle is dropped.
pub(crate) struct ForwardToParent<M> {
    parent_id: ChannelId,
    child_id: ChannelId,
    parent_tx: mpsc::Sender<M>,
    parent_children: Weak<Registry<M>>,
}

impl<M> ForwardToParent<M> {
    pub(crate) fn new(
        parent_id: ChannelId,
        child_id: ChannelId,
        parent_tx: mpsc::Sender<M>,
        parent_children: Weak<Registry<M>>,
    ) -> Self {
        Self {
            parent_id,
            child_id,
            parent_tx,
            parent_children,
        }
    }
}

#[async_trait]
impl<M: Send + 'static> MessageHandler<M> for ForwardToParent<M> {
    async fn on_message(&self, seq: u64, message: M) {
        if self.parent_tx.send(message).await.is_err() {
            tracing::error!(
                parent = %self.parent_id,
                child = %self.child_id,
                seq,
                "Parent queue closed while child was still forwarding, message dropped"
            );
        }
    }

    async fn on_close(&self) {
        let Some(parent_children) = self.parent_children.upgrade() else {
            tracing::debug!(
                parent = %self.parent_id,
                child = %self.child_id,
                "Parent already dropped, nothing to deregister"
            );
            return;
        };
        // Removal must not be abandoned on a lock deadline, or the parent
        // would wait for this child forever.
        match parent_children.remove_unbounded(self.child_id).await {
            Some(_) => tracing::debug!(
                parent = %self.parent_id,
                child = %self.child_id,
                "Child channel removed from parent registry"
            ),
            None => tracing::warn!(
                parent = %self.parent_id,
                child = %self.child_id,
                "Child channel was not registered with its parent"
            ),
        }
    }
}
