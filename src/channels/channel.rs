//! Buffered single-consumer channel with forwarding child channels.
//!
//! Each [`Channel`] owns a bounded queue drained by one background consumer
//! task. Child channels created with [`Channel::make_child_channel`] relay
//! everything they consume into the parent's queue, so the parent's handler
//! sees its own traffic plus that of every descendant.
//!
//! Shutdown starts at the top and completes from the bottom up: a parent only
//! closes its queue once its registry of children is empty, because a live
//! child may still be forwarding into it.
//!
//! ```text
//!   Running --(queue closed)--> Draining --(backlog consumed)--> Closed
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::channels::handler::{
    CloseFn, ConsumerFn, FnHandler, ForwardToParent, MessageHandler, NoopHandler,
    WithCloseListener,
};
use crate::channels::id::{ChannelId, IdAllocator};
use crate::channels::registry::{ChildMap, Registry};
use crate::config::ChannelSettings;
use crate::error::{ChannelError, RegistryError};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Queue open, consumer task active.
    Running,
    /// Queue closed, consumer still flushing the backlog.
    Draining,
    /// Consumer task finished and the close listener has run.
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Running => write!(f, "running"),
            ChannelState::Draining => write!(f, "draining"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// Construction-time configuration for a [`Channel`].
///
/// A custom handler set with [`with_handler`](Self::with_handler) and a
/// consumer closure both want every message, so whichever is set last wins
/// and the replacement is logged. A close listener composes with either: it
/// runs after the handler's own `on_close`.
pub struct ChannelConfig<M> {
    settings: ChannelSettings,
    consumer: Option<ConsumerFn<M>>,
    close_listener: Option<CloseFn>,
    handler: Option<Box<dyn MessageHandler<M>>>,
    ids: Option<Arc<IdAllocator>>,
}

impl<M: Send + 'static> ChannelConfig<M> {
    pub fn new() -> Self {
        Self::from_settings(ChannelSettings::default())
    }

    pub fn from_settings(settings: ChannelSettings) -> Self {
        Self {
            settings,
            consumer: None,
            close_listener: None,
            handler: None,
            ids: None,
        }
    }

    /// Queue capacity. `0` allocates a single slot rather than a rendezvous:
    /// `send` returns once the message is queued, which may be before the
    /// consumer has taken it.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.settings.buffer_capacity = capacity;
        self
    }

    /// Invoke `consumer(seq, message)` for every message, on the consumer task.
    pub fn with_consumer<F>(mut self, consumer: F) -> Self
    where
        F: Fn(u64, M) + Send + Sync + 'static,
    {
        if self.handler.take().is_some() {
            tracing::warn!("Consumer closure replaces the previously configured handler");
        }
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Invoke `listener` once after the queue has been closed and drained.
    pub fn with_close_listener<F>(mut self, listener: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        if self.close_listener.is_some() {
            tracing::warn!("Close listener replaces the previously configured one");
        }
        self.close_listener = Some(Box::new(listener));
        self
    }

    /// Deliver messages to `handler`. A close listener set before or after
    /// still fires.
    pub fn with_handler(mut self, handler: impl MessageHandler<M> + 'static) -> Self {
        if self.consumer.take().is_some() {
            tracing::warn!("Handler replaces the previously configured consumer closure");
        }
        if self.handler.is_some() {
            tracing::warn!("Handler replaces the previously configured handler");
        }
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = Some(name.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.settings.poll_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.settings.lock_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.settings.shutdown_timeout = Some(timeout);
        self
    }

    /// Draw identifiers from `ids` instead of the process-wide allocator.
    pub fn with_id_allocator(mut self, ids: Arc<IdAllocator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    fn into_parts(self) -> (ChannelSettings, Arc<IdAllocator>, Box<dyn MessageHandler<M>>) {
        let ids = self.ids.unwrap_or_else(IdAllocator::global);
        let handler: Box<dyn MessageHandler<M>> =
            match (self.handler, self.consumer, self.close_listener) {
                (Some(handler), _, Some(listener)) => {
                    Box::new(WithCloseListener::new(handler, listener))
                }
                (Some(handler), _, None) => handler,
                (None, None, None) => Box::new(NoopHandler),
                (None, consumer, listener) => Box::new(FnHandler::new(consumer, listener)),
            };
        (self.settings, ids, handler)
    }
}

impl<M: Send + 'static> Default for ChannelConfig<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> std::fmt::Debug for ChannelConfig<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("settings", &self.settings)
            .field("consumer", &self.consumer.is_some())
            .field("close_listener", &self.close_listener.is_some())
            .field("custom_handler", &self.handler.is_some())
            .finish()
    }
}

/// Handle to a channel. Cloning is cheap and every clone refers to the same
/// queue, consumer task and children.
pub struct Channel<M> {
    inner: Arc<ChannelInner<M>>,
}

struct ChannelInner<M> {
    id: ChannelId,
    settings: ChannelSettings,
    ids: Arc<IdAllocator>,
    /// The channel's own sender. Taken (dropped) when the queue is closed;
    /// forwarding children keep clones until they finish.
    sender: RwLock<Option<mpsc::Sender<M>>>,
    children: Arc<Registry<M>>,
    /// Completion signal; only the consumer task writes `Closed`.
    state: Arc<watch::Sender<ChannelState>>,
}

impl<M> Clone for Channel<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M> std::fmt::Debug for Channel<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("name", &self.inner.settings.name)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<M: Send + 'static> Channel<M> {
    /// Create a channel and start its consumer task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: ChannelConfig<M>) -> Self {
        let (settings, ids, handler) = config.into_parts();
        let id = ids.next_id();
        Self::spawn(id, settings, ids, handler)
    }

    fn spawn(
        id: ChannelId,
        settings: ChannelSettings,
        ids: Arc<IdAllocator>,
        handler: Box<dyn MessageHandler<M>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.effective_capacity());
        let (state, _) = watch::channel(ChannelState::Running);
        let state = Arc::new(state);
        let children = Arc::new(Registry::new(settings.lock_timeout));

        let span = tracing::debug_span!(
            "channel",
            id = %id,
            name = settings.name.as_deref().unwrap_or("")
        );
        tokio::spawn(run_consumer(id, rx, handler, Arc::clone(&state)).instrument(span));

        tracing::debug!(
            channel = %id,
            capacity = settings.effective_capacity(),
            "Channel spawned"
        );

        Self {
            inner: Arc::new(ChannelInner {
                id,
                settings,
                ids,
                sender: RwLock::new(Some(tx)),
                children,
                state,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.settings.name.as_deref()
    }

    /// Allocated queue capacity.
    pub fn capacity(&self) -> usize {
        self.inner.settings.effective_capacity()
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Watch receiver that observes every lifecycle transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Enqueue `message`, waiting while the queue is full.
    pub async fn send(&self, message: M) -> Result<(), ChannelError> {
        let tx = self.sender()?;
        tx.send(message)
            .await
            .map_err(|_| ChannelError::Closed { id: self.id() })
    }

    /// Enqueue `message` unless `cancel` fires before the queue has room.
    ///
    /// A cancelled send enqueues nothing.
    pub async fn send_cancellable(
        &self,
        message: M,
        cancel: &CancellationToken,
    ) -> Result<(), ChannelError> {
        let tx = self.sender()?;
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChannelError::Cancelled { id: self.id() }),
            permit = tx.reserve() => permit.map_err(|_| ChannelError::Closed { id: self.id() })?,
        };
        permit.send(message);
        Ok(())
    }

    /// Enqueue `message`, giving up with [`ChannelError::Cancelled`] once
    /// `timeout` has elapsed without room in the queue.
    pub async fn send_timeout(&self, message: M, timeout: Duration) -> Result<(), ChannelError> {
        let tx = self.sender()?;
        tx.send_timeout(message, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    ChannelError::Cancelled { id: self.id() }
                }
                mpsc::error::SendTimeoutError::Closed(_) => ChannelError::Closed { id: self.id() },
            })
    }

    /// Enqueue `message` only if there is room right now.
    pub fn try_send(&self, message: M) -> Result<(), mpsc::error::TrySendError<M>> {
        match self.sender() {
            Ok(tx) => tx.try_send(message),
            Err(_) => Err(mpsc::error::TrySendError::Closed(message)),
        }
    }

    /// Create a child channel whose messages are relayed into this one.
    ///
    /// The child inherits this channel's settings (except its name) and id
    /// allocator, and is registered here until it has fully shut down.
    pub async fn make_child_channel(&self) -> Result<Channel<M>, ChannelError> {
        let parent_tx = self.sender()?;
        let child_id = self.inner.ids.next_id();
        let settings = ChannelSettings {
            name: None,
            ..self.inner.settings.clone()
        };
        let forward = ForwardToParent::new(
            self.id(),
            child_id,
            parent_tx,
            Arc::downgrade(&self.inner.children),
        );
        let child = Channel::spawn(
            child_id,
            settings,
            Arc::clone(&self.inner.ids),
            Box::new(forward),
        );

        if let Err(source) = self.inner.children.set(child_id, child.clone()).await {
            // Unregistered children must not linger holding our sender.
            child.close_queue();
            return Err(ChannelError::Registry {
                id: self.id(),
                source,
            });
        }

        tracing::debug!(parent = %self.id(), child = %child_id, "Child channel registered");
        Ok(child)
    }

    /// Snapshot of the live children, in no particular order.
    pub async fn children(&self) -> Result<Vec<Channel<M>>, ChannelError> {
        self.inner
            .children
            .children()
            .await
            .map_err(|source| ChannelError::Registry {
                id: self.id(),
                source,
            })
    }

    pub async fn child_count(&self) -> Result<usize, ChannelError> {
        self.inner
            .children
            .size()
            .await
            .map_err(|source| ChannelError::Registry {
                id: self.id(),
                source,
            })
    }

    /// The registry tracking this channel's live children.
    pub fn registry(&self) -> &Registry<M> {
        &self.inner.children
    }

    /// Sender-side shutdown.
    ///
    /// Waits until every child has finished, then closes the queue and waits
    /// for the backlog to be consumed and the close listener to run. If the
    /// configured shutdown timeout elapses first, the queue is left open and
    /// the timeout is returned.
    ///
    /// Must not be awaited from this channel's own handler.
    pub async fn sender_wait_and_close(&self) -> Result<(), ChannelError> {
        self.sender_wait_and_close_with(|_| Ok(())).await
    }

    /// [`sender_wait_and_close`](Self::sender_wait_and_close) that calls
    /// `drain` with the live children on every check while waiting.
    pub async fn sender_wait_and_close_with<F>(&self, drain: F) -> Result<(), ChannelError>
    where
        F: FnMut(&ChildMap<M>) -> Result<(), RegistryError> + Send,
    {
        let settings = &self.inner.settings;
        self.inner
            .children
            .block_until_empty_with(drain, settings.poll_interval, settings.shutdown_timeout)
            .await
            .map_err(|source| ChannelError::Registry {
                id: self.id(),
                source,
            })?;

        self.close_queue();
        self.receiver_wait().await;

        match self.name() {
            Some(name) => tracing::info!(channel = %self.id(), name, "Channel shut down"),
            None => tracing::debug!(channel = %self.id(), "Channel shut down"),
        }
        Ok(())
    }

    /// Wait until the consumer task has exited: every queued message has been
    /// handled and the close listener has run. Returns at once if already
    /// closed.
    pub async fn receiver_wait(&self) {
        let mut state = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
    }

    fn sender(&self) -> Result<mpsc::Sender<M>, ChannelError> {
        self.inner
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ChannelError::Closed { id: self.id() })
    }

    /// Drop this channel's own sender. The consumer drains what is queued
    /// and stops once no other sender clone remains.
    fn close_queue(&self) {
        let taken = self
            .inner
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            self.inner.state.send_if_modified(|state| {
                if *state == ChannelState::Running {
                    *state = ChannelState::Draining;
                    true
                } else {
                    false
                }
            });
            tracing::debug!(channel = %self.id(), "Queue closed, draining");
        }
    }
}

/// Marks the channel closed when the consumer task ends, whether it returned
/// normally or unwound out of a handler.
struct CompletionGuard {
    id: ChannelId,
    state: Arc<watch::Sender<ChannelState>>,
    listener_ran: bool,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.listener_ran {
            tracing::warn!(
                channel = %self.id,
                "Consumer task stopped abnormally, close listener skipped"
            );
        }
        self.state.send_replace(ChannelState::Closed);
    }
}

async fn run_consumer<M: Send + 'static>(
    id: ChannelId,
    mut rx: mpsc::Receiver<M>,
    handler: Box<dyn MessageHandler<M>>,
    state: Arc<watch::Sender<ChannelState>>,
) {
    let mut completion = CompletionGuard {
        id,
        state,
        listener_ran: false,
    };

    let mut seq: u64 = 0;
    while let Some(message) = rx.recv().await {
        seq += 1;
        handler.on_message(seq, message).await;
    }

    tracing::debug!(channel = %id, consumed = seq, "Queue drained");
    handler.on_close().await;
    completion.listener_ran = true;
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use pretty_assertions::assert_eq;
    use tokio::sync::Notify;

    use super::*;

    fn recording_config(
        ids: &Arc<IdAllocator>,
        capacity: usize,
    ) -> (ChannelConfig<u32>, Arc<Mutex<Vec<(u64, u32)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let config = ChannelConfig::new()
            .with_buffer_capacity(capacity)
            .with_poll_interval(Duration::from_millis(10))
            .with_id_allocator(Arc::clone(ids))
            .with_consumer(move |seq, msg| sink.lock().unwrap().push((seq, msg)));
        (config, seen)
    }

    /// Handler that blocks on a gate before consuming each message.
    struct GatedHandler {
        gate: Arc<Notify>,
        entered: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl MessageHandler<u32> for GatedHandler {
        async fn on_message(&self, _seq: u64, _message: u32) {
            self.entered.notify_one();
            self.gate.notified().await;
        }
    }

    #[tokio::test]
    async fn test_ids_come_from_injected_allocator() {
        let ids = Arc::new(IdAllocator::new());
        let a: Channel<u32> = Channel::new(ChannelConfig::new().with_id_allocator(Arc::clone(&ids)));
        let b: Channel<u32> = Channel::new(ChannelConfig::new().with_id_allocator(Arc::clone(&ids)));
        assert_eq!(a.id(), ChannelId::new(1));
        assert_eq!(b.id(), ChannelId::new(2));
        assert_eq!(a.clone().id(), a.id());
    }

    #[tokio::test]
    async fn test_sequence_numbers_match_send_order() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 4);
        let channel = Channel::new(config);

        for i in 0..50 {
            channel.send(i).await.unwrap();
        }
        channel.sender_wait_and_close().await.unwrap();

        let expected: Vec<(u64, u32)> = (0..50).map(|i| (i as u64 + 1, i)).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_zero_capacity_maps_to_one_slot() {
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let channel: Channel<u32> = Channel::new(ChannelConfig::new().with_handler(GatedHandler {
            gate: Arc::clone(&gate),
            entered: Arc::clone(&entered),
        }));
        assert_eq!(channel.settings().buffer_capacity, 0);
        assert_eq!(channel.capacity(), 1);

        channel.send(1).await.unwrap();
        entered.notified().await;
        // The handler is parked on message 1, yet one more send is accepted.
        channel.send(2).await.unwrap();
        assert!(matches!(
            channel.try_send(3),
            Err(mpsc::error::TrySendError::Full(3))
        ));

        let closer = channel.clone();
        let shutdown = tokio::spawn(async move { closer.sender_wait_and_close().await });
        while !shutdown.is_finished() {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropping_tree_without_shutdown_releases_consumers() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 2);
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let root = Channel::new(config.with_close_listener(move || {
            let _ = closed_tx.send(());
        }));
        let child = root.make_child_channel().await.unwrap();

        child.send(1).await.unwrap();
        root.send(2).await.unwrap();
        drop(child);
        drop(root);

        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("root consumer should finish once every handle is gone")
            .unwrap();
        let mut received: Vec<u32> = seen.lock().unwrap().iter().map(|(_, m)| *m).collect();
        received.sort();
        assert_eq!(received, vec![1, 2]);
    }

    /// Counts messages and close callbacks.
    #[derive(Default)]
    struct CountingHandler {
        messages: Arc<std::sync::atomic::AtomicUsize>,
        closes: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl MessageHandler<u32> for CountingHandler {
        async fn on_message(&self, _seq: u64, _message: u32) {
            self.messages.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_close_listener_composes_with_handler_in_either_order() {
        for listener_first in [false, true] {
            let handler = CountingHandler::default();
            let messages = Arc::clone(&handler.messages);
            let closes = Arc::clone(&handler.closes);
            let fired = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&fired);
            let listener = move || flag.store(true, Ordering::SeqCst);

            let config = if listener_first {
                ChannelConfig::new()
                    .with_close_listener(listener)
                    .with_handler(handler)
            } else {
                ChannelConfig::new()
                    .with_handler(handler)
                    .with_close_listener(listener)
            };
            let channel = Channel::new(config);
            channel.send(1).await.unwrap();
            channel.send(2).await.unwrap();
            channel.sender_wait_and_close().await.unwrap();

            assert_eq!(messages.load(Ordering::SeqCst), 2, "listener_first={listener_first}");
            assert_eq!(closes.load(Ordering::SeqCst), 1, "listener_first={listener_first}");
            assert!(fired.load(Ordering::SeqCst), "listener_first={listener_first}");
        }
    }

    #[tokio::test]
    async fn test_later_message_sink_replaces_earlier_one() {
        let consumed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&consumed);
        let handler = CountingHandler::default();
        let messages = Arc::clone(&handler.messages);

        let channel = Channel::new(
            ChannelConfig::new()
                .with_consumer(move |_seq, msg: u32| sink.lock().unwrap().push(msg))
                .with_handler(handler),
        );
        channel.send(4).await.unwrap();
        channel.sender_wait_and_close().await.unwrap();

        assert_eq!(messages.load(Ordering::SeqCst), 1);
        assert!(consumed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_listener_fires_before_completion() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let channel: Channel<u32> = Channel::new(
            ChannelConfig::new().with_close_listener(move || flag.store(true, Ordering::SeqCst)),
        );

        let waiter = channel.clone();
        let observed = tokio::spawn(async move {
            waiter.receiver_wait().await;
            waiter.is_closed()
        });

        channel.send(1).await.unwrap();
        channel.sender_wait_and_close().await.unwrap();

        assert!(observed.await.unwrap());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_without_children_skips_poll_interval() {
        let channel: Channel<u32> = Channel::new(
            ChannelConfig::new()
                .with_buffer_capacity(8)
                .with_poll_interval(Duration::from_secs(30)),
        );
        for i in 0..8 {
            channel.send(i).await.unwrap();
        }

        let started = Instant::now();
        channel.sender_wait_and_close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let channel: Channel<u32> = Channel::new(ChannelConfig::new());
        channel.sender_wait_and_close().await.unwrap();

        assert!(matches!(
            channel.send(1).await,
            Err(ChannelError::Closed { .. })
        ));
        assert!(matches!(
            channel.try_send(2),
            Err(mpsc::error::TrySendError::Closed(2))
        ));
        assert!(matches!(
            channel.make_child_channel().await,
            Err(ChannelError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_consumed() {
        let gate = Arc::new(Notify::new());
        let entered = Arc::new(Notify::new());
        let channel = Channel::new(
            ChannelConfig::new()
                .with_buffer_capacity(1)
                .with_handler(GatedHandler {
                    gate: Arc::clone(&gate),
                    entered: Arc::clone(&entered),
                }),
        );

        // First message is taken by the consumer and parked in the handler,
        // the second fills the only slot.
        channel.send(1).await.unwrap();
        entered.notified().await;
        channel.send(2).await.unwrap();

        assert!(matches!(
            channel.try_send(3),
            Err(mpsc::error::TrySendError::Full(3))
        ));
        assert!(matches!(
            channel.send_timeout(3, Duration::from_millis(30)).await,
            Err(ChannelError::Cancelled { .. })
        ));

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            channel.send_cancellable(3, &token).await,
            Err(ChannelError::Cancelled { .. })
        ));

        let mut blocked = tokio_test::task::spawn(channel.send(3));
        tokio_test::assert_pending!(blocked.poll());

        // Release message 1; message 2 moves into the handler and frees the slot.
        gate.notify_one();
        entered.notified().await;
        assert!(blocked.is_woken());
        tokio_test::assert_ready_ok!(blocked.poll());
        drop(blocked);

        let closer = channel.clone();
        let shutdown = tokio::spawn(async move { closer.sender_wait_and_close().await });
        // Keep opening the gate until messages 2 and 3 are through.
        while !shutdown.is_finished() {
            gate.notify_one();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_send_cancellable_succeeds_when_room() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 2);
        let channel = Channel::new(config);
        let token = CancellationToken::new();

        channel.send_cancellable(7, &token).await.unwrap();
        channel.sender_wait_and_close().await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 7)]);
    }

    #[tokio::test]
    async fn test_child_messages_reach_parent() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 2);
        let parent = Channel::new(config);
        let child = parent.make_child_channel().await.unwrap();

        assert_eq!(child.capacity(), parent.capacity());
        assert_eq!(parent.child_count().await.unwrap(), 1);

        for i in 0..10 {
            child.send(i).await.unwrap();
        }
        child.sender_wait_and_close().await.unwrap();
        assert_eq!(parent.child_count().await.unwrap(), 0);

        parent.sender_wait_and_close().await.unwrap();

        let received: Vec<u32> = seen.lock().unwrap().iter().map(|(_, m)| *m).collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parent_waits_for_slow_child() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 4);
        let parent = Channel::new(config);
        let child = parent.make_child_channel().await.unwrap();
        child.send(1).await.unwrap();

        let delay = Duration::from_millis(150);
        let started = Instant::now();
        let slow_child = child.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            slow_child.sender_wait_and_close().await.unwrap();
        });

        let mut states = parent.subscribe_state();
        let closer = parent.clone();
        let shutdown = tokio::spawn(async move { closer.sender_wait_and_close().await });

        // The parent's queue must stay open until the child is gone.
        states
            .wait_for(|s| *s != ChannelState::Running)
            .await
            .unwrap();
        assert!(started.elapsed() >= delay);
        assert_ne!(child.state(), ChannelState::Running);
        assert_eq!(parent.child_count().await.unwrap(), 0);

        shutdown.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1)]);
    }

    #[tokio::test]
    async fn test_shutdown_timeout_keeps_queue_open() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 4);
        let parent = Channel::new(config.with_shutdown_timeout(Duration::from_millis(50)));
        let child = parent.make_child_channel().await.unwrap();

        let err = parent.sender_wait_and_close().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(parent.state(), ChannelState::Running);
        assert_eq!(parent.child_count().await.unwrap(), 1);

        // Still usable after the timeout.
        parent.send(5).await.unwrap();
        child.sender_wait_and_close().await.unwrap();
        parent.sender_wait_and_close().await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 5)]);
    }

    #[tokio::test]
    async fn test_drain_callback_can_close_stragglers() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 4);
        let parent = Channel::new(config);
        let child = parent.make_child_channel().await.unwrap();
        child.send(9).await.unwrap();
        drop(child);

        parent
            .sender_wait_and_close_with(|children| {
                for straggler in children.values().cloned() {
                    tokio::spawn(async move { straggler.sender_wait_and_close().await });
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(1, 9)]);
    }

    #[tokio::test]
    async fn test_grandchildren_drain_bottom_up() {
        let ids = Arc::new(IdAllocator::new());
        let (config, seen) = recording_config(&ids, 2);
        let root = Channel::new(config);
        let child = root.make_child_channel().await.unwrap();
        let grandchild = child.make_child_channel().await.unwrap();

        grandchild.send(3).await.unwrap();
        child.send(2).await.unwrap();
        root.send(1).await.unwrap();

        let closers: Vec<_> = [root.clone(), child.clone(), grandchild.clone()]
            .into_iter()
            .map(|c| tokio::spawn(async move { c.sender_wait_and_close().await }))
            .collect();
        for closer in closers {
            closer.await.unwrap().unwrap();
        }

        let mut received: Vec<u32> = seen.lock().unwrap().iter().map(|(_, m)| *m).collect();
        received.sort();
        assert_eq!(received, vec![1, 2, 3]);
        assert!(root.is_closed() && child.is_closed() && grandchild.is_closed());
    }
}
