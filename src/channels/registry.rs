//! Lock-guarded registry of a channel's live children.
//!
//! Every access to the id -> child mapping goes through [`Registry::run`], so
//! readers never observe a partially-updated map and mutations never
//! interleave. Each operation can be bounded by a lock deadline; the guard is
//! released on every path, including callback errors and timeouts.
//!
//! ```text
//! make_child_channel  --> set(child_id, child)
//! child drained       --> remove(child_id)         (notifies when empty)
//! parent shutdown     --> block_until_empty(...)   (wake on empty or poll tick)
//! ```

use std::collections::HashMap;
use std::pin::pin;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::channels::channel::Channel;
use crate::channels::id::ChannelId;
use crate::error::RegistryError;

/// The mapping guarded by a [`Registry`].
pub type ChildMap<M> = HashMap<ChannelId, Channel<M>>;

/// Thread-safe mapping from child id to child channel handle.
pub struct Registry<M> {
    entries: Mutex<ChildMap<M>>,
    /// Signalled whenever an operation leaves the mapping empty.
    emptied: Notify,
    /// Default deadline for acquiring the lock.
    lock_timeout: Option<Duration>,
}

impl<M: Send + 'static> Registry<M> {
    /// Create an empty registry. `lock_timeout` bounds every lock acquisition
    /// made through the non-`_within` operations.
    pub fn new(lock_timeout: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            emptied: Notify::new(),
            lock_timeout,
        }
    }

    /// Execute `f` against the mapping under mutual exclusion.
    ///
    /// Errors returned by `f` are passed through to the caller unchanged.
    pub async fn run<R, F>(&self, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut ChildMap<M>) -> Result<R, RegistryError>,
    {
        self.run_named("run", self.lock_timeout, f).await
    }

    /// Like [`run`](Self::run) with an explicit lock deadline (`None` waits
    /// indefinitely).
    pub async fn run_within<R, F>(&self, limit: Option<Duration>, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut ChildMap<M>) -> Result<R, RegistryError>,
    {
        self.run_named("run", limit, f).await
    }

    /// Insert a child, returning the entry it replaced.
    pub async fn set(
        &self,
        id: ChannelId,
        channel: Channel<M>,
    ) -> Result<Option<Channel<M>>, RegistryError> {
        self.run_named("set", self.lock_timeout, |entries| {
            Ok(entries.insert(id, channel))
        })
        .await
    }

    /// Remove a child, returning it if it was present.
    pub async fn remove(&self, id: ChannelId) -> Result<Option<Channel<M>>, RegistryError> {
        self.run_named("remove", self.lock_timeout, |entries| Ok(entries.remove(&id)))
            .await
    }

    /// Remove a child, waiting for the lock however long it takes.
    pub(crate) async fn remove_unbounded(&self, id: ChannelId) -> Option<Channel<M>> {
        let mut entries = self.entries.lock().await;
        let removed = entries.remove(&id);
        if entries.is_empty() {
            self.emptied.notify_waiters();
        }
        removed
    }

    /// Number of live children.
    pub async fn size(&self) -> Result<usize, RegistryError> {
        self.run_named("size", self.lock_timeout, |entries| Ok(entries.len()))
            .await
    }

    /// Snapshot of the live children, in no particular order.
    pub async fn children(&self) -> Result<Vec<Channel<M>>, RegistryError> {
        self.run_named("children", self.lock_timeout, |entries| {
            Ok(entries.values().cloned().collect())
        })
        .await
    }

    /// Wait until the registry is empty.
    ///
    /// See [`block_until_empty_with`](Self::block_until_empty_with).
    pub async fn block_until_empty(
        &self,
        poll_interval: Duration,
        deadline: Option<Duration>,
    ) -> Result<(), RegistryError> {
        self.block_until_empty_with(|_| Ok(()), poll_interval, deadline)
            .await
    }

    /// Wait until the registry is empty, invoking `drain` with the live
    /// children on every check that finds the map non-empty.
    ///
    /// Returns immediately when the map is already empty. Otherwise the wait
    /// wakes as soon as a removal empties the map, and at least every
    /// `poll_interval` so that `drain` observes stragglers. `deadline` bounds
    /// the whole wait; on expiry the registry is left untouched and
    /// [`RegistryError::Timeout`] is returned.
    pub async fn block_until_empty_with<F>(
        &self,
        mut drain: F,
        poll_interval: Duration,
        deadline: Option<Duration>,
    ) -> Result<(), RegistryError>
    where
        F: FnMut(&ChildMap<M>) -> Result<(), RegistryError> + Send,
    {
        let wait = self.wait_for_empty(&mut drain, poll_interval);
        match deadline {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                RegistryError::Timeout {
                    operation: "block_until_empty",
                    after: limit,
                }
            })?,
            None => wait.await,
        }
    }

    async fn wait_for_empty<F>(
        &self,
        drain: &mut F,
        poll_interval: Duration,
    ) -> Result<(), RegistryError>
    where
        F: FnMut(&ChildMap<M>) -> Result<(), RegistryError> + Send,
    {
        loop {
            // Register interest before looking, so a removal between the
            // check and the sleep still wakes us.
            let mut emptied = pin!(self.emptied.notified());
            emptied.as_mut().enable();

            {
                let entries = self
                    .lock("block_until_empty", self.lock_timeout)
                    .await?;
                if entries.is_empty() {
                    return Ok(());
                }
                tracing::trace!(children = entries.len(), "Waiting for child channels");
                drain(&*entries)?;
            }

            tokio::select! {
                _ = &mut emptied => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn run_named<R, F>(
        &self,
        operation: &'static str,
        limit: Option<Duration>,
        f: F,
    ) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut ChildMap<M>) -> Result<R, RegistryError>,
    {
        let mut entries = self.lock(operation, limit).await?;
        let result = f(&mut *entries);
        if entries.is_empty() {
            self.emptied.notify_waiters();
        }
        result
    }

    async fn lock(
        &self,
        operation: &'static str,
        limit: Option<Duration>,
    ) -> Result<MutexGuard<'_, ChildMap<M>>, RegistryError> {
        match limit {
            Some(after) => tokio::time::timeout(after, self.entries.lock())
                .await
                .map_err(|_| RegistryError::Timeout { operation, after }),
            None => Ok(self.entries.lock().await),
        }
    }
}

impl<M: Send + 'static> Default for Registry<M> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<M> std::fmt::Debug for Registry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
