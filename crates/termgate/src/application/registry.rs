//! Session registry: the process-wide table of live sessions.
//!
//! The registry is the only structure mutated from more than one session's
//! context, so every access goes through one `std::sync::Mutex`.  The lock is
//! never held across an `.await` or a blocking call.
//!
//! # Membership rule
//!
//! A session is in the table iff its state is not CLOSED.  The acceptor
//! registers a session before its handler starts; the handler unregisters it
//! immediately before moving to CLOSED.  [`SessionRegistry::unregister`] is
//! idempotent so concurrent close triggers cannot double-remove.
//!
//! # Shutdown
//!
//! ```text
//! broadcast_close()        refuse new sessions, wake every shutdown Notify
//! wait_until_empty(d)      handlers close themselves and unregister
//! force_release_all()      stragglers: stop bridge, abort task, remove entry
//! release_liveness_marker  delete the PID file exactly once
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use termgate_core::{SessionId, SessionState};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use super::bridge::BridgeStopper;
use super::liveness::{LivenessError, LivenessMarker};

/// Why [`SessionRegistry::try_register`] refused a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("session limit of {limit} reached")]
    Full { limit: usize },
    #[error("server is shutting down")]
    ShuttingDown,
}

/// A point-in-time view of one registered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub state: SessionState,
}

struct SessionEntry {
    peer: SocketAddr,
    state: SessionState,
    shutdown: Arc<Notify>,
    bridge: Option<BridgeStopper>,
    task: Option<AbortHandle>,
}

/// Process-wide table mapping session id to session bookkeeping.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    /// Signalled after every removal; used by [`Self::wait_until_empty`].
    changed: Notify,
    /// Set by the first broadcast; only read or written under the table lock.
    closing: AtomicBool,
    liveness: Mutex<Option<LivenessMarker>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that owns `marker` and removes it on
    /// [`release_liveness_marker`](Self::release_liveness_marker).
    pub fn with_liveness_marker(marker: LivenessMarker) -> Self {
        Self {
            liveness: Mutex::new(Some(marker)),
            ..Self::default()
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new session in state INIT, unless `limit` sessions are
    /// already registered.
    ///
    /// Returns the session's shutdown signal; the handler must listen on it.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError::Full`] when the table already holds `limit`
    /// entries and [`RegisterError::ShuttingDown`] once
    /// [`broadcast_close`](Self::broadcast_close) has run.
    pub fn try_register(
        &self,
        id: SessionId,
        peer: SocketAddr,
        limit: usize,
    ) -> Result<Arc<Notify>, RegisterError> {
        let table = self.table();
        if self.closing.load(Ordering::Relaxed) {
            return Err(RegisterError::ShuttingDown);
        }
        if table.len() >= limit {
            return Err(RegisterError::Full { limit });
        }
        Ok(self.insert(table, id, peer))
    }

    /// Registers without a cap.  After a broadcast the returned signal is
    /// already notified.
    pub fn register(&self, id: SessionId, peer: SocketAddr) -> Arc<Notify> {
        self.insert(self.table(), id, peer)
    }

    fn insert(
        &self,
        mut table: MutexGuard<'_, HashMap<SessionId, SessionEntry>>,
        id: SessionId,
        peer: SocketAddr,
    ) -> Arc<Notify> {
        let shutdown = Arc::new(Notify::new());
        if self.closing.load(Ordering::Relaxed) {
            shutdown.notify_one();
        }
        table.insert(
            id,
            SessionEntry {
                peer,
                state: SessionState::Init,
                shutdown: Arc::clone(&shutdown),
                bridge: None,
                task: None,
            },
        );
        let active = table.len();
        drop(table);

        info!("session {id}: registered from {peer} ({active} active)");
        shutdown
    }

    /// Records the task running the session's handler, for force release.
    pub fn set_task(&self, id: SessionId, task: AbortHandle) {
        if let Some(entry) = self.table().get_mut(&id) {
            entry.task = Some(task);
        }
    }

    /// Mirrors the handler's state.  A no-op for unknown ids.
    pub fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(entry) = self.table().get_mut(&id) {
            entry.state = state;
        }
    }

    /// Records the session's bridge so shutdown can stop it from outside.
    pub fn attach_bridge(&self, id: SessionId, bridge: BridgeStopper) {
        if let Some(entry) = self.table().get_mut(&id) {
            entry.bridge = Some(bridge);
        }
    }

    /// Removes a session.  Returns `false` (and logs nothing) if it was not
    /// registered.
    pub fn unregister(&self, id: SessionId) -> bool {
        let mut table = self.table();
        let removed = table.remove(&id).is_some();
        let active = table.len();
        drop(table);

        if removed {
            info!("session {id}: unregistered ({active} active)");
            self.changed.notify_waiters();
        }
        removed
    }

    /// Returns a snapshot of every registered session, ordered by id.
    pub fn enumerate(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .table()
            .iter()
            .map(|(id, entry)| SessionSummary {
                id: *id,
                peer: entry.peer,
                state: entry.state,
            })
            .collect();
        list.sort_by_key(|s| s.id);
        list
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Asks every registered session to close and refuses new ones from now
    /// on.  Returns how many were asked.
    ///
    /// Uses `notify_one`, which stores a permit, so a handler that is busy
    /// when the broadcast happens still sees it on its next wait.
    pub fn broadcast_close(&self) -> usize {
        let table = self.table();
        self.closing.store(true, Ordering::Relaxed);
        for entry in table.values() {
            entry.shutdown.notify_one();
        }
        table.len()
    }

    /// Waits until the table is empty or `timeout` elapses.
    ///
    /// Returns `true` if the table emptied in time.
    pub async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            // Register interest before checking, so a removal in between is
            // not missed.
            changed.as_mut().enable();

            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.is_empty();
            }
        }
    }

    /// Forcibly terminates every remaining session: stops its bridge, aborts
    /// its handler task and removes it.  Returns how many were released.
    pub fn force_release_all(&self) -> usize {
        let drained: Vec<(SessionId, SessionEntry)> = self.table().drain().collect();
        for (id, entry) in &drained {
            warn!(
                "session {id}: force-released in state {} (peer {})",
                entry.state, entry.peer
            );
            if let Some(bridge) = &entry.bridge {
                bridge.stop();
            }
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
        if !drained.is_empty() {
            self.changed.notify_waiters();
        }
        drained.len()
    }

    /// Removes the liveness marker.  Only the first call does anything;
    /// returns whether this call removed it.
    ///
    /// # Errors
    ///
    /// Returns [`LivenessError`] if the file exists but cannot be deleted.
    pub fn release_liveness_marker(&self) -> Result<bool, LivenessError> {
        let marker = self
            .liveness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match marker {
            Some(marker) => marker.remove().map(|()| true),
            None => Ok(false),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
