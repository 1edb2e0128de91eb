//! Session registry
//!
//! Table of live [`BoardSession`]s keyed by [`BoardIdentity`]. The table lock
//! is only held for lookups and inserts; each identity has its own slot mutex
//! which is held across the (blocking) hardware call, so two callers can never
//! hold sessions for the same board while distinct boards proceed in parallel.
//!
//! Lock order is slot → table. Nothing waits on a slot while holding the table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::board::{BoardDescriptor, BoardIdentity, DriverRegistry};
use crate::error::{RecordError, Result};
use crate::session::{read_status, BoardSession, BoardSessionState, BoardStatus, StatusHandle};

#[derive(Default)]
struct Slot {
    session: Option<BoardSession>,
    /// Set once the slot has been removed from the table
    retired: bool,
}

#[derive(Clone)]
struct Entry {
    slot: Arc<Mutex<Slot>>,
    status: StatusHandle,
}

/// Exclusive access to one identity's session
///
/// Holds the per-identity lock until dropped. While an operation runs the
/// lock travels with it onto the blocking thread, so dropping the awaiting
/// future never strands a half-finished transition.
pub struct SessionLease {
    identity: BoardIdentity,
    guard: Option<OwnedMutexGuard<Slot>>,
}

impl SessionLease {
    fn new(identity: &BoardIdentity, guard: OwnedMutexGuard<Slot>) -> Self {
        Self {
            identity: identity.clone(),
            guard: Some(guard),
        }
    }

    pub fn identity(&self) -> &BoardIdentity {
        &self.identity
    }

    fn session(&self) -> Option<&BoardSession> {
        self.guard.as_ref().and_then(|guard| guard.session.as_ref())
    }

    pub fn state(&self) -> BoardSessionState {
        self.session()
            .map(BoardSession::state)
            .unwrap_or(BoardSessionState::Disconnected)
    }

    pub fn status(&self) -> BoardStatus {
        self.session()
            .map(BoardSession::status)
            .unwrap_or_else(|| BoardStatus::not_connected(self.identity.board_name()))
    }

    /// Run a blocking operation on the session off the async worker threads
    ///
    /// The operation runs to completion and its session goes back into the
    /// slot even if the caller stops waiting.
    pub async fn run<T, F>(&mut self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut BoardSession) -> Result<T> + Send + 'static,
    {
        let mut guard = self.guard.take().ok_or_else(|| self.worker_lost("slot lock is gone"))?;

        let joined = tokio::task::spawn_blocking(move || {
            let result = guard.session.as_mut().map(op);
            (guard, result)
        })
        .await;

        match joined {
            Ok((guard, result)) => {
                self.guard = Some(guard);
                result.unwrap_or_else(|| Err(RecordError::NotRecording(self.identity.to_string())))
            }
            Err(e) => Err(self.worker_lost(e)),
        }
    }

    /// Drop the session held in the slot, if any
    fn clear(&mut self) {
        if let Some(guard) = self.guard.as_mut() {
            guard.session = None;
        }
    }

    fn worker_lost(&self, cause: impl std::fmt::Display) -> RecordError {
        RecordError::connection(self.identity.as_str(), format!("board worker failed: {cause}"))
    }
}

/// Process-wide table of board sessions
pub struct SessionRegistry {
    drivers: Arc<DriverRegistry>,
    entries: RwLock<HashMap<BoardIdentity, Entry>>,
}

impl SessionRegistry {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self {
            drivers: Arc::new(drivers),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Lease a connected session for `identity`, connecting one if needed
    ///
    /// Fails with `AlreadyRecording` if the identity is recording. A failed
    /// connect leaves no entry behind.
    pub async fn acquire(
        &self,
        identity: &BoardIdentity,
        descriptor: &BoardDescriptor,
    ) -> Result<SessionLease> {
        loop {
            let entry = self.entry_or_insert(identity).await;
            let mut guard = Arc::clone(&entry.slot).lock_owned().await;
            if guard.retired {
                // Released while we waited; look the identity up again
                continue;
            }

            let state = guard.session.as_ref().map(BoardSession::state);
            match state {
                Some(BoardSessionState::Recording) => {
                    return Err(RecordError::AlreadyRecording(identity.to_string()));
                }
                Some(BoardSessionState::Ready) => {
                    tracing::debug!("Reusing connected session for {}", identity);
                }
                Some(BoardSessionState::Disconnected) | None => {
                    let mut session = BoardSession::new(
                        identity.clone(),
                        descriptor.clone(),
                        Arc::clone(&entry.status),
                    );
                    let drivers = Arc::clone(&self.drivers);
                    let joined = tokio::task::spawn_blocking(move || {
                        let result = session.connect(&drivers);
                        if result.is_ok() {
                            guard.session = Some(session);
                        }
                        (guard, result)
                    })
                    .await;

                    guard = match joined {
                        Ok((guard, Ok(()))) => guard,
                        Ok((mut guard, Err(e))) => {
                            guard.session = None;
                            self.retire(identity, &entry, &mut guard).await;
                            return Err(e);
                        }
                        Err(e) => {
                            // The slot lock went down with the worker
                            self.drop_empty_entry(identity).await;
                            return Err(RecordError::connection(
                                identity.as_str(),
                                format!("board worker failed: {e}"),
                            ));
                        }
                    };
                }
            }

            return Ok(SessionLease::new(identity, guard));
        }
    }

    /// Lease the existing session for `identity`
    ///
    /// Fails with `NotRecording` when the identity has no session.
    pub async fn lease_existing(&self, identity: &BoardIdentity) -> Result<SessionLease> {
        let entry = self
            .entries
            .read()
            .await
            .get(identity)
            .cloned()
            .ok_or_else(|| RecordError::NotRecording(identity.to_string()))?;

        let guard = entry.slot.lock_owned().await;
        if guard.retired || guard.session.is_none() {
            return Err(RecordError::NotRecording(identity.to_string()));
        }
        Ok(SessionLease::new(identity, guard))
    }

    /// Disconnect and remove the session held by `lease`
    ///
    /// A recording session is left in place; returns whether the entry was removed.
    pub async fn release_leased(&self, mut lease: SessionLease) -> Result<bool> {
        if lease.state() == BoardSessionState::Recording {
            tracing::warn!(
                "Refusing to release {} while it is recording",
                lease.identity
            );
            return Ok(false);
        }

        let disconnected = if lease.session().is_some() {
            lease.run(|session| session.disconnect()).await
        } else {
            Ok(())
        };
        lease.clear();
        self.retire_leased(&mut lease).await;
        disconnected.map(|_| true)
    }

    /// Remove the entry for `identity`
    ///
    /// No-op when absent or recording; returns whether the entry was removed.
    pub async fn release(&self, identity: &BoardIdentity) -> Result<bool> {
        match self.lease_existing(identity).await {
            Ok(lease) => self.release_leased(lease).await,
            Err(RecordError::NotRecording(_)) => {
                // A slot may exist without a session after a failed worker
                self.drop_empty_entry(identity).await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Status snapshot; `None` when the identity has no entry
    ///
    /// Never waits on a slot, so it returns promptly during a slow start or stop.
    pub async fn status(&self, identity: &BoardIdentity) -> Option<BoardStatus> {
        self.entries
            .read()
            .await
            .get(identity)
            .map(|entry| read_status(&entry.status))
    }

    /// Status of every entry, sorted by identity
    pub async fn snapshot(&self) -> Vec<(BoardIdentity, BoardStatus)> {
        let entries = self.entries.read().await;
        let mut statuses: Vec<_> = entries
            .iter()
            .map(|(identity, entry)| (identity.clone(), read_status(&entry.status)))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Stop and disconnect every session and empty the table
    ///
    /// Every entry is torn down even if some fail; the first error is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let identities: Vec<BoardIdentity> = self.entries.read().await.keys().cloned().collect();
        let mut first_error = None;

        for identity in identities {
            let mut lease = match self.lease_existing(&identity).await {
                Ok(lease) => lease,
                Err(_) => {
                    self.drop_empty_entry(&identity).await;
                    continue;
                }
            };
            let disconnected = lease.run(|session| session.disconnect()).await;
            if let Err(e) = &disconnected {
                tracing::warn!("Shutdown of {} failed: {e}", identity);
            }
            lease.clear();
            self.retire_leased(&mut lease).await;
            if let (None, Err(e)) = (&first_error, disconnected) {
                first_error = Some(e);
            }
        }

        tracing::info!("Session registry shut down");
        first_error.map_or(Ok(()), Err)
    }

    async fn entry_or_insert(&self, identity: &BoardIdentity) -> Entry {
        if let Some(entry) = self.entries.read().await.get(identity) {
            return entry.clone();
        }
        self.entries
            .write()
            .await
            .entry(identity.clone())
            .or_insert_with(|| Entry {
                slot: Arc::new(Mutex::new(Slot::default())),
                status: Arc::new(StdRwLock::new(BoardStatus::not_connected(
                    identity.board_name(),
                ))),
            })
            .clone()
    }

    /// Mark the slot retired and remove it from the table, holding the slot lock
    async fn retire(&self, identity: &BoardIdentity, entry: &Entry, guard: &mut OwnedMutexGuard<Slot>) {
        guard.retired = true;
        let mut entries = self.entries.write().await;
        if let Some(current) = entries.get(identity) {
            if Arc::ptr_eq(&current.slot, &entry.slot) {
                entries.remove(identity);
                tracing::debug!("Removed registry entry for {}", identity);
            }
        }
    }

    async fn retire_leased(&self, lease: &mut SessionLease) {
        let identity = lease.identity.clone();
        let entry = self.entries.read().await.get(&identity).cloned();
        match (entry, lease.guard.as_mut()) {
            (Some(entry), Some(guard)) => self.retire(&identity, &entry, guard).await,
            (Some(_), None) => self.drop_empty_entry(&identity).await,
            (None, _) => {}
        }
    }

    async fn drop_empty_entry(&self, identity: &BoardIdentity) {
        let entry = match self.entries.read().await.get(identity).cloned() {
            Some(entry) => entry,
            None => return,
        };
        let mut guard = Arc::clone(&entry.slot).lock_owned().await;
        if !guard.retired && guard.session.is_none() {
            self.retire(identity, &entry, &mut guard).await;
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}
