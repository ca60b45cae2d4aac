use signal_common::Handle;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// A listening connection waiting to be claimed.
#[derive(Debug)]
pub struct PendingEntry<C> {
    /// The upgraded connection, owned by the entry until it is removed.
    pub conn: C,
    /// Instant after which the sweeper evicts the entry.
    pub deadline: Instant,
}

impl<C> PendingEntry<C> {
    /// Wraps `conn` with an absolute deadline.
    pub fn new(conn: C, deadline: Instant) -> Self {
        Self { conn, deadline }
    }

    /// Returns `true` if the deadline is at or before `now`.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// The handle was already pending. Carries back the rejected entry.
#[derive(Debug)]
pub struct Conflict<C>(pub PendingEntry<C>);

/// Handle → pending connection table.
///
/// Every operation runs under one mutex, so callers never observe a partial
/// view and two operations on the same handle are always serialized.
#[derive(Debug)]
pub struct Registry<C> {
    pending: Mutex<HashMap<Handle, PendingEntry<C>>>,
}

impl<C> Registry<C> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Handle, PendingEntry<C>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an entry unless the handle is already pending.
    ///
    /// # Errors
    ///
    /// Returns [`Conflict`] with the rejected entry if `handle` is present.
    pub fn insert(&self, handle: Handle, entry: PendingEntry<C>) -> Result<(), Conflict<C>> {
        use std::collections::hash_map::Entry;
        match self.lock().entry(handle) {
            Entry::Occupied(_) => Err(Conflict(entry)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    /// Remove and return the entry for `handle`.
    ///
    /// This is the only way an entry leaves the table for pairing, so of any
    /// number of racing claims exactly one gets `Some`.
    #[must_use]
    pub fn claim(&self, handle: &Handle) -> Option<PendingEntry<C>> {
        self.lock().remove(handle)
    }

    /// Put back an entry previously returned by [`claim`](Self::claim).
    ///
    /// If the handle was listened on again in the meantime, the newer entry
    /// keeps the slot and the restored one is handed back to the caller.
    #[must_use]
    pub fn restore(&self, handle: Handle, entry: PendingEntry<C>) -> Option<PendingEntry<C>> {
        self.insert(handle, entry).err().map(|Conflict(entry)| entry)
    }

    /// Remove and return every entry whose deadline is at or before `now`.
    #[must_use]
    pub fn sweep(&self, now: Instant) -> Vec<(Handle, PendingEntry<C>)> {
        let mut pending = self.lock();
        let expired: Vec<Handle> = pending
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(handle, _)| handle.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|handle| pending.remove(&handle).map(|entry| (handle, entry)))
            .collect()
    }

    /// Returns `true` if `handle` is pending.
    #[must_use]
    pub fn contains(&self, handle: &Handle) -> bool {
        self.lock().contains_key(handle)
    }

    /// Number of pending handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}
