use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use uuid::Uuid;

use super::StoreError;
use crate::models::Lease;

/// Durable home of leases.
///
/// The store is the source of truth across restarts; the registry reads it
/// once with [`list`](Self::list) and then keeps it in step with every
/// curse and release. Calls may block: the registry always runs them on the
/// blocking pool.
pub trait LeaseStore: Send + Sync + 'static {
    /// Persist a new lease and return it with its id assigned.
    fn add(&self, lease: &Lease) -> Result<Lease, StoreError>;

    /// Every persisted lease.
    fn list(&self) -> Result<Vec<Lease>, StoreError>;

    /// Delete a lease. Removing a lease that is already gone is not an error.
    fn remove(&self, lease: &Lease) -> Result<(), StoreError>;
}

/// In-process store, mostly for tests.
///
/// Failures can be injected one call at a time to exercise the registry's
/// rollback and best-effort removal paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    leases: Mutex<HashMap<Uuid, Lease>>,
    adds: AtomicUsize,
    removes: AtomicUsize,
    fail_adds: AtomicUsize,
    fail_removes: AtomicUsize,
    fail_list: AtomicBool,
    remove_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from leases that were persisted by an earlier process.
    pub fn with_leases(leases: impl IntoIterator<Item = Lease>) -> Self {
        let store = Self::new();
        {
            let mut map = store.leases.lock().expect("store lock poisoned");
            for lease in leases {
                let id = lease.id.unwrap_or_else(Uuid::new_v4);
                map.insert(id, lease.with_id(id));
            }
        }
        store
    }

    /// Fail the next `n` calls to `add`.
    pub fn fail_next_adds(&self, n: usize) {
        self.fail_adds.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `remove`.
    pub fn fail_next_removes(&self, n: usize) {
        self.fail_removes.store(n, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Make every `remove` block for `delay` before touching the map.
    pub fn delay_removes(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.remove_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of successful `add` calls.
    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    /// Number of `remove` calls that deleted a row.
    pub fn remove_count(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.leases.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_subject(&self, subject_id: &str) -> bool {
        self.leases
            .lock()
            .expect("store lock poisoned")
            .values()
            .any(|l| l.subject_id == subject_id)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl LeaseStore for MemoryStore {
    fn add(&self, lease: &Lease) -> Result<Lease, StoreError> {
        if Self::take_failure(&self.fail_adds) {
            return Err(StoreError::Unavailable("injected add failure".into()));
        }
        let id = Uuid::new_v4();
        let stored = lease.clone().with_id(id);
        self.leases
            .lock()
            .expect("store lock poisoned")
            .insert(id, stored.clone());
        self.adds.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<Lease>, StoreError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected list failure".into()));
        }
        let mut leases: Vec<Lease> = self
            .leases
            .lock()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect();
        leases.sort_by(|a, b| a.end.cmp(&b.end));
        Ok(leases)
    }

    fn remove(&self, lease: &Lease) -> Result<(), StoreError> {
        if Self::take_failure(&self.fail_removes) {
            return Err(StoreError::Unavailable("injected remove failure".into()));
        }
        let delay = self.remove_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let Some(id) = lease.id else {
            return Ok(());
        };
        if self
            .leases
            .lock()
            .expect("store lock poisoned")
            .remove(&id)
            .is_some()
        {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
