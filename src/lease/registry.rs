//! The lease registry: sole owner of active curses.
//!
//! # Locking
//!
//! Two levels of locking keep the registry consistent without holding a lock
//! across store I/O:
//!
//! - `active` is a plain mutex around the map of active leases. It is only
//!   held for in-memory reads and writes, never across an `.await`.
//! - every subject has an async gate. `curse`, `release` and the expiration
//!   path for one subject run one at a time behind it, including their store
//!   calls. Different subjects never wait on each other.
//!
//! `transfer` holds the gates of both subjects, always taken in ascending
//! subject order, so it cannot deadlock against another transfer.
//!
//! Expiration and release race through compare-and-clear: an expiration only
//! clears the entry whose ticket matches the deadline it was armed with, and
//! release disarms that ticket. Whichever gets the gate first wins; the other
//! finds nothing to do.

use std::collections::hash_map::Entry as MapEntry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::{JoinError, JoinSet};

use super::scheduler::{Deadline, ExpirationScheduler, Ticket};
use super::{Clock, LeaseResult, LeaseStore, StoreError, SystemClock, ValidationError};
use crate::config::{ConfigError, LeaseConfig};
use crate::models::{validate_subject, CurseOutcome, Lease, LeaseStatus, ReleaseReason};
use crate::notify::NotificationSink;

#[derive(Debug, Clone)]
struct ActiveLease {
    lease: Lease,
    ticket: Ticket,
}

pub struct LeaseRegistry {
    config: LeaseConfig,
    store: Arc<dyn LeaseStore>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    scheduler: ExpirationScheduler,
    active: Mutex<HashMap<String, ActiveLease>>,
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_ticket: AtomicU64,
}

/// Held while a subject is being mutated. Drops the gate from the map once
/// nobody else is waiting on it.
struct SubjectLock<'a> {
    gates: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    subject_id: String,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SubjectLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut gates = self.gates.lock().expect("gate lock poisoned");
        // One reference in the map, one here: nobody else holds or waits.
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.subject_id);
        }
    }
}

impl LeaseRegistry {
    pub fn new(
        config: LeaseConfig,
        store: Arc<dyn LeaseStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, store, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: LeaseConfig,
        store: Arc<dyn LeaseStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            scheduler: ExpirationScheduler::new(config.tick_interval()),
            config,
            store,
            sink,
            clock,
            active: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Rebuild the registry from the store.
    ///
    /// Every lease is armed, including ones whose end has already passed;
    /// those expire on the next tick. When the store holds several leases for
    /// one subject, the one ending last wins and the rest are deleted.
    pub async fn bootstrap(&self) -> LeaseResult<usize> {
        let leases = self.store_call("list", |store| store.list()).await?;

        let mut latest: HashMap<String, Lease> = HashMap::new();
        let mut duplicates = Vec::new();
        for lease in leases {
            match latest.entry(lease.subject_id.clone()) {
                MapEntry::Vacant(slot) => {
                    slot.insert(lease);
                }
                MapEntry::Occupied(mut slot) => {
                    if lease.end > slot.get().end {
                        duplicates.push(slot.insert(lease));
                    } else {
                        duplicates.push(lease);
                    }
                }
            }
        }

        for duplicate in duplicates {
            tracing::warn!(
                subject_id = %duplicate.subject_id,
                "dropping duplicate stored lease"
            );
            let subject_id = duplicate.subject_id.clone();
            if let Err(e) = self
                .store_call("remove", move |store| store.remove(&duplicate))
                .await
            {
                tracing::warn!(subject_id = %subject_id, "failed to remove duplicate lease: {}", e);
            }
        }

        let mut loaded = 0;
        for (subject_id, lease) in latest {
            let ticket = self.next_ticket();
            let end = lease.end;
            {
                let mut active = self.active.lock().expect("registry lock poisoned");
                if active.contains_key(&subject_id) {
                    continue;
                }
                active.insert(subject_id.clone(), ActiveLease { lease, ticket });
            }
            self.scheduler.arm(ticket, subject_id, end);
            loaded += 1;
        }

        tracing::info!(loaded, "restored leases from store");
        Ok(loaded)
    }

    pub fn is_active(&self, subject_id: &str) -> bool {
        self.active
            .lock()
            .expect("registry lock poisoned")
            .contains_key(subject_id)
    }

    /// Curse a subject, or remind it if it is already cursed.
    pub async fn curse(&self, subject_id: &str) -> LeaseResult<CurseOutcome> {
        validate_subject(subject_id)?;
        let _lock = self.lock_subject(subject_id).await;
        self.curse_locked(subject_id).await
    }

    /// Body of [`curse`](Self::curse). The caller holds the subject's gate.
    async fn curse_locked(&self, subject_id: &str) -> LeaseResult<CurseOutcome> {
        if let Some(status) = self.get(subject_id) {
            self.sink.on_reminder(subject_id, status.remaining_days);
            return Ok(CurseOutcome::Reminded {
                lease: status.lease,
                remaining_days: status.remaining_days,
            });
        }

        let lease = Lease::new(subject_id, self.clock.now(), self.config.duration())?;
        let stored = match self
            .store_call("add", move |store| store.add(&lease))
            .await
        {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(subject_id, "failed to persist lease: {}", e);
                return Err(e.into());
            }
        };

        let ticket = self.next_ticket();
        self.active.lock().expect("registry lock poisoned").insert(
            subject_id.to_string(),
            ActiveLease {
                lease: stored.clone(),
                ticket,
            },
        );
        self.scheduler.arm(ticket, subject_id, stored.end);

        tracing::debug!(subject_id, end = %stored.end, "lease created");
        self.sink.on_cursed(subject_id, self.config.duration_days());
        Ok(CurseOutcome::Cursed { lease: stored })
    }

    /// Tell a cursed subject how long it has left. `None` if not cursed.
    pub fn remind(&self, subject_id: &str) -> LeaseResult<Option<u32>> {
        validate_subject(subject_id)?;
        let remaining = self.remaining_days(subject_id);
        if let Some(days) = remaining {
            self.sink.on_reminder(subject_id, days);
        }
        Ok(remaining)
    }

    /// Days left on the subject's lease, rounded up. A lease that is past
    /// due but not yet swept reports zero.
    pub fn remaining_days(&self, subject_id: &str) -> Option<u32> {
        self.get(subject_id).map(|status| status.remaining_days)
    }

    pub fn get(&self, subject_id: &str) -> Option<LeaseStatus> {
        let now = self.clock.now();
        self.active
            .lock()
            .expect("registry lock poisoned")
            .get(subject_id)
            .map(|entry| LeaseStatus {
                remaining_days: entry.lease.remaining_days_at(now),
                lease: entry.lease.clone(),
            })
    }

    /// Every active lease, soonest end first.
    pub fn active_leases(&self) -> Vec<LeaseStatus> {
        let now = self.clock.now();
        let mut leases: Vec<LeaseStatus> = self
            .active
            .lock()
            .expect("registry lock poisoned")
            .values()
            .map(|entry| LeaseStatus {
                remaining_days: entry.lease.remaining_days_at(now),
                lease: entry.lease.clone(),
            })
            .collect();
        leases.sort_by(|a, b| a.lease.end.cmp(&b.lease.end));
        leases
    }

    /// Number of leases waiting to expire.
    pub fn pending_expirations(&self) -> usize {
        self.scheduler.armed()
    }

    /// End a subject's lease early (or as expired, for administrative use).
    ///
    /// Returns `Ok(None)` if the subject was not cursed. If the store delete
    /// fails the lease is still gone from the registry and the event is still
    /// emitted; the store error is returned so the caller can report it.
    pub async fn release(
        &self,
        subject_id: &str,
        reason: ReleaseReason,
    ) -> LeaseResult<Option<Lease>> {
        validate_subject(subject_id)?;
        let _lock = self.lock_subject(subject_id).await;
        self.release_locked(subject_id, reason).await
    }

    /// Body of [`release`](Self::release). The caller holds the subject's gate.
    async fn release_locked(
        &self,
        subject_id: &str,
        reason: ReleaseReason,
    ) -> LeaseResult<Option<Lease>> {
        let removed = self
            .active
            .lock()
            .expect("registry lock poisoned")
            .remove(subject_id);
        let Some(entry) = removed else {
            tracing::debug!(subject_id, "release of uncursed subject ignored");
            return Ok(None);
        };
        self.scheduler.disarm(entry.ticket);

        let lease = entry.lease;
        let stored = lease.clone();
        let result = self
            .store_call("remove", move |store| store.remove(&stored))
            .await;
        if let Err(e) = &result {
            tracing::error!(subject_id, "failed to delete released lease: {}", e);
        }

        tracing::debug!(subject_id, reason = reason.as_str(), "lease released");
        self.emit_release(subject_id, reason);
        result.map(|()| Some(lease)).map_err(Into::into)
    }

    /// Atone by passing the curse on: `to` is cursed, then `from` is released.
    ///
    /// Both gates are held throughout, so `from` cannot expire, be released
    /// or be transferred again in between. If cursing `to` fails, `from`
    /// keeps its curse. If `to` is already cursed it only gets a reminder,
    /// and `from` is still released.
    pub async fn transfer(&self, from: &str, to: &str) -> LeaseResult<CurseOutcome> {
        validate_subject(from)?;
        validate_subject(to)?;
        if from == to {
            return Err(ValidationError::SameSubject.into());
        }
        let _locks = self.lock_pair(from, to).await;
        if !self.is_active(from) {
            return Err(ValidationError::NotCursed(from.to_string()).into());
        }

        let outcome = self.curse_locked(to).await?;
        self.release_locked(from, ReleaseReason::Atoned).await?;
        tracing::info!(from, to, "curse transferred");
        Ok(outcome)
    }

    /// Run one expiration pass and wait for it. Returns how many leases expired.
    pub async fn tick(self: &Arc<Self>) -> usize {
        let mut expirations = JoinSet::new();
        self.spawn_due(&mut expirations);

        let mut expired = 0;
        while let Some(result) = expirations.join_next().await {
            if finished(result) {
                expired += 1;
            }
        }
        expired
    }

    /// Expire leases as their deadlines pass, until `shutdown` completes.
    ///
    /// Expirations run as their own tasks so a slow store delete does not
    /// hold up the next pass. On shutdown the loop waits for the ones still
    /// in flight, so none is cut off between clearing the registry and
    /// deleting the stored lease.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        tracing::info!(
            tick_secs = self.scheduler.tick_interval().as_secs(),
            "expiration loop started"
        );

        let mut expirations = JoinSet::new();
        loop {
            self.spawn_due(&mut expirations);

            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.scheduler.wait(self.clock.now()) => {}
                Some(result) = expirations.join_next(), if !expirations.is_empty() => {
                    finished(result);
                }
            }
        }

        let in_flight = expirations.len();
        if in_flight > 0 {
            tracing::info!(in_flight, "waiting for expirations to finish");
        }
        while let Some(result) = expirations.join_next().await {
            finished(result);
        }
        tracing::info!("expiration loop stopped");
    }

    fn spawn_due(self: &Arc<Self>, expirations: &mut JoinSet<bool>) {
        for deadline in self.scheduler.due(self.clock.now()) {
            let registry = Arc::clone(self);
            expirations.spawn(async move { registry.expire(deadline).await });
        }
    }

    /// Expiration path. Returns false when the lease was already released.
    async fn expire(&self, deadline: Deadline) -> bool {
        let subject_id = deadline.subject_id.as_str();
        let _lock = self.lock_subject(subject_id).await;

        let removed = {
            let mut active = self.active.lock().expect("registry lock poisoned");
            match active.get(subject_id) {
                Some(entry) if entry.ticket == deadline.ticket => active.remove(subject_id),
                _ => None,
            }
        };
        let Some(entry) = removed else {
            tracing::debug!(subject_id, "lease already released, skipping expiration");
            return false;
        };

        let lease = entry.lease;
        if let Err(e) = self
            .store_call("remove", move |store| store.remove(&lease))
            .await
        {
            tracing::error!(subject_id, "failed to delete expired lease: {}", e);
        }

        self.emit_release(subject_id, ReleaseReason::Expired);
        true
    }

    fn emit_release(&self, subject_id: &str, reason: ReleaseReason) {
        match reason {
            ReleaseReason::Expired => self.sink.on_expired(subject_id),
            ReleaseReason::Atoned => self.sink.on_atoned(subject_id),
        }
    }

    fn next_ticket(&self) -> Ticket {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    /// Take two subjects' gates in ascending subject order.
    async fn lock_pair(&self, a: &str, b: &str) -> (SubjectLock<'_>, SubjectLock<'_>) {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let first = self.lock_subject(first).await;
        let second = self.lock_subject(second).await;
        (first, second)
    }

    async fn lock_subject(&self, subject_id: &str) -> SubjectLock<'_> {
        let gate = self
            .gates
            .lock()
            .expect("gate lock poisoned")
            .entry(subject_id.to_string())
            .or_default()
            .clone();
        let guard = gate.clone().lock_owned().await;
        SubjectLock {
            gates: &self.gates,
            subject_id: subject_id.to_string(),
            gate,
            guard: Some(guard),
        }
    }

    /// Run a store call on the blocking pool, retrying with backoff.
    async fn store_call<T, F>(&self, op: &'static str, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&dyn LeaseStore) -> Result<T, StoreError> + Clone + Send + 'static,
    {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            let store = Arc::clone(&self.store);
            let call = call.clone();
            let result = tokio::task::spawn_blocking(move || call(store.as_ref()))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt < retry.attempts => {
                    let backoff = retry.backoff(attempt);
                    tracing::warn!(
                        op,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "store call failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an expiration task expired a lease. Panicked tasks are logged.
fn finished(result: Result<bool, JoinError>) -> bool {
    match result {
        Ok(expired) => expired,
        Err(e) => {
            tracing::error!("expiration task failed: {}", e);
            false
        }
    }
}
