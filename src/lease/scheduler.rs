//! Expiry-ordered queue of armed leases.
//!
//! One queue and one wake-up loop serve every lease: the loop sleeps until
//! the soonest deadline (or at most one tick interval) and then asks the
//! queue which leases are due. Each armed lease instance carries a ticket;
//! disarming a ticket is O(1) and stale queue entries are dropped when they
//! reach the front.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Scheduler identity of one armed lease instance.
pub type Ticket = u64;

/// A lease waiting for its end.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    pub end: DateTime<Utc>,
    pub ticket: Ticket,
    pub subject_id: String,
}

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Deadline>>,
    armed: HashSet<Ticket>,
}

impl Queue {
    /// Drop cancelled entries sitting at the front.
    fn prune(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.armed.contains(&top.ticket) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[derive(Debug)]
pub struct ExpirationScheduler {
    queue: Mutex<Queue>,
    wake: Notify,
    tick_interval: Duration,
}

impl ExpirationScheduler {
    pub fn new(tick_interval: Duration) -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            tick_interval,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Start watching a lease instance. Past deadlines are due on the next pass.
    pub fn arm(&self, ticket: Ticket, subject_id: impl Into<String>, end: DateTime<Utc>) {
        {
            let mut queue = self.queue.lock().expect("scheduler lock poisoned");
            if !queue.armed.insert(ticket) {
                return;
            }
            queue.heap.push(Reverse(Deadline {
                end,
                ticket,
                subject_id: subject_id.into(),
            }));
        }
        self.wake.notify_one();
    }

    /// Stop watching a ticket. Returns false if it was not armed, either
    /// because it already fired or was disarmed before.
    pub fn disarm(&self, ticket: Ticket) -> bool {
        self.queue
            .lock()
            .expect("scheduler lock poisoned")
            .armed
            .remove(&ticket)
    }

    pub fn is_armed(&self, ticket: Ticket) -> bool {
        self.queue
            .lock()
            .expect("scheduler lock poisoned")
            .armed
            .contains(&ticket)
    }

    /// Number of armed tickets.
    pub fn armed(&self) -> usize {
        self.queue.lock().expect("scheduler lock poisoned").armed.len()
    }

    /// Take every armed deadline with `end <= now`, soonest first.
    ///
    /// Returned tickets are disarmed, so each one is handed out at most once.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Deadline> {
        let mut queue = self.queue.lock().expect("scheduler lock poisoned");
        let mut due = Vec::new();
        while let Some(Reverse(top)) = queue.heap.peek() {
            if top.end > now {
                break;
            }
            let Some(Reverse(deadline)) = queue.heap.pop() else {
                break;
            };
            if queue.armed.remove(&deadline.ticket) {
                due.push(deadline);
            }
        }
        queue.prune();
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let mut queue = self.queue.lock().expect("scheduler lock poisoned");
        queue.prune();
        queue.heap.peek().map(|Reverse(d)| d.end)
    }

    /// How long the loop may sleep: until the next deadline, never longer
    /// than one tick interval.
    pub fn sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        match self.next_deadline() {
            Some(end) => (end - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.tick_interval),
            None => self.tick_interval,
        }
    }

    /// Sleep for [`sleep_duration`](Self::sleep_duration), returning early
    /// when a new lease is armed.
    pub async fn wait(&self, now: DateTime<Utc>) {
        let sleep = self.sleep_duration(now);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = self.wake.notified() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn scheduler() -> ExpirationScheduler {
        ExpirationScheduler::new(Duration::from_secs(60))
    }

    #[test]
    fn due_returns_only_passed_deadlines_in_order() {
        let s = scheduler();
        s.arm(1, "late", t0() + ChronoDuration::days(2));
        s.arm(2, "early", t0() + ChronoDuration::days(1));
        s.arm(3, "future", t0() + ChronoDuration::days(9));

        let due = s.due(t0() + ChronoDuration::days(3));

        let subjects: Vec<_> = due.iter().map(|d| d.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["early", "late"]);
        assert_eq!(s.armed(), 1);
    }

    #[test]
    fn due_hands_out_each_ticket_once() {
        let s = scheduler();
        s.arm(1, "alice", t0());

        assert_eq!(s.due(t0()).len(), 1);
        assert!(s.due(t0() + ChronoDuration::days(1)).is_empty());
        assert!(!s.is_armed(1));
    }

    #[test]
    fn disarmed_ticket_never_fires() {
        let s = scheduler();
        s.arm(1, "alice", t0());

        assert!(s.disarm(1));
        assert!(!s.disarm(1));
        assert!(s.due(t0() + ChronoDuration::days(1)).is_empty());
        assert_eq!(s.next_deadline(), None);
    }

    #[test]
    fn arming_twice_is_ignored() {
        let s = scheduler();
        s.arm(1, "alice", t0());
        s.arm(1, "alice", t0());

        assert_eq!(s.due(t0()).len(), 1);
    }

    #[test]
    fn sleep_is_capped_by_tick_interval() {
        let s = scheduler();
        assert_eq!(s.sleep_duration(t0()), Duration::from_secs(60));

        s.arm(1, "soon", t0() + ChronoDuration::seconds(5));
        assert_eq!(s.sleep_duration(t0()), Duration::from_secs(5));

        s.arm(2, "overdue", t0() - ChronoDuration::seconds(5));
        assert_eq!(s.sleep_duration(t0()), Duration::ZERO);
    }

    #[test]
    fn next_deadline_skips_cancelled_entries() {
        let s = scheduler();
        s.arm(1, "alice", t0());
        s.arm(2, "bob", t0() + ChronoDuration::hours(1));
        s.disarm(1);

        assert_eq!(s.next_deadline(), Some(t0() + ChronoDuration::hours(1)));
    }
}
