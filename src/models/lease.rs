use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lease::ValidationError;

/// Longest subject id accepted by the registry, in bytes.
pub const MAX_SUBJECT_LEN: usize = 128;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// A time-bounded curse held by one subject.
///
/// Leases are immutable once created. `end` is fixed at `start + duration`
/// and a subject can only be cursed again after its current lease has been
/// released or has expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Assigned by the store when the lease is persisted.
    pub id: Option<Uuid>,
    pub subject_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Lease {
    /// Build an unpersisted lease starting at `start`.
    ///
    /// Fails unless `duration` is positive and `start + duration` is a
    /// representable instant, so `end > start` always holds.
    pub fn new(
        subject_id: impl Into<String>,
        start: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Self, ValidationError> {
        if duration <= Duration::zero() {
            return Err(ValidationError::InvalidDuration);
        }
        let end = start
            .checked_add_signed(duration)
            .ok_or(ValidationError::InvalidDuration)?;
        Ok(Self {
            id: None,
            subject_id: subject_id.into(),
            start,
            end,
        })
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.end
    }

    /// Whole days left, rounded up and clamped to zero once `end` has passed.
    pub fn remaining_days_at(&self, now: DateTime<Utc>) -> u32 {
        let millis = (self.end - now).num_milliseconds();
        if millis <= 0 {
            return 0;
        }
        let days = (millis + DAY_MILLIS - 1) / DAY_MILLIS;
        u32::try_from(days).unwrap_or(u32::MAX)
    }
}

/// Why a lease left the registry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Expired,
    Atoned,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Atoned => "atoned",
        }
    }
}

/// Result of asking the registry to curse a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CurseOutcome {
    /// A new lease was created.
    Cursed { lease: Lease },
    /// The subject was already cursed; nothing changed.
    Reminded { lease: Lease, remaining_days: u32 },
}

impl CurseOutcome {
    pub fn lease(&self) -> &Lease {
        match self {
            Self::Cursed { lease } | Self::Reminded { lease, .. } => lease,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Cursed { .. })
    }
}

/// Snapshot of an active lease for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseStatus {
    pub lease: Lease,
    pub remaining_days: u32,
}

/// Body of a transfer (atonement) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferInput {
    /// The subject who takes over the curse.
    pub to: String,
}

/// Check that a subject id is usable as a registry key.
pub fn validate_subject(subject_id: &str) -> Result<(), ValidationError> {
    if subject_id.is_empty() {
        return Err(ValidationError::Empty);
    }
    if subject_id.len() > MAX_SUBJECT_LEN {
        return Err(ValidationError::TooLong {
            len: subject_id.len(),
            max: MAX_SUBJECT_LEN,
        });
    }
    if let Some(c) = subject_id
        .chars()
        .find(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidCharacter(c));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn end_is_start_plus_duration() {
        let lease = Lease::new("alice", t0(), Duration::days(7)).unwrap();
        assert_eq!(lease.end, t0() + Duration::days(7));
        assert!(lease.id.is_none());
    }

    #[test]
    fn rejects_non_positive_duration() {
        assert_eq!(
            Lease::new("alice", t0(), Duration::zero()),
            Err(ValidationError::InvalidDuration)
        );
        assert_eq!(
            Lease::new("alice", t0(), Duration::seconds(-5)),
            Err(ValidationError::InvalidDuration)
        );
    }

    #[test]
    fn rejects_end_past_the_calendar() {
        let start = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert_eq!(
            Lease::new("alice", start, Duration::days(7)),
            Err(ValidationError::InvalidDuration)
        );
    }

    #[test]
    fn remaining_days_rounds_up() {
        let lease = Lease::new("alice", t0(), Duration::days(7)).unwrap();
        assert_eq!(lease.remaining_days_at(t0()), 7);
        assert_eq!(lease.remaining_days_at(t0() + Duration::seconds(1)), 7);
        assert_eq!(lease.remaining_days_at(t0() + Duration::days(6)), 1);
        assert_eq!(
            lease.remaining_days_at(t0() + Duration::days(7) - Duration::seconds(1)),
            1
        );
    }

    #[test]
    fn remaining_days_clamps_to_zero_past_due() {
        let lease = Lease::new("alice", t0(), Duration::days(7)).unwrap();
        assert_eq!(lease.remaining_days_at(lease.end), 0);
        assert_eq!(lease.remaining_days_at(lease.end + Duration::days(3)), 0);
    }

    #[test]
    fn expiry_is_inclusive_of_end() {
        let lease = Lease::new("alice", t0(), Duration::hours(1)).unwrap();
        assert!(!lease.is_expired_at(lease.end - Duration::milliseconds(1)));
        assert!(lease.is_expired_at(lease.end));
    }

    #[test]
    fn validate_subject_rejects_bad_ids() {
        assert_eq!(validate_subject(""), Err(ValidationError::Empty));
        assert_eq!(
            validate_subject("two words"),
            Err(ValidationError::InvalidCharacter(' '))
        );
        assert_eq!(
            validate_subject("bell\u{7}"),
            Err(ValidationError::InvalidCharacter('\u{7}'))
        );
        let long = "x".repeat(MAX_SUBJECT_LEN + 1);
        assert!(matches!(
            validate_subject(&long),
            Err(ValidationError::TooLong { .. })
        ));
        assert!(validate_subject("248624817014177792").is_ok());
    }
}
