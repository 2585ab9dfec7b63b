//! Domain models for Sadako.
//!
//! - [`Lease`]: a curse held by one subject, with fixed start and end.
//! - [`ReleaseReason`]: whether a lease ran out or was atoned for.
//! - [`CurseOutcome`]: a new lease, or a reminder for an existing one.
//! - [`LeaseStatus`]: an active lease plus the days it has left.

mod lease;

pub use lease::*;
