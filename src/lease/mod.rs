//! Lease lifecycle engine.
//!
//! [`LeaseRegistry`] is the only entry point: it keeps the active leases,
//! persists them through a [`LeaseStore`], arms each one in the
//! [`ExpirationScheduler`] and reports transitions to a
//! [`NotificationSink`](crate::notify::NotificationSink).
//!
//! ```text
//! Uncursed --curse--> Active --expired--> Uncursed
//!                       |  \--atoned---> Uncursed
//!                       \--curse (reminder)--> Active
//! ```

mod clock;
mod error;
mod registry;
mod scheduler;
mod store;

pub use clock::*;
pub use error::*;
pub use registry::*;
pub use scheduler::*;
pub use store::*;
