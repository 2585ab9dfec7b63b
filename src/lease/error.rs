use thiserror::Error;

/// A request was rejected before any state was touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("subject id must not be empty")]
    Empty,

    #[error("subject id is {len} bytes, at most {max} allowed")]
    TooLong { len: usize, max: usize },

    #[error("subject id contains invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("cannot transfer a curse to the same subject")]
    SameSubject,

    #[error("subject {0} is not cursed")]
    NotCursed(String),

    #[error("lease duration must be positive and end within the calendar")]
    InvalidDuration,
}

/// Persistence failure reported by a [`LeaseStore`](super::LeaseStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store task failed: {0}")]
    Task(String),
}

/// Error returned by [`LeaseRegistry`](super::LeaseRegistry) operations.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl LeaseError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

pub type LeaseResult<T> = Result<T, LeaseError>;
