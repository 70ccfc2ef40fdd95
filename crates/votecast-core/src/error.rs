// Error taxonomy for vote casting, session storage and observer delivery.

use thiserror::Error;

/// Outcome of a rejected `cast_vote` call.
///
/// The business-rule variants (`SessionClosed`, `DuplicateVote`,
/// `SessionNotFound`) are deterministic and kept distinct so the boundary
/// layer can map each to its own response. `StorageUnavailable` is surfaced
/// immediately and never retried here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("voting session is closed")]
    SessionClosed,

    #[error("user has already voted in this session")]
    DuplicateVote,

    #[error("voting session or option not found")]
    SessionNotFound,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("vote cancelled before commit")]
    Cancelled,
}

impl VoteError {
    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            VoteError::SessionClosed => "SESSION_CLOSED",
            VoteError::DuplicateVote => "DUPLICATE_VOTE",
            VoteError::SessionNotFound => "SESSION_NOT_FOUND",
            VoteError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            VoteError::Cancelled => "CANCELLED",
        }
    }
}

impl From<r2d2::Error> for VoteError {
    fn from(err: r2d2::Error) -> Self {
        VoteError::StorageUnavailable(format!("no database connection available: {err}"))
    }
}

impl From<rusqlite::Error> for VoteError {
    fn from(err: rusqlite::Error) -> Self {
        if is_unique_violation(&err) {
            return VoteError::DuplicateVote;
        }
        VoteError::StorageUnavailable(err.to_string())
    }
}

/// Errors from session CRUD operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("voting session not found")]
    NotFound,

    #[error("invalid session field `{field}`: {message}")]
    InvalidSession { field: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("no database connection available: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("storage task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        StoreError::InvalidSession {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Failure to deliver a payload to one observer. Never leaves the hub.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("write timed out")]
    Timeout,

    #[error("observer channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),
}

/// True when `err` is a UNIQUE/PRIMARY KEY constraint violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_error_codes_are_distinct() {
        let codes = [
            VoteError::SessionClosed.code(),
            VoteError::DuplicateVote.code(),
            VoteError::SessionNotFound.code(),
            VoteError::StorageUnavailable("x".into()).code(),
            VoteError::Cancelled.code(),
        ];
        let mut sorted = codes.to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn busy_error_maps_to_storage_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(matches!(
            VoteError::from(err),
            VoteError::StorageUnavailable(_)
        ));
    }

    #[test]
    fn unique_violation_maps_to_duplicate_vote() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
            None,
        );
        assert_eq!(VoteError::from(err), VoteError::DuplicateVote);
    }
}
