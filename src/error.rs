//! Error taxonomy for the metadata engine.
//!
//! Every class the API boundary exposes is a distinct variant so callers can
//! pattern-match instead of inspecting strings. Back-end failures are wrapped
//! in [`Error::Backend`] with the originating error preserved as the source.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by metadata operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A request failed validation before any I/O was issued.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The addressed object does not exist (or is not visible).
    #[error("object not found")]
    ObjectNotFound,
    /// The addressed segment does not exist.
    #[error("segment not found")]
    SegmentNotFound,
    /// An object already exists at the addressed location.
    #[error("object already exists")]
    ObjectAlreadyExists,
    /// A write raced or collided with existing state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Generic Object Lock failure not attributable to a single protection.
    #[error("object lock: {0}")]
    ObjectLock(&'static str),
    /// The object is protected by an active retention period.
    #[error("object protected by retention")]
    ObjectProtected,
    /// The object is protected by a legal hold.
    #[error("object protected by legal hold")]
    LegalHold,
    /// Expiration and Object Lock settings exclude each other.
    #[error("object expiration conflict: {0}")]
    ObjectExpiration(&'static str),
    /// The operation is not valid for the addressed entity.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(&'static str),
    /// The caller lacks the authority for the requested mutation.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),
    /// A stored alias-piece blob failed to decode.
    #[error("malformed alias pieces: {0}")]
    MalformedAliasPieces(&'static str),
    /// The caller's context was cancelled; no partial state was left behind.
    #[error("operation cancelled")]
    Cancelled,
    /// A back-end call failed.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary back-end error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Backend(Box::new(err))
    }

    /// True for the Object Lock family (`ObjectLock`, `ObjectProtected`,
    /// `LegalHold`).
    pub fn is_object_lock(&self) -> bool {
        matches!(
            self,
            Error::ObjectLock(_) | Error::ObjectProtected | Error::LegalHold
        )
    }

    /// True when the failure is transient and the operation may be retried.
    ///
    /// Non-idempotent operations must confirm via a subsequent get that the
    /// prior attempt did not land before retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Backend(source) => source
                .downcast_ref::<rusqlite::Error>()
                .map(|err| {
                    matches!(
                        err.sqlite_error_code(),
                        Some(rusqlite::ErrorCode::DatabaseBusy)
                            | Some(rusqlite::ErrorCode::DatabaseLocked)
                    )
                })
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::backend(err)
    }
}
