//! Storage error types surfaced to upper layers.

use thiserror::Error;

/// Error codes raised by the metadata store.
///
/// Upper layers translate these to wire responses; the store itself never
/// formats errors for a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // General errors
    InternalError,
    InvalidInput,
    InvalidOperation,
    InvalidResourceName,
    NotImplemented,
    StoreClosed,
    DatabaseError,

    // Container errors
    ContainerAlreadyExists,
    ContainerNotFound,

    // Blob errors
    BlobArchived,
    BlobNotFound,
    BlobSnapshotsPresent,
    InvalidBlobType,
    SnapshotsPresent,

    // Lease errors
    InvalidLeaseBreakPeriod,
    InvalidLeaseDuration,
    LeaseAlreadyPresent,
    LeaseIdMismatchWithBlobOperation,
    LeaseIdMismatchWithLeaseOperation,
    LeaseIdMissing,
    LeaseIsBreakingAndCannotBeChanged,
    LeaseIsBrokenAndCannotBeRenewed,
    LeaseLost,
    LeaseNotPresent,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::InvalidOperation => "InvalidOperation",
            ErrorCode::InvalidResourceName => "InvalidResourceName",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::StoreClosed => "StoreClosed",
            ErrorCode::DatabaseError => "DatabaseError",
            ErrorCode::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorCode::ContainerNotFound => "ContainerNotFound",
            ErrorCode::BlobArchived => "BlobArchived",
            ErrorCode::BlobNotFound => "BlobNotFound",
            ErrorCode::BlobSnapshotsPresent => "BlobSnapshotsPresent",
            ErrorCode::InvalidBlobType => "InvalidBlobType",
            ErrorCode::SnapshotsPresent => "SnapshotsPresent",
            ErrorCode::InvalidLeaseBreakPeriod => "InvalidLeaseBreakPeriod",
            ErrorCode::InvalidLeaseDuration => "InvalidLeaseDuration",
            ErrorCode::LeaseAlreadyPresent => "LeaseAlreadyPresent",
            ErrorCode::LeaseIdMismatchWithBlobOperation => "LeaseIdMismatchWithBlobOperation",
            ErrorCode::LeaseIdMismatchWithLeaseOperation => "LeaseIdMismatchWithLeaseOperation",
            ErrorCode::LeaseIdMissing => "LeaseIdMissing",
            ErrorCode::LeaseIsBreakingAndCannotBeChanged => "LeaseIsBreakingAndCannotBeChanged",
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed => "LeaseIsBrokenAndCannotBeRenewed",
            ErrorCode::LeaseLost => "LeaseLost",
            ErrorCode::LeaseNotPresent => "LeaseNotPresent",
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ContainerAlreadyExists => "The specified container already exists.",
            ErrorCode::ContainerNotFound => "The specified container does not exist.",
            ErrorCode::BlobNotFound => "The specified blob does not exist.",
            ErrorCode::BlobArchived => {
                "This operation is not permitted on an archived blob."
            }
            ErrorCode::BlobSnapshotsPresent => {
                "This operation is not permitted because the blob has snapshots."
            }
            ErrorCode::SnapshotsPresent => {
                "This operation is not permitted because the blob has snapshots."
            }
            ErrorCode::InvalidBlobType => "The blob type is invalid for this operation.",
            ErrorCode::InvalidLeaseDuration => "The value for the lease duration is invalid.",
            ErrorCode::InvalidLeaseBreakPeriod => "The lease break period is invalid.",
            ErrorCode::LeaseAlreadyPresent => "There is already a lease present.",
            ErrorCode::LeaseIdMissing => {
                "There is currently a lease on the resource and no lease ID was specified in the request."
            }
            ErrorCode::LeaseLost => {
                "A lease ID was specified, but the lease for the resource has expired."
            }
            ErrorCode::LeaseNotPresent => "There is currently no lease on the resource.",
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed => {
                "The lease ID matched, but the lease has been broken explicitly and cannot be renewed."
            }
            ErrorCode::LeaseIsBreakingAndCannotBeChanged => {
                "The lease ID matched, but the lease is currently in breaking state and cannot be changed."
            }
            ErrorCode::LeaseIdMismatchWithBlobOperation => {
                "The lease ID specified did not match the lease ID for the blob."
            }
            ErrorCode::LeaseIdMismatchWithLeaseOperation => {
                "The lease ID specified did not match the lease ID for the blob/container."
            }
            ErrorCode::InvalidOperation => "Invalid operation against a blob snapshot.",
            ErrorCode::InvalidResourceName => {
                "The specified resource name contains invalid characters."
            }
            ErrorCode::NotImplemented => "The requested operation is not implemented.",
            ErrorCode::StoreClosed => "The metadata store has been closed.",
            ErrorCode::DatabaseError => "The backing store reported an error.",
            ErrorCode::InvalidInput => "One of the request inputs is not valid.",
            ErrorCode::InternalError => {
                "The server encountered an internal error. Please retry the request."
            }
        }
    }
}

/// Storage error with code, message, and request correlation id.
#[derive(Debug, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
    #[source]
    source: Option<sqlx::Error>,
}

impl StorageError {
    /// Creates a new storage error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
            request_id: None,
            source: None,
        }
    }

    /// Creates a new storage error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
            source: None,
        }
    }

    /// Sets the request ID for this error.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        Self {
            code: ErrorCode::DatabaseError,
            message: err.to_string(),
            request_id: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_message(ErrorCode::InternalError, format!("value codec failure: {err}"))
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
