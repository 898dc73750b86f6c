//! Per-operation context.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Context accompanying every store operation.
///
/// `start_time` is the logical clock of the request: all time-dependent
/// lease transitions are evaluated against it, never against the wall
/// clock, so lease expiry is deterministic per request and replayable in
/// tests.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Correlation id attached to errors raised by the operation.
    pub request_id: String,
    /// Logical clock for the request.
    pub start_time: DateTime<Utc>,
}

impl OperationContext {
    /// Creates a context stamped with the current wall clock.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            start_time: Utc::now(),
        }
    }

    /// Creates a context with an explicit logical clock.
    pub fn at(start_time: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            start_time,
        }
    }

    /// Creates a context with an explicit request id and logical clock.
    pub fn with_request_id(request_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            start_time,
        }
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats an instant the way snapshot identifiers are rendered: ISO-8601
/// with seven fractional digits, e.g. `2024-01-27T12:34:56.1234567Z`.
pub fn snapshot_timestamp(dt: &DateTime<Utc>) -> String {
    format!(
        "{}.{:07}Z",
        dt.format("%Y-%m-%dT%H:%M:%S"),
        dt.timestamp_subsec_nanos() / 100
    )
}
