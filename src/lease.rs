//! Lease state machine for containers and blobs.
//!
//! The lease is an immutable value plus pure transition functions: every
//! operation takes the stored lease and the request's logical clock and
//! returns a new lease or an error. Time only enters through [`Lease::project`],
//! so the machine is deterministic and replayable.
//!
//! Valid state/status pairs:
//! `(Available, Unlocked)`, `(Leased, Locked)`, `(Expired, Unlocked)`,
//! `(Breaking, Locked)`, `(Broken, Unlocked)`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, StorageError, StorageResult};

/// Minimum fixed lease duration in seconds.
pub const MIN_LEASE_DURATION_SECONDS: i64 = 15;
/// Maximum fixed lease duration in seconds.
pub const MAX_LEASE_DURATION_SECONDS: i64 = 60;
/// Maximum lease break period in seconds.
pub const MAX_LEASE_BREAK_PERIOD_SECONDS: i64 = 60;

/// Lease state for containers and blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseState {
    #[default]
    Available,
    Leased,
    Expired,
    Breaking,
    Broken,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Available => "available",
            LeaseState::Leased => "leased",
            LeaseState::Expired => "expired",
            LeaseState::Breaking => "breaking",
            LeaseState::Broken => "broken",
        }
    }
}

/// Lease status, fully determined by the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    #[default]
    Unlocked,
    Locked,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseStatus::Unlocked => "unlocked",
            LeaseStatus::Locked => "locked",
        }
    }
}

/// Lease duration kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseDurationType {
    Infinite,
    Fixed,
}

impl LeaseDurationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseDurationType::Infinite => "infinite",
            LeaseDurationType::Fixed => "fixed",
        }
    }
}

/// Lease record embedded in container and blob rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub state: LeaseState,
    #[serde(default)]
    pub status: LeaseStatus,
    #[serde(default)]
    pub duration_type: Option<LeaseDurationType>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub break_time: Option<DateTime<Utc>>,
}

impl Default for Lease {
    fn default() -> Self {
        Self::available()
    }
}

fn status_for(state: LeaseState) -> LeaseStatus {
    match state {
        LeaseState::Leased | LeaseState::Breaking => LeaseStatus::Locked,
        LeaseState::Available | LeaseState::Expired | LeaseState::Broken => LeaseStatus::Unlocked,
    }
}

impl Lease {
    /// Returns a cleared lease in the `Available` state.
    pub fn available() -> Self {
        Self {
            lease_id: None,
            state: LeaseState::Available,
            status: LeaseStatus::Unlocked,
            duration_type: None,
            duration_seconds: None,
            expire_time: None,
            break_time: None,
        }
    }

    fn matches_id(&self, lease_id: &str) -> bool {
        self.lease_id
            .as_deref()
            .is_some_and(|current| current.eq_ignore_ascii_case(lease_id))
    }

    /// Applies time-driven transitions against the request clock.
    ///
    /// Idempotent: projecting twice with the same `now` yields the same
    /// lease.
    pub fn project(&self, now: DateTime<Utc>) -> Lease {
        let mut lease = self.clone();
        match lease.state {
            LeaseState::Leased => {
                let expired = lease.duration_type == Some(LeaseDurationType::Fixed)
                    && lease.expire_time.is_some_and(|expiry| now > expiry);
                if expired {
                    lease.state = LeaseState::Expired;
                    lease.duration_type = None;
                    lease.expire_time = None;
                    lease.break_time = None;
                }
            }
            LeaseState::Breaking => {
                if lease.break_time.is_some_and(|deadline| now > deadline) {
                    lease.state = LeaseState::Broken;
                    lease.duration_type = None;
                    lease.expire_time = None;
                    lease.break_time = None;
                }
            }
            LeaseState::Available | LeaseState::Expired | LeaseState::Broken => {}
        }
        lease.status = status_for(lease.state);
        lease
    }

    /// Acquires a lease, or refreshes it when the holder re-acquires with
    /// the same proposed id.
    pub fn acquire(
        &self,
        now: DateTime<Utc>,
        duration: i64,
        proposed_id: Option<&str>,
    ) -> StorageResult<Lease> {
        match self.state {
            LeaseState::Breaking => {
                return Err(StorageError::new(ErrorCode::LeaseAlreadyPresent));
            }
            LeaseState::Leased => {
                let refresh = proposed_id.is_some_and(|id| self.matches_id(id));
                if !refresh {
                    return Err(StorageError::new(ErrorCode::LeaseAlreadyPresent));
                }
            }
            LeaseState::Available | LeaseState::Expired | LeaseState::Broken => {}
        }

        let duration_type = if duration == -1 {
            LeaseDurationType::Infinite
        } else if (MIN_LEASE_DURATION_SECONDS..=MAX_LEASE_DURATION_SECONDS).contains(&duration) {
            LeaseDurationType::Fixed
        } else {
            return Err(StorageError::new(ErrorCode::InvalidLeaseDuration));
        };

        let lease_id = proposed_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Lease {
            lease_id: Some(lease_id),
            state: LeaseState::Leased,
            status: LeaseStatus::Locked,
            duration_type: Some(duration_type),
            duration_seconds: Some(duration),
            expire_time: (duration_type == LeaseDurationType::Fixed)
                .then(|| now + Duration::seconds(duration)),
            break_time: None,
        })
    }

    /// Renews the lease held under `lease_id`.
    pub fn renew(&self, now: DateTime<Utc>, lease_id: &str) -> StorageResult<Lease> {
        match self.state {
            LeaseState::Available => {
                return Err(StorageError::new(
                    ErrorCode::LeaseIdMismatchWithLeaseOperation,
                ));
            }
            LeaseState::Breaking | LeaseState::Broken => {
                return Err(StorageError::new(ErrorCode::LeaseIsBrokenAndCannotBeRenewed));
            }
            LeaseState::Leased | LeaseState::Expired => {}
        }
        if !self.matches_id(lease_id) {
            return Err(StorageError::new(
                ErrorCode::LeaseIdMismatchWithLeaseOperation,
            ));
        }

        let mut lease = self.clone();
        lease.state = LeaseState::Leased;
        lease.status = LeaseStatus::Locked;
        lease.break_time = None;
        match lease.duration_seconds {
            Some(seconds)
                if (MIN_LEASE_DURATION_SECONDS..=MAX_LEASE_DURATION_SECONDS)
                    .contains(&seconds) =>
            {
                lease.duration_type = Some(LeaseDurationType::Fixed);
                lease.expire_time = Some(now + Duration::seconds(seconds));
            }
            _ => {
                lease.duration_type = Some(LeaseDurationType::Infinite);
                lease.expire_time = None;
            }
        }
        Ok(lease)
    }

    /// Replaces the lease id. `current_id` must name either the stored id or
    /// the proposed one (which makes a retried change idempotent).
    pub fn change(&self, current_id: &str, proposed_id: &str) -> StorageResult<Lease> {
        match self.state {
            LeaseState::Available | LeaseState::Expired | LeaseState::Broken => {
                return Err(StorageError::new(ErrorCode::LeaseNotPresent));
            }
            LeaseState::Breaking => {
                return Err(StorageError::new(
                    ErrorCode::LeaseIsBreakingAndCannotBeChanged,
                ));
            }
            LeaseState::Leased => {}
        }
        if !self.matches_id(current_id) && !self.matches_id(proposed_id) {
            return Err(StorageError::new(
                ErrorCode::LeaseIdMismatchWithLeaseOperation,
            ));
        }

        let mut lease = self.clone();
        lease.lease_id = Some(proposed_id.to_string());
        Ok(lease)
    }

    /// Releases the lease held under `lease_id`, clearing all lease fields.
    pub fn release(&self, lease_id: &str) -> StorageResult<Lease> {
        if self.state == LeaseState::Available || !self.matches_id(lease_id) {
            return Err(StorageError::new(
                ErrorCode::LeaseIdMismatchWithLeaseOperation,
            ));
        }
        Ok(Lease::available())
    }

    /// Breaks the lease. Returns the new lease and the remaining break
    /// period in whole seconds.
    pub fn break_lease(
        &self,
        now: DateTime<Utc>,
        break_period: Option<i64>,
    ) -> StorageResult<(Lease, i64)> {
        if self.state == LeaseState::Available {
            return Err(StorageError::new(ErrorCode::LeaseNotPresent));
        }
        if let Some(period) = break_period {
            if !(0..=MAX_LEASE_BREAK_PERIOD_SECONDS).contains(&period) {
                return Err(StorageError::new(ErrorCode::InvalidLeaseBreakPeriod));
            }
        }

        let period = match (self.state, break_period) {
            (LeaseState::Expired | LeaseState::Broken, _) | (_, None | Some(0)) => {
                let mut lease = Lease::available();
                lease.lease_id = self.lease_id.clone();
                lease.state = LeaseState::Broken;
                lease.status = LeaseStatus::Unlocked;
                return Ok((lease, 0));
            }
            (_, Some(period)) => Duration::seconds(period),
        };

        let mut candidate = match self.duration_type {
            Some(LeaseDurationType::Infinite) | None => now + period,
            Some(LeaseDurationType::Fixed) => match self.expire_time {
                Some(expiry) => (now + period).min(expiry),
                None => now + period,
            },
        };
        if let Some(existing) = self.break_time {
            candidate = candidate.min(existing);
        }

        let mut lease = self.clone();
        lease.state = LeaseState::Breaking;
        lease.status = LeaseStatus::Locked;
        lease.break_time = Some(candidate);

        let remaining = ((candidate - now).num_milliseconds() as f64 / 1000.0).round() as i64;
        Ok((lease, remaining))
    }

    /// Write gate: validates a mutating operation against this lease.
    pub fn validate_write(&self, lease_id: Option<&str>) -> StorageResult<()> {
        match self.status {
            LeaseStatus::Locked => match lease_id {
                None => Err(StorageError::new(ErrorCode::LeaseIdMissing)),
                Some(id) if self.matches_id(id) => Ok(()),
                Some(_) => Err(StorageError::new(
                    ErrorCode::LeaseIdMismatchWithBlobOperation,
                )),
            },
            LeaseStatus::Unlocked => match lease_id {
                Some(id) if !id.is_empty() => Err(StorageError::new(ErrorCode::LeaseLost)),
                _ => Ok(()),
            },
        }
    }

    /// Read gate: only the locked case is enforced.
    pub fn validate_read(&self, lease_id: Option<&str>) -> StorageResult<()> {
        match self.status {
            LeaseStatus::Locked => match lease_id {
                None => Err(StorageError::new(ErrorCode::LeaseIdMissing)),
                Some(id) if self.matches_id(id) => Ok(()),
                Some(_) => Err(StorageError::new(
                    ErrorCode::LeaseIdMismatchWithBlobOperation,
                )),
            },
            LeaseStatus::Unlocked => Ok(()),
        }
    }

    /// Collapses a projected `Expired` or `Broken` lease to `Available`
    /// after a successful write.
    pub fn collapse_after_write(&self) -> Lease {
        match self.state {
            LeaseState::Expired | LeaseState::Broken => Lease::available(),
            _ => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn leased_fixed(duration: i64, acquired_at: i64) -> Lease {
        Lease::available()
            .acquire(at(acquired_at), duration, Some("L1"))
            .unwrap()
    }

    #[test]
    fn acquire_sets_expiry_for_fixed_duration() {
        let lease = leased_fixed(30, 0);
        assert_eq!(lease.state, LeaseState::Leased);
        assert_eq!(lease.status, LeaseStatus::Locked);
        assert_eq!(lease.lease_id.as_deref(), Some("L1"));
        assert_eq!(lease.expire_time, Some(at(30)));
    }

    #[test]
    fn acquire_infinite_has_no_expiry() {
        let lease = Lease::available().acquire(at(0), -1, None).unwrap();
        assert_eq!(lease.duration_type, Some(LeaseDurationType::Infinite));
        assert!(lease.expire_time.is_none());
        assert!(lease.lease_id.is_some());
    }

    #[test]
    fn acquire_rejects_out_of_range_durations() {
        for duration in [0, 14, 61, -2] {
            let err = Lease::available().acquire(at(0), duration, None).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidLeaseDuration);
        }
    }

    #[test]
    fn acquire_on_leased_is_idempotent_for_the_holder() {
        let lease = leased_fixed(30, 0);
        let refreshed = lease.acquire(at(10), 45, Some("l1")).unwrap();
        assert_eq!(refreshed.expire_time, Some(at(55)));

        let err = lease.acquire(at(10), 30, Some("L2")).unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseAlreadyPresent);
        let err = lease.acquire(at(10), 30, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseAlreadyPresent);
    }

    #[test]
    fn acquire_during_breaking_is_rejected() {
        let lease = Lease::available().acquire(at(0), -1, Some("L1")).unwrap();
        let (breaking, lease_time) = lease.break_lease(at(10), Some(30)).unwrap();
        assert_eq!(breaking.state, LeaseState::Breaking);
        assert_eq!(lease_time, 30);

        let err = breaking
            .project(at(20))
            .acquire(at(20), 15, Some("L2"))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LeaseAlreadyPresent);

        // Past the break time the lease projects to Broken and can be taken.
        let broken = breaking.project(at(45));
        assert_eq!(broken.state, LeaseState::Broken);
        assert!(broken.acquire(at(45), 15, Some("L2")).is_ok());
    }

    #[test]
    fn projection_expires_fixed_leases() {
        let lease = leased_fixed(15, 0);
        let projected = lease.project(at(20));
        assert_eq!(projected.state, LeaseState::Expired);
        assert_eq!(projected.status, LeaseStatus::Unlocked);
        assert!(projected.duration_type.is_none());
        assert!(projected.expire_time.is_none());
        // Holder id survives expiry until the next write collapses it.
        assert_eq!(projected.lease_id.as_deref(), Some("L1"));
    }

    #[test]
    fn projection_is_idempotent() {
        let lease = leased_fixed(15, 0);
        let once = lease.project(at(20));
        assert_eq!(once.project(at(20)), once);

        let (breaking, _) = Lease::available()
            .acquire(at(0), -1, Some("L1"))
            .unwrap()
            .break_lease(at(0), Some(10))
            .unwrap();
        let once = breaking.project(at(30));
        assert_eq!(once.state, LeaseState::Broken);
        assert_eq!(once.project(at(30)), once);
    }

    #[test]
    fn renew_extends_expiry_from_now() {
        let lease = leased_fixed(30, 0);
        let renewed = lease.renew(at(20), "L1").unwrap();
        assert_eq!(renewed.expire_time, Some(at(50)));
        assert_eq!(renewed.state, LeaseState::Leased);
    }

    #[test]
    fn renew_errors() {
        let available = Lease::available();
        assert_eq!(
            available.renew(at(0), "L1").unwrap_err().code,
            ErrorCode::LeaseIdMismatchWithLeaseOperation
        );

        let lease = leased_fixed(30, 0);
        assert_eq!(
            lease.renew(at(5), "other").unwrap_err().code,
            ErrorCode::LeaseIdMismatchWithLeaseOperation
        );

        let (breaking, _) = lease.break_lease(at(5), Some(20)).unwrap();
        assert_eq!(
            breaking.renew(at(6), "L1").unwrap_err().code,
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed
        );
        assert_eq!(
            breaking.project(at(60)).renew(at(60), "L1").unwrap_err().code,
            ErrorCode::LeaseIsBrokenAndCannotBeRenewed
        );
    }

    #[test]
    fn change_swaps_only_the_id() {
        let lease = leased_fixed(30, 0);
        let changed = lease.change("L1", "L2").unwrap();
        assert_eq!(changed.lease_id.as_deref(), Some("L2"));
        assert_eq!(changed.expire_time, lease.expire_time);

        // Retried change: current id already replaced, proposed id matches.
        let retried = changed.change("L1", "L2").unwrap();
        assert_eq!(retried.lease_id.as_deref(), Some("L2"));
    }

    #[test]
    fn change_errors() {
        assert_eq!(
            Lease::available().change("L1", "L2").unwrap_err().code,
            ErrorCode::LeaseNotPresent
        );
        let lease = leased_fixed(30, 0);
        assert_eq!(
            lease.change("bogus", "other").unwrap_err().code,
            ErrorCode::LeaseIdMismatchWithLeaseOperation
        );
        let (breaking, _) = lease.break_lease(at(1), Some(30)).unwrap();
        assert_eq!(
            breaking.change("L1", "L2").unwrap_err().code,
            ErrorCode::LeaseIsBreakingAndCannotBeChanged
        );
    }

    #[test]
    fn release_clears_everything() {
        let lease = leased_fixed(30, 0);
        let released = lease.release("L1").unwrap();
        assert_eq!(released, Lease::available());

        assert_eq!(
            lease.release("wrong").unwrap_err().code,
            ErrorCode::LeaseIdMismatchWithLeaseOperation
        );
        assert_eq!(
            Lease::available().release("L1").unwrap_err().code,
            ErrorCode::LeaseIdMismatchWithLeaseOperation
        );
    }

    #[test]
    fn break_immediate_cases() {
        let lease = leased_fixed(30, 0);
        let (broken, lease_time) = lease.break_lease(at(5), Some(0)).unwrap();
        assert_eq!(broken.state, LeaseState::Broken);
        assert_eq!(broken.status, LeaseStatus::Unlocked);
        assert_eq!(lease_time, 0);

        let expired = lease.project(at(100));
        let (broken, lease_time) = expired.break_lease(at(100), Some(30)).unwrap();
        assert_eq!(broken.state, LeaseState::Broken);
        assert_eq!(lease_time, 0);

        // Infinite lease with no break period breaks immediately.
        let infinite = Lease::available().acquire(at(0), -1, Some("L1")).unwrap();
        let (broken, lease_time) = infinite.break_lease(at(5), None).unwrap();
        assert_eq!(broken.state, LeaseState::Broken);
        assert_eq!(lease_time, 0);
    }

    #[test]
    fn break_caps_at_remaining_lease_time() {
        let lease = leased_fixed(30, 0);
        // 60s break period but only 20s left on the lease.
        let (breaking, lease_time) = lease.break_lease(at(10), Some(60)).unwrap();
        assert_eq!(breaking.state, LeaseState::Breaking);
        assert_eq!(breaking.break_time, Some(at(30)));
        assert_eq!(lease_time, 20);

        // A second break keeps the earlier break time.
        let (again, lease_time) = breaking.break_lease(at(12), Some(60)).unwrap();
        assert_eq!(again.break_time, Some(at(30)));
        assert_eq!(lease_time, 18);
    }

    #[test]
    fn break_rejects_invalid_period() {
        let lease = leased_fixed(30, 0);
        for period in [-1, 61] {
            assert_eq!(
                lease.break_lease(at(1), Some(period)).unwrap_err().code,
                ErrorCode::InvalidLeaseBreakPeriod
            );
        }
        assert_eq!(
            Lease::available().break_lease(at(0), Some(10)).unwrap_err().code,
            ErrorCode::LeaseNotPresent
        );
    }

    #[test]
    fn write_gate() {
        let lease = leased_fixed(30, 0);
        assert!(lease.validate_write(Some("L1")).is_ok());
        assert!(lease.validate_write(Some("l1")).is_ok());
        assert_eq!(
            lease.validate_write(None).unwrap_err().code,
            ErrorCode::LeaseIdMissing
        );
        assert_eq!(
            lease.validate_write(Some("L2")).unwrap_err().code,
            ErrorCode::LeaseIdMismatchWithBlobOperation
        );

        let unlocked = lease.project(at(60));
        assert!(unlocked.validate_write(None).is_ok());
        assert_eq!(
            unlocked.validate_write(Some("L1")).unwrap_err().code,
            ErrorCode::LeaseLost
        );
    }

    #[test]
    fn read_gate_accepts_stale_id_when_unlocked() {
        let lease = leased_fixed(30, 0);
        assert!(lease.validate_read(Some("L1")).is_ok());
        assert_eq!(
            lease.validate_read(None).unwrap_err().code,
            ErrorCode::LeaseIdMissing
        );

        let unlocked = lease.project(at(60));
        assert!(unlocked.validate_read(Some("L1")).is_ok());
        assert!(unlocked.validate_read(None).is_ok());
    }

    #[test]
    fn collapse_after_write() {
        let lease = leased_fixed(15, 0);
        assert_eq!(lease.collapse_after_write(), lease);
        let expired = lease.project(at(30));
        assert_eq!(expired.collapse_after_write(), Lease::available());
    }

    #[test]
    fn state_status_pairs_stay_valid() {
        let mut seen = vec![Lease::available()];
        let leased = leased_fixed(15, 0);
        seen.push(leased.clone());
        seen.push(leased.project(at(30)));
        let (breaking, _) = Lease::available()
            .acquire(at(0), -1, Some("L1"))
            .unwrap()
            .break_lease(at(0), Some(10))
            .unwrap();
        seen.push(breaking.clone());
        seen.push(breaking.project(at(30)));

        for lease in seen {
            assert_eq!(lease.status, super::status_for(lease.state));
        }
    }

    #[test]
    fn serde_shape_is_camel_case() {
        let lease = leased_fixed(30, 0);
        let json = serde_json::to_value(&lease).unwrap();
        assert_eq!(json["leaseId"], "L1");
        assert_eq!(json["state"], "leased");
        assert_eq!(json["status"], "locked");
        assert_eq!(json["durationType"], "fixed");

        let back: Lease = serde_json::from_value(json).unwrap();
        assert_eq!(back, lease);
    }
}
