//! Per-dimension request trackers.
//!
//! Each tracker owns the records for one dimension (addresses,
//! identities, operations), resolves the effective limits through the
//! configuration store, and checks the dual minute/hour windows against
//! the counter backend. Trackers produce [`Verdict`]s; combining them
//! into a request decision is the engine's job.

pub mod address;
pub mod identity;
pub mod operation;

pub use address::{AddressStats, AddressTracker, GeoInfo};
pub use identity::{IdentityStats, IdentityTracker};
pub use operation::{OperationStats, OperationTracker};

use crate::backend::{BackendResult, StateBackend};
use crate::config::LimitSet;
use crate::counter::RateLimitKey;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// The two windows every dimension check enforces.
pub(crate) const MINUTE: Duration = Duration::from_secs(60);
pub(crate) const HOUR: Duration = Duration::from_secs(3600);

/// Outcome of a single dimension check.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Whether the dimension admits the request.
    pub allowed: bool,

    /// The per-minute limit that applied, if any.
    pub limit: Option<u64>,

    /// Requests left in the tighter of the two windows.
    pub remaining: Option<u64>,

    /// When the limiting window's current bucket ends.
    pub reset_at: Option<DateTime<Utc>>,

    /// How long the caller should wait before retrying, on denial.
    pub retry_after: Option<Duration>,

    /// Human-readable denial reason, when not a plain quota overrun.
    pub reason: Option<String>,
}

impl Verdict {
    /// An admitting verdict with quota headroom attached.
    #[must_use]
    pub fn allowed(limit: u64, remaining: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit: Some(limit),
            remaining: Some(remaining),
            reset_at: Some(reset_at),
            retry_after: None,
            reason: None,
        }
    }

    /// A denying verdict.
    #[must_use]
    pub fn denied(limit: u64, reset_at: DateTime<Utc>, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit: Some(limit),
            remaining: Some(0),
            reset_at: Some(reset_at),
            retry_after: Some(retry_after),
            reason: None,
        }
    }

    /// A denying verdict with an explicit reason (blocklist, backend
    /// failure under a fail-closed policy).
    #[must_use]
    pub fn denied_with_reason(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            limit: None,
            remaining: None,
            reset_at: None,
            retry_after: None,
            reason: Some(reason.into()),
        }
    }

    /// An admitting verdict with no quota attached (admin bypass).
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: None,
            reset_at: None,
            retry_after: None,
            reason: None,
        }
    }
}

/// Record the request against both windows for `key` and evaluate the
/// given limits. Both windows are recorded even when the request ends up
/// denied, so retry storms keep extending the over-limit period.
pub(crate) fn check_windows(
    backend: &dyn StateBackend,
    key: &RateLimitKey,
    limits: &LimitSet,
    now: DateTime<Utc>,
) -> BackendResult<Verdict> {
    let minute = backend.record(key, MINUTE, now)?;
    let hour = backend.record(key, HOUR, now)?;

    let minute_over = minute.count > limits.per_minute as f64;
    let hour_over = hour.count > limits.per_hour as f64;

    if minute_over || hour_over {
        // Attribute the denial to the window that resets last so
        // retry_after is not before an instant where the other exceeded
        // window would still deny.
        let (limit, snapshot) = if minute_over && hour_over {
            if hour.reset_at > minute.reset_at {
                (limits.per_hour, hour)
            } else {
                (limits.per_minute, minute)
            }
        } else if minute_over {
            (limits.per_minute, minute)
        } else {
            (limits.per_hour, hour)
        };
        let retry_after = snapshot
            .reset_at
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        return Ok(Verdict::denied(limit, snapshot.reset_at, retry_after));
    }

    let minute_slack = (limits.per_minute as f64 - minute.count).floor().max(0.0) as u64;
    let hour_slack = (limits.per_hour as f64 - hour.count).floor().max(0.0) as u64;
    let (remaining, snapshot) = if minute_slack <= hour_slack {
        (minute_slack, minute)
    } else {
        (hour_slack, hour)
    };

    Ok(Verdict::allowed(
        limits.per_minute,
        remaining,
        snapshot.reset_at,
    ))
}
