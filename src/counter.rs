//! Two-bucket sliding window counter.
//!
//! Tracks "how many events occurred in the trailing window ending now" in
//! O(1) space per key: a current and a previous fixed bucket, with the
//! previous bucket weighted by how much of the current bucket has elapsed.
//! Error is bounded to one window's worth of skew.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Tracking dimension for a counter stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// Caller network address.
    Address,

    /// Authenticated identity.
    Identity,

    /// Invoked operation.
    Operation,
}

impl Dimension {
    /// Stable name used in counter keys and decisions.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Address => "address",
            Self::Identity => "identity",
            Self::Operation => "operation",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one counter stream: a dimension plus an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Which dimension the stream belongs to.
    pub dimension: Dimension,

    /// The tracked identifier (address, identity id, or operation name).
    pub identifier: String,
}

impl RateLimitKey {
    /// Create a new key.
    #[must_use]
    pub fn new(dimension: Dimension, identifier: impl Into<String>) -> Self {
        Self {
            dimension,
            identifier: identifier.into(),
        }
    }

    /// Key for an address stream.
    #[must_use]
    pub fn address(address: impl Into<String>) -> Self {
        Self::new(Dimension::Address, address)
    }

    /// Key for an identity stream.
    #[must_use]
    pub fn identity(identity_id: impl Into<String>) -> Self {
        Self::new(Dimension::Identity, identity_id)
    }

    /// Key for an operation stream.
    #[must_use]
    pub fn operation(name: impl Into<String>) -> Self {
        Self::new(Dimension::Operation, name)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dimension, self.identifier)
    }
}

/// Convert unix seconds into a UTC timestamp.
pub(crate) fn datetime_from_secs(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Per-key window state: current and previous fixed buckets.
///
/// All operations take the caller's timestamp rather than reading the
/// system clock, so decisions are reproducible and testable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowState {
    /// Window size in seconds.
    window_secs: u64,

    /// Start of the current bucket (unix seconds, floor-aligned).
    bucket_start: u64,

    /// Events recorded in the current bucket.
    current: u64,

    /// Events recorded in the previous bucket.
    previous: u64,
}

impl WindowState {
    /// Create an empty window state.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window_secs: window.as_secs().max(1),
            bucket_start: 0,
            current: 0,
            previous: 0,
        }
    }

    /// Window size.
    #[must_use]
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Record one event and return the weighted count including it.
    pub fn record(&mut self, now: DateTime<Utc>) -> f64 {
        self.roll(now);
        self.current += 1;
        self.weighted(now)
    }

    /// Weighted count without recording (rolls the bucket if stale).
    pub fn peek(&mut self, now: DateTime<Utc>) -> f64 {
        self.roll(now);
        self.weighted(now)
    }

    /// Zero both buckets.
    pub fn reset(&mut self) {
        self.current = 0;
        self.previous = 0;
    }

    /// When the current bucket ends.
    #[must_use]
    pub fn reset_at(&self) -> DateTime<Utc> {
        datetime_from_secs((self.bucket_start + self.window_secs) as i64)
    }

    /// Whether this state has been idle past `ttl` and can no longer
    /// influence a weighted count. Requires two full windows since the
    /// bucket started, so a rotation after removal yields the same zeros
    /// a fresh state would.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let now_secs = now.timestamp().max(0) as u64;
        let bucket_end = self.bucket_start + self.window_secs;
        now_secs >= self.bucket_start + self.window_secs * 2
            && now_secs.saturating_sub(bucket_end) >= ttl.as_secs()
    }

    /// Weighted count: current plus the previous bucket scaled by the
    /// unexpired fraction of the current bucket.
    #[must_use]
    pub fn weighted(&self, now: DateTime<Utc>) -> f64 {
        let now_f = now.timestamp_millis() as f64 / 1000.0;
        let elapsed = now_f - self.bucket_start as f64;
        let fraction = (elapsed / self.window_secs as f64).clamp(0.0, 1.0);
        self.current as f64 + self.previous as f64 * (1.0 - fraction)
    }

    /// Rotate buckets if `now` has moved past the current one. The bucket
    /// start never decreases; a stale timestamp is treated as in-bucket.
    fn roll(&mut self, now: DateTime<Utc>) {
        let now_secs = now.timestamp().max(0) as u64;
        let start = now_secs / self.window_secs * self.window_secs;
        if start <= self.bucket_start {
            return;
        }
        self.previous = if start == self.bucket_start + self.window_secs {
            self.current
        } else {
            0
        };
        self.current = 0;
        self.bucket_start = start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        datetime_from_secs(secs)
    }

    #[test]
    fn test_key_display() {
        assert_eq!(RateLimitKey::address("1.2.3.4").to_string(), "address:1.2.3.4");
        assert_eq!(RateLimitKey::identity("u1").to_string(), "identity:u1");
        assert_eq!(
            RateLimitKey::operation("search").to_string(),
            "operation:search"
        );
    }

    #[test]
    fn test_record_within_bucket() {
        let mut w = WindowState::new(Duration::from_secs(60));
        assert_eq!(w.record(at(1000)) as u64, 1);
        assert_eq!(w.record(at(1010)) as u64, 2);
        assert_eq!(w.peek(at(1020)) as u64, 2);
    }

    #[test]
    fn test_rotation_shifts_current_to_previous() {
        let mut w = WindowState::new(Duration::from_secs(60));
        for _ in 0..10 {
            w.record(at(30));
        }

        // Start of the next bucket: previous still fully weighted.
        let count = w.peek(at(60));
        assert!((count - 10.0).abs() < f64::EPSILON);

        // Halfway through: previous weighted by half.
        let count = w.peek(at(90));
        assert!((count - 5.0).abs() < 0.01);

        // End of the next bucket: previous fully expired.
        let count = w.peek(at(119));
        assert!(count < 0.2);
    }

    #[test]
    fn test_gap_larger_than_one_window_zeroes_previous() {
        let mut w = WindowState::new(Duration::from_secs(60));
        for _ in 0..10 {
            w.record(at(30));
        }

        // Two windows later nothing carries over.
        assert_eq!(w.record(at(150)) as u64, 1);
    }

    #[test]
    fn test_bucket_start_is_non_decreasing() {
        let mut w = WindowState::new(Duration::from_secs(60));
        w.record(at(120));
        // A stale timestamp must not rewind the bucket.
        let count = w.record(at(60));
        assert_eq!(count as u64, 2);
    }

    #[test]
    fn test_reset_zeroes_counts() {
        let mut w = WindowState::new(Duration::from_secs(60));
        w.record(at(10));
        w.record(at(10));
        w.reset();
        assert_eq!(w.peek(at(11)) as u64, 0);
    }

    #[test]
    fn test_reset_at_is_bucket_end() {
        let mut w = WindowState::new(Duration::from_secs(60));
        w.record(at(75));
        assert_eq!(w.reset_at(), at(120));
    }

    #[test]
    fn test_expiry_needs_two_windows_and_ttl() {
        let mut w = WindowState::new(Duration::from_secs(60));
        w.record(at(30));

        assert!(!w.is_expired(at(90), Duration::from_secs(0)));
        assert!(w.is_expired(at(120), Duration::from_secs(0)));
        assert!(!w.is_expired(at(120), Duration::from_secs(120)));
        assert!(w.is_expired(at(200), Duration::from_secs(120)));
    }
}
