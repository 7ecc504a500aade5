//! Caller address tracking.
//!
//! Tracks per-address request windows, a decaying suspicion score fed by
//! rate-limit violations, and blocking (manual or automatic). Blocked
//! addresses are denied before any counter is consulted.

use super::{check_windows, Verdict};
use crate::backend::{BackendResult, StateBackend};
use crate::config::{ConfigStore, LimitOutcome, RuleContext};
use crate::counter::{Dimension, RateLimitKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Geographic annotation for an address, provided by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeoInfo {
    /// ISO country code.
    pub country: String,

    /// City name, if resolved.
    pub city: Option<String>,
}

/// Mutable per-address record.
#[derive(Debug, Clone)]
struct AddressRecord {
    suspicion: f64,
    suspicion_updated: DateTime<Utc>,
    blocked: bool,
    block_reason: Option<String>,
    geo: Option<GeoInfo>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    total_requests: u64,
    denied_requests: u64,
}

impl AddressRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            suspicion: 0.0,
            suspicion_updated: now,
            blocked: false,
            block_reason: None,
            geo: None,
            first_seen: now,
            last_seen: now,
            total_requests: 0,
            denied_requests: 0,
        }
    }

    /// Apply exponential decay to the suspicion score up to `now`.
    fn decay_suspicion(&mut self, now: DateTime<Utc>, half_life: Duration) {
        let elapsed = now
            .signed_duration_since(self.suspicion_updated)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let half_life_secs = half_life.as_secs_f64().max(f64::EPSILON);
        self.suspicion *= 0.5_f64.powf(elapsed / half_life_secs);
        self.suspicion_updated = now;
    }
}

/// Point-in-time view of one address record.
#[derive(Debug, Clone, Serialize)]
pub struct AddressStats {
    /// The tracked address.
    pub address: String,

    /// Current suspicion score after decay.
    pub suspicion_score: f64,

    /// Whether the address is blocked.
    pub blocked: bool,

    /// Why it was blocked, if it is.
    pub block_reason: Option<String>,

    /// Geographic annotation, if set.
    pub geo: Option<GeoInfo>,

    /// First time the address was seen.
    pub first_seen: DateTime<Utc>,

    /// Most recent activity.
    pub last_seen: DateTime<Utc>,

    /// Requests checked for this address.
    pub total_requests: u64,

    /// Requests this dimension denied.
    pub denied_requests: u64,
}

/// Tracks request rates and reputation per caller address.
pub struct AddressTracker {
    config: Arc<ConfigStore>,
    backend: Arc<dyn StateBackend>,
    records: RwLock<HashMap<String, AddressRecord>>,
}

impl AddressTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            config,
            backend,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Check one request for `address`, recording it against both windows.
    /// Blocked addresses are denied without touching the counters.
    pub fn check(
        &self,
        address: &str,
        ctx: &RuleContext<'_>,
        now: DateTime<Utc>,
    ) -> BackendResult<Verdict> {
        {
            let mut records = self.records.write().unwrap();
            let record = records
                .entry(address.to_string())
                .or_insert_with(|| AddressRecord::new(now));
            record.last_seen = now;
            record.total_requests += 1;

            if record.blocked {
                record.denied_requests += 1;
                return Ok(Verdict::denied_with_reason("blocked"));
            }
        }

        let limits = match self
            .config
            .effective_limit(Dimension::Address, ctx, None, now)
        {
            LimitOutcome::Blocked => {
                let mut records = self.records.write().unwrap();
                if let Some(record) = records.get_mut(address) {
                    record.denied_requests += 1;
                }
                return Ok(Verdict::denied_with_reason("blocked"));
            }
            LimitOutcome::Unlimited => return Ok(Verdict::unlimited()),
            LimitOutcome::Limits(limits) => limits,
        };

        let key = RateLimitKey::address(address);
        let verdict = check_windows(self.backend.as_ref(), &key, &limits, now)?;
        if !verdict.allowed {
            let mut records = self.records.write().unwrap();
            if let Some(record) = records.get_mut(address) {
                record.denied_requests += 1;
            }
        }
        Ok(verdict)
    }

    /// Bump the suspicion score after a rate-limit violation, auto-blocking
    /// the address if it crosses the configured threshold.
    pub fn note_violation(&self, address: &str, now: DateTime<Utc>) {
        let config = self.config.snapshot();
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(address.to_string())
            .or_insert_with(|| AddressRecord::new(now));

        record.decay_suspicion(now, config.suspicion.half_life);
        record.suspicion += config.suspicion.violation_increment;

        if !record.blocked && record.suspicion >= config.suspicion.block_threshold {
            record.blocked = true;
            record.block_reason = Some("auto: suspicious activity".to_string());
            warn!(
                address,
                score = record.suspicion,
                threshold = config.suspicion.block_threshold,
                "address auto-blocked"
            );
        }
    }

    /// Current suspicion score after decay.
    #[must_use]
    pub fn suspicion_score(&self, address: &str, now: DateTime<Utc>) -> f64 {
        let half_life = self.config.snapshot().suspicion.half_life;
        let mut records = self.records.write().unwrap();
        records.get_mut(address).map_or(0.0, |record| {
            record.decay_suspicion(now, half_life);
            record.suspicion
        })
    }

    /// Block an address with an explicit reason.
    pub fn block(&self, address: &str, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(address.to_string())
            .or_insert_with(|| AddressRecord::new(now));
        record.blocked = true;
        record.block_reason = Some(reason.clone());
        info!(address, reason, "address blocked");
    }

    /// Unblock an address and clear its suspicion score. Returns whether
    /// the address was blocked.
    pub fn unblock(&self, address: &str) -> bool {
        let mut records = self.records.write().unwrap();
        let Some(record) = records.get_mut(address) else {
            return false;
        };
        let was_blocked = record.blocked;
        record.blocked = false;
        record.block_reason = None;
        record.suspicion = 0.0;
        if was_blocked {
            info!(address, "address unblocked");
        }
        was_blocked
    }

    /// Whether an address is currently blocked at the record level.
    #[must_use]
    pub fn is_blocked(&self, address: &str) -> bool {
        self.records
            .read()
            .unwrap()
            .get(address)
            .is_some_and(|r| r.blocked)
    }

    /// Attach geographic info to an address record.
    pub fn set_geo_info(&self, address: &str, geo: GeoInfo, now: DateTime<Utc>) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(address.to_string())
            .or_insert_with(|| AddressRecord::new(now));
        record.geo = Some(geo);
    }

    /// Snapshot one address record.
    #[must_use]
    pub fn get_stats(&self, address: &str, now: DateTime<Utc>) -> Option<AddressStats> {
        let half_life = self.config.snapshot().suspicion.half_life;
        let mut records = self.records.write().unwrap();
        let record = records.get_mut(address)?;
        record.decay_suspicion(now, half_life);
        Some(AddressStats {
            address: address.to_string(),
            suspicion_score: record.suspicion,
            blocked: record.blocked,
            block_reason: record.block_reason.clone(),
            geo: record.geo.clone(),
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            total_requests: record.total_requests,
            denied_requests: record.denied_requests,
        })
    }

    /// Number of tracked addresses.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Drop records idle past `ttl`. Blocked records are retained so a
    /// block cannot be shed by going quiet. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, record| {
            record.blocked
                || now.signed_duration_since(record.last_seen).num_seconds() < ttl.as_secs() as i64
        });
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::counter::datetime_from_secs;

    fn tracker() -> AddressTracker {
        AddressTracker::new(
            Arc::new(ConfigStore::with_defaults()),
            Arc::new(LocalBackend::new()),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        datetime_from_secs(secs)
    }

    fn ctx(address: &str) -> RuleContext<'_> {
        RuleContext {
            address: Some(address),
            ..Default::default()
        }
    }

    #[test]
    fn test_check_within_limits_is_allowed() {
        let t = tracker();
        let verdict = t.check("1.2.3.4", &ctx("1.2.3.4"), at(10)).unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.limit, Some(100));
    }

    #[test]
    fn test_blocked_address_denied_before_counters() {
        let t = tracker();
        t.block("1.2.3.4", "manual", at(5));

        let verdict = t.check("1.2.3.4", &ctx("1.2.3.4"), at(10)).unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason.as_deref(), Some("blocked"));

        let stats = t.get_stats("1.2.3.4", at(10)).unwrap();
        assert!(stats.blocked);
        assert_eq!(stats.block_reason.as_deref(), Some("manual"));
    }

    #[test]
    fn test_unblock_clears_block_and_suspicion() {
        let t = tracker();
        t.block("1.2.3.4", "manual", at(5));
        t.note_violation("1.2.3.4", at(5));

        assert!(t.unblock("1.2.3.4"));
        assert!(!t.is_blocked("1.2.3.4"));
        assert_eq!(t.suspicion_score("1.2.3.4", at(5)), 0.0);
        assert!(t.check("1.2.3.4", &ctx("1.2.3.4"), at(10)).unwrap().allowed);

        // Unblocking an address that was never blocked reports false.
        assert!(!t.unblock("5.6.7.8"));
    }

    #[test]
    fn test_suspicion_accumulates_and_auto_blocks() {
        let t = tracker();
        // Default threshold is 10 with increment 1.
        for _ in 0..9 {
            t.note_violation("6.6.6.6", at(100));
        }
        assert!(!t.is_blocked("6.6.6.6"));

        t.note_violation("6.6.6.6", at(100));
        assert!(t.is_blocked("6.6.6.6"));
        let stats = t.get_stats("6.6.6.6", at(100)).unwrap();
        assert_eq!(
            stats.block_reason.as_deref(),
            Some("auto: suspicious activity")
        );
    }

    #[test]
    fn test_suspicion_decays_with_half_life() {
        let t = tracker();
        for _ in 0..8 {
            t.note_violation("7.7.7.7", at(0));
        }
        assert!((t.suspicion_score("7.7.7.7", at(0)) - 8.0).abs() < 1e-9);

        // One half-life (300s) later the score is halved.
        let score = t.suspicion_score("7.7.7.7", at(300));
        assert!((score - 4.0).abs() < 1e-6);
        assert!(!t.is_blocked("7.7.7.7"));
    }

    #[test]
    fn test_config_blocklist_denies() {
        let config = Arc::new(ConfigStore::with_defaults());
        config
            .mutate(|c| {
                c.overrides
                    .blocked_addresses
                    .push("192.168.0.0/16".to_string());
            })
            .unwrap();
        let t = AddressTracker::new(config, Arc::new(LocalBackend::new()));

        let verdict = t.check("192.168.1.50", &ctx("192.168.1.50"), at(10)).unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.reason.as_deref(), Some("blocked"));
    }

    #[test]
    fn test_geo_info_round_trips_through_stats() {
        let t = tracker();
        t.set_geo_info(
            "1.2.3.4",
            GeoInfo {
                country: "DE".to_string(),
                city: Some("Berlin".to_string()),
            },
            at(0),
        );
        let stats = t.get_stats("1.2.3.4", at(0)).unwrap();
        assert_eq!(stats.geo.unwrap().country, "DE");
    }

    #[test]
    fn test_sweep_keeps_blocked_and_recent_records() {
        let t = tracker();
        t.check("1.1.1.1", &ctx("1.1.1.1"), at(0)).unwrap();
        t.block("2.2.2.2", "manual", at(0));
        t.check("3.3.3.3", &ctx("3.3.3.3"), at(5000)).unwrap();

        let removed = t.sweep(at(5100), Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(t.get_stats("1.1.1.1", at(5100)).is_none());
        assert!(t.is_blocked("2.2.2.2"));
        assert!(t.get_stats("3.3.3.3", at(5100)).is_some());
    }
}
