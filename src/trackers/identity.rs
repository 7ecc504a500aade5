//! Authenticated identity tracking.
//!
//! Tracks per-identity request windows and quota tier assignment. Admin
//! identities bypass quota enforcement but their traffic is still
//! recorded, so usage stays observable.

use super::{check_windows, Verdict, HOUR, MINUTE};
use crate::backend::{BackendResult, StateBackend};
use crate::config::{ConfigError, ConfigResult, ConfigStore, LimitOutcome, RuleContext};
use crate::counter::{Dimension, RateLimitKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Mutable per-identity record.
#[derive(Debug, Clone)]
struct IdentityRecord {
    tier: Option<String>,
    is_admin: bool,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    total_requests: u64,
    denied_requests: u64,
}

impl IdentityRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            tier: None,
            is_admin: false,
            first_seen: now,
            last_seen: now,
            total_requests: 0,
            denied_requests: 0,
        }
    }
}

/// Point-in-time view of one identity record.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityStats {
    /// The tracked identity.
    pub identity_id: String,

    /// Assigned tier, if any.
    pub tier: Option<String>,

    /// Whether the identity bypasses quota enforcement.
    pub is_admin: bool,

    /// First time the identity was seen.
    pub first_seen: DateTime<Utc>,

    /// Most recent activity.
    pub last_seen: DateTime<Utc>,

    /// Requests checked for this identity.
    pub total_requests: u64,

    /// Requests this dimension denied.
    pub denied_requests: u64,
}

/// Tracks request rates and tier assignment per authenticated identity.
pub struct IdentityTracker {
    config: Arc<ConfigStore>,
    backend: Arc<dyn StateBackend>,
    records: RwLock<HashMap<String, IdentityRecord>>,
}

impl IdentityTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            config,
            backend,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Check one request for `identity_id`, recording it against both
    /// windows. Admins are recorded but never denied.
    pub fn check(
        &self,
        identity_id: &str,
        ctx: &RuleContext<'_>,
        now: DateTime<Utc>,
    ) -> BackendResult<Verdict> {
        let is_record_admin = {
            let mut records = self.records.write().unwrap();
            let record = records
                .entry(identity_id.to_string())
                .or_insert_with(|| IdentityRecord::new(now));
            record.last_seen = now;
            record.total_requests += 1;
            record.is_admin
        };

        let key = RateLimitKey::identity(identity_id);

        if is_record_admin {
            self.record_only(&key, now)?;
            return Ok(Verdict::unlimited());
        }

        let limits = match self
            .config
            .effective_limit(Dimension::Identity, ctx, None, now)
        {
            LimitOutcome::Unlimited => {
                self.record_only(&key, now)?;
                return Ok(Verdict::unlimited());
            }
            LimitOutcome::Blocked => {
                self.note_denied(identity_id);
                return Ok(Verdict::denied_with_reason("blocked"));
            }
            LimitOutcome::Limits(limits) => limits,
        };

        let verdict = check_windows(self.backend.as_ref(), &key, &limits, now)?;
        if !verdict.allowed {
            self.note_denied(identity_id);
        }
        Ok(verdict)
    }

    /// Resolve the tier name to use for a caller: the record's assigned
    /// tier first, then a caller-supplied claim (accepted only if it is a
    /// configured tier), then the most restrictive configured tier.
    #[must_use]
    pub fn resolve_tier(&self, identity_id: Option<&str>, claimed: Option<&str>) -> Option<String> {
        if let Some(id) = identity_id {
            let records = self.records.read().unwrap();
            if let Some(tier) = records.get(id).and_then(|r| r.tier.clone()) {
                return Some(tier);
            }
        }

        let config = self.config.snapshot();
        if let Some(claimed) = claimed {
            if config.tier(claimed).is_some() {
                return Some(claimed.to_string());
            }
        }
        config.most_restrictive_tier().map(|tier| tier.name.clone())
    }

    /// Assign a configured tier to an identity.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the tier is not configured.
    pub fn assign_tier(&self, identity_id: &str, tier: &str, now: DateTime<Utc>) -> ConfigResult<()> {
        if self.config.snapshot().tier(tier).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "unknown tier '{tier}'"
            )));
        }

        let mut records = self.records.write().unwrap();
        let record = records
            .entry(identity_id.to_string())
            .or_insert_with(|| IdentityRecord::new(now));
        record.tier = Some(tier.to_string());
        info!(identity_id, tier, "tier assigned");
        Ok(())
    }

    /// Grant or revoke admin bypass for an identity.
    pub fn set_admin(&self, identity_id: &str, is_admin: bool, now: DateTime<Utc>) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(identity_id.to_string())
            .or_insert_with(|| IdentityRecord::new(now));
        record.is_admin = is_admin;
        info!(identity_id, is_admin, "admin flag updated");
    }

    /// Snapshot one identity record.
    #[must_use]
    pub fn get_stats(&self, identity_id: &str) -> Option<IdentityStats> {
        let records = self.records.read().unwrap();
        let record = records.get(identity_id)?;
        Some(IdentityStats {
            identity_id: identity_id.to_string(),
            tier: record.tier.clone(),
            is_admin: record.is_admin,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            total_requests: record.total_requests,
            denied_requests: record.denied_requests,
        })
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Drop records idle past `ttl`. Records with assignments (tier or
    /// admin) are retained. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, record| {
            record.is_admin
                || record.tier.is_some()
                || now.signed_duration_since(record.last_seen).num_seconds()
                    < ttl.as_secs() as i64
        });
        before - records.len()
    }

    /// Record both windows without evaluating limits (admin traffic).
    fn record_only(&self, key: &RateLimitKey, now: DateTime<Utc>) -> BackendResult<()> {
        self.backend.record(key, MINUTE, now)?;
        self.backend.record(key, HOUR, now)?;
        Ok(())
    }

    fn note_denied(&self, identity_id: &str) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(identity_id) {
            record.denied_requests += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::counter::datetime_from_secs;

    fn tracker() -> (IdentityTracker, Arc<dyn StateBackend>) {
        let backend: Arc<dyn StateBackend> = Arc::new(LocalBackend::new());
        let t = IdentityTracker::new(Arc::new(ConfigStore::with_defaults()), Arc::clone(&backend));
        (t, backend)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        datetime_from_secs(secs)
    }

    fn ctx<'a>(identity_id: &'a str, tier: &'a str) -> RuleContext<'a> {
        RuleContext {
            identity_id: Some(identity_id),
            tier: Some(tier),
            ..Default::default()
        }
    }

    #[test]
    fn test_tier_scales_identity_limit() {
        let (t, _) = tracker();
        t.assign_tier("u1", "gold", at(0)).unwrap();
        assert_eq!(t.resolve_tier(Some("u1"), None).as_deref(), Some("gold"));

        // Base 50/min at gold (x1.5) admits 75 requests in one bucket.
        let now = at(30);
        for i in 0..75 {
            let verdict = t.check("u1", &ctx("u1", "gold"), now).unwrap();
            assert!(verdict.allowed, "request {i} should be admitted");
        }
        let verdict = t.check("u1", &ctx("u1", "gold"), now).unwrap();
        assert!(!verdict.allowed);
        assert_eq!(verdict.limit, Some(75));
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let (t, _) = tracker();
        assert!(t.assign_tier("u1", "diamond", at(0)).is_err());
        assert!(t.get_stats("u1").is_none());
    }

    #[test]
    fn test_tier_resolution_order() {
        let (t, _) = tracker();
        // Unassigned and anonymous callers get the most restrictive tier.
        assert_eq!(
            t.resolve_tier(Some("stranger"), None).as_deref(),
            Some("bronze")
        );
        assert_eq!(t.resolve_tier(None, None).as_deref(), Some("bronze"));

        // A caller-supplied claim is honored only if configured.
        assert_eq!(
            t.resolve_tier(Some("stranger"), Some("gold")).as_deref(),
            Some("gold")
        );
        assert_eq!(
            t.resolve_tier(Some("stranger"), Some("diamond")).as_deref(),
            Some("bronze")
        );

        // An assigned tier wins over the claim.
        t.assign_tier("stranger", "platinum", at(0)).unwrap();
        assert_eq!(
            t.resolve_tier(Some("stranger"), Some("gold")).as_deref(),
            Some("platinum")
        );
    }

    #[test]
    fn test_admin_bypasses_but_is_recorded() {
        let (t, backend) = tracker();
        t.set_admin("root", true, at(0));

        let now = at(30);
        for _ in 0..200 {
            let verdict = t.check("root", &ctx("root", "bronze"), now).unwrap();
            assert!(verdict.allowed);
            assert!(verdict.limit.is_none());
        }

        // Usage is still visible in the counters.
        let key = RateLimitKey::identity("root");
        let snap = backend.peek(&key, MINUTE, now).unwrap();
        assert_eq!(snap.count as u64, 200);

        let stats = t.get_stats("root").unwrap();
        assert!(stats.is_admin);
        assert_eq!(stats.total_requests, 200);
        assert_eq!(stats.denied_requests, 0);
    }

    #[test]
    fn test_config_admin_override_bypasses() {
        let config = Arc::new(ConfigStore::with_defaults());
        config
            .mutate(|c| c.overrides.admins.push("ops".to_string()))
            .unwrap();
        let t = IdentityTracker::new(config, Arc::new(LocalBackend::new()));

        for _ in 0..100 {
            let verdict = t.check("ops", &ctx("ops", "bronze"), at(10)).unwrap();
            assert!(verdict.allowed);
        }
    }

    #[test]
    fn test_denied_requests_tracked_in_stats() {
        let (t, _) = tracker();
        let now = at(30);
        // Bronze halves the 50/min base to 25.
        for _ in 0..30 {
            t.check("u2", &ctx("u2", "bronze"), now).unwrap();
        }
        let stats = t.get_stats("u2").unwrap();
        assert_eq!(stats.total_requests, 30);
        assert_eq!(stats.denied_requests, 5);
    }

    #[test]
    fn test_sweep_retains_assigned_records() {
        let (t, _) = tracker();
        t.assign_tier("keeper", "silver", at(0)).unwrap();
        t.set_admin("root", true, at(0));
        t.check("drifter", &RuleContext::default(), at(0)).unwrap();

        let removed = t.sweep(at(10_000), Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(t.get_stats("keeper").is_some());
        assert!(t.get_stats("root").is_some());
        assert!(t.get_stats("drifter").is_none());
    }
}
