//! Request admission engine.
//!
//! [`RequestTracker`] is the facade the gateway calls per request: it
//! fans one request out to the address, identity and operation trackers,
//! combines their verdicts into a single [`Decision`], and exposes the
//! administrative surface (tier assignment, blocking, custom limits,
//! configuration reload, background maintenance).

use crate::backend::{create_backend, StateBackend};
use crate::config::{
    ConfigFormat, ConfigStore, ConfigWatcher, EngineConfig, LimitSet, RuleConfig, RuleContext,
    TimeWindowConfig, WatcherConfig,
};
use crate::counter::{Dimension, RateLimitKey};
use crate::error::EngineResult;
use crate::trackers::{
    AddressStats, AddressTracker, GeoInfo, IdentityStats, IdentityTracker, OperationStats,
    OperationTracker, Verdict,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One request as seen by the admission engine.
///
/// The timestamp is injectable so decisions are reproducible; it
/// defaults to the wall clock.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Caller network address.
    pub address: Option<String>,

    /// Authenticated identity, absent for anonymous callers.
    pub identity_id: Option<String>,

    /// Tier claimed by the caller's credentials. Used only when the
    /// identity has no assigned tier, and only if it is configured.
    pub tier: Option<String>,

    /// Invoked operation name.
    pub operation: Option<String>,

    /// When the request arrived.
    pub timestamp: DateTime<Utc>,
}

impl RequestContext {
    /// Create an empty context stamped with the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            address: None,
            identity_id: None,
            tier: None,
            operation: None,
            timestamp: Utc::now(),
        }
    }

    /// Set the caller address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the authenticated identity.
    #[must_use]
    pub fn with_identity(mut self, identity_id: impl Into<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self
    }

    /// Set the tier claimed by the caller's credentials.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Set the invoked operation.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set an explicit timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The combined admission decision for one request.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    /// Whether the request is admitted.
    pub allowed: bool,

    /// The dimension that denied the request, `null` when admitted.
    pub limiting_dimension: Option<Dimension>,

    /// The per-minute limit on the deciding dimension, if one applied.
    pub limit: Option<u64>,

    /// Requests left on the tightest dimension, if quotas applied.
    pub remaining: Option<u64>,

    /// When the deciding window's current bucket ends.
    pub reset_at: Option<DateTime<Utc>>,

    /// Seconds the caller should wait before retrying, on denial.
    pub retry_after_seconds: Option<u64>,

    /// Denial reason when the request was not a plain quota overrun.
    pub block_reason: Option<String>,
}

impl Decision {
    fn admitted() -> Self {
        Self {
            allowed: true,
            limiting_dimension: None,
            limit: None,
            remaining: None,
            reset_at: None,
            retry_after_seconds: None,
            block_reason: None,
        }
    }

    fn denied_by(dimension: Dimension, verdict: &Verdict) -> Self {
        Self {
            allowed: false,
            limiting_dimension: Some(dimension),
            limit: verdict.limit,
            remaining: verdict.remaining,
            reset_at: verdict.reset_at,
            retry_after_seconds: verdict
                .retry_after
                .map(|d| d.as_secs_f64().ceil() as u64),
            block_reason: verdict.reason.clone(),
        }
    }
}

/// Aggregate engine counters.
#[derive(Debug)]
pub struct EngineStats {
    started_at: Instant,
    total_requests: AtomicU64,
    allowed_requests: AtomicU64,
    denied_requests: AtomicU64,
    denied_by_address: AtomicU64,
    denied_by_identity: AtomicU64,
    denied_by_operation: AtomicU64,
    backend_failures: AtomicU64,
    config_reloads: AtomicU64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            allowed_requests: AtomicU64::new(0),
            denied_requests: AtomicU64::new(0),
            denied_by_address: AtomicU64::new(0),
            denied_by_identity: AtomicU64::new(0),
            denied_by_operation: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            config_reloads: AtomicU64::new(0),
        }
    }
}

impl EngineStats {
    fn note_denial(&self, dimension: Option<Dimension>) {
        self.denied_requests.fetch_add(1, Ordering::Relaxed);
        let counter = match dimension {
            Some(Dimension::Address) => &self.denied_by_address,
            Some(Dimension::Identity) => &self.denied_by_identity,
            Some(Dimension::Operation) => &self.denied_by_operation,
            None => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let denied = self.denied_requests.load(Ordering::Relaxed);
        let uptime = self.started_at.elapsed().as_secs_f64();
        EngineStatsSnapshot {
            total_requests: total,
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            denied_requests: denied,
            denied_by_address: self.denied_by_address.load(Ordering::Relaxed),
            denied_by_identity: self.denied_by_identity.load(Ordering::Relaxed),
            denied_by_operation: self.denied_by_operation.load(Ordering::Relaxed),
            denial_rate: if total == 0 {
                0.0
            } else {
                denied as f64 / total as f64
            },
            requests_per_second: if uptime > 0.0 {
                total as f64 / uptime
            } else {
                0.0
            },
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
            config_reloads: self.config_reloads.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`EngineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    /// Requests checked.
    pub total_requests: u64,

    /// Requests admitted.
    pub allowed_requests: u64,

    /// Requests denied.
    pub denied_requests: u64,

    /// Denials attributed to the address dimension.
    pub denied_by_address: u64,

    /// Denials attributed to the identity dimension.
    pub denied_by_identity: u64,

    /// Denials attributed to the operation dimension.
    pub denied_by_operation: u64,

    /// Fraction of checked requests that were denied.
    pub denial_rate: f64,

    /// Average request rate since the tracker was created.
    pub requests_per_second: f64,

    /// Dimension checks that failed in the counter backend.
    pub backend_failures: u64,

    /// Successful configuration swaps.
    pub config_reloads: u64,
}

/// Shutdown handle for a spawned background task.
struct TaskHandle {
    shutdown_tx: mpsc::Sender<()>,
}

/// The admission-control facade.
pub struct RequestTracker {
    config: Arc<ConfigStore>,
    backend: Arc<dyn StateBackend>,
    addresses: AddressTracker,
    identities: IdentityTracker,
    operations: OperationTracker,
    stats: EngineStats,
    sweeper: Mutex<Option<TaskHandle>>,
    watcher: Mutex<Option<ConfigWatcher>>,
}

impl RequestTracker {
    /// Create a tracker with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(ConfigStore::with_defaults()))
    }

    /// Create a tracker from a configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn with_config(config: EngineConfig) -> EngineResult<Self> {
        Ok(Self::with_store(Arc::new(ConfigStore::new(config)?)))
    }

    /// Create a tracker over an existing configuration store. The counter
    /// backend is built from the store's backend section.
    #[must_use]
    pub fn with_store(config: Arc<ConfigStore>) -> Self {
        let backend = create_backend(&config.snapshot().backend);
        Self::with_backend(config, backend)
    }

    /// Create a tracker with an explicit counter backend, so several
    /// instances can share one store.
    #[must_use]
    pub fn with_backend(config: Arc<ConfigStore>, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            addresses: AddressTracker::new(Arc::clone(&config), Arc::clone(&backend)),
            identities: IdentityTracker::new(Arc::clone(&config), Arc::clone(&backend)),
            operations: OperationTracker::new(Arc::clone(&config), Arc::clone(&backend)),
            config,
            backend,
            stats: EngineStats::default(),
            sweeper: Mutex::new(None),
            watcher: Mutex::new(None),
        }
    }

    /// Check one request against every applicable dimension.
    ///
    /// All dimensions are evaluated and recorded even when an early one
    /// denies, so counters stay consistent; the decision reports the
    /// first denying dimension in address, identity, operation order.
    pub fn check(&self, ctx: &RequestContext) -> Decision {
        let started = Instant::now();
        let now = ctx.timestamp;
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);

        let tier = self
            .identities
            .resolve_tier(ctx.identity_id.as_deref(), ctx.tier.as_deref());
        let error_rate = ctx
            .operation
            .as_deref()
            .and_then(|op| self.operations.error_rate(op));
        let rule_ctx = RuleContext {
            address: ctx.address.as_deref(),
            identity_id: ctx.identity_id.as_deref(),
            tier: tier.as_deref(),
            operation: ctx.operation.as_deref(),
            error_rate,
        };

        let mut verdicts: Vec<(Dimension, Verdict)> = Vec::with_capacity(3);

        if let Some(address) = ctx.address.as_deref() {
            let verdict = self
                .addresses
                .check(address, &rule_ctx, now)
                .unwrap_or_else(|e| self.backend_denial(Dimension::Address, &e));
            verdicts.push((Dimension::Address, verdict));
        }
        if let Some(identity_id) = ctx.identity_id.as_deref() {
            let verdict = self
                .identities
                .check(identity_id, &rule_ctx, now)
                .unwrap_or_else(|e| self.backend_denial(Dimension::Identity, &e));
            verdicts.push((Dimension::Identity, verdict));
        }
        if let Some(operation) = ctx.operation.as_deref() {
            let verdict = self
                .operations
                .check(operation, &rule_ctx, now)
                .unwrap_or_else(|e| self.backend_denial(Dimension::Operation, &e));
            verdicts.push((Dimension::Operation, verdict));
        }

        let decision = self.combine(&verdicts);

        if decision.allowed {
            self.stats.allowed_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.note_denial(decision.limiting_dimension);

            // A quota overrun raises the address's suspicion score; a
            // blocklist hit does not feed back into itself.
            if decision.block_reason.is_none() {
                if let Some(address) = ctx.address.as_deref() {
                    self.addresses.note_violation(address, now);
                }
            }

            info!(
                address = ctx.address.as_deref().unwrap_or("-"),
                identity = ctx.identity_id.as_deref().unwrap_or("-"),
                operation = ctx.operation.as_deref().unwrap_or("-"),
                dimension = decision.limiting_dimension.map_or("-", |d| d.as_str()),
                reason = decision.block_reason.as_deref().unwrap_or("limit"),
                "request denied"
            );
        }

        debug!(
            allowed = decision.allowed,
            dimensions_checked = verdicts.len(),
            limiting_dimension = decision.limiting_dimension.map(|d| d.as_str()),
            elapsed_micros = started.elapsed().as_micros() as u64,
            "admission check"
        );
        decision
    }

    fn backend_denial(&self, dimension: Dimension, error: &crate::backend::BackendError) -> Verdict {
        self.stats.backend_failures.fetch_add(1, Ordering::Relaxed);
        error!(dimension = dimension.as_str(), error = %error, "backend check failed");
        Verdict::denied_with_reason("state backend failure")
    }

    /// Combine per-dimension verdicts: a single denial denies; the
    /// admitted decision carries the tightest remaining quota.
    fn combine(&self, verdicts: &[(Dimension, Verdict)]) -> Decision {
        for (dimension, verdict) in verdicts {
            if !verdict.allowed {
                return Decision::denied_by(*dimension, verdict);
            }
        }

        let mut decision = Decision::admitted();
        for (_, verdict) in verdicts {
            let Some(remaining) = verdict.remaining else {
                continue;
            };
            if decision.remaining.map_or(true, |best| remaining < best) {
                decision.remaining = Some(remaining);
                decision.limit = verdict.limit;
                decision.reset_at = verdict.reset_at;
            }
        }
        decision
    }

    // --- administrative surface -----------------------------------------

    /// Assign a configured tier to an identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the tier is not configured.
    pub fn assign_tier(&self, identity_id: &str, tier: &str) -> EngineResult<()> {
        self.identities.assign_tier(identity_id, tier, Utc::now())?;
        Ok(())
    }

    /// Grant or revoke admin bypass for an identity.
    pub fn set_admin(&self, identity_id: &str, is_admin: bool) {
        self.identities.set_admin(identity_id, is_admin, Utc::now());
    }

    /// Block an address with a reason.
    pub fn block_address(&self, address: &str, reason: impl Into<String>) {
        self.addresses.block(address, reason, Utc::now());
    }

    /// Unblock an address: clears the runtime block and removes the
    /// address from the configuration blocklist so a reload cannot
    /// silently re-block it. Returns whether a runtime block was lifted.
    pub fn unblock_address(&self, address: &str) -> EngineResult<bool> {
        let was_blocked = self.addresses.unblock(address);

        let in_config = self.config.snapshot().overrides.blocked_addresses.iter()
            .any(|entry| entry == address);
        if in_config {
            self.config.mutate(|config| {
                config.overrides.blocked_addresses.retain(|entry| entry != address);
            })?;
        }
        Ok(was_blocked || in_config)
    }

    /// Attach geographic info to an address.
    pub fn set_geo_info(&self, address: &str, geo: GeoInfo) {
        self.addresses.set_geo_info(address, geo, Utc::now());
    }

    /// Drop all counter windows for one identifier, restoring its full
    /// quota (support interventions, test resets).
    ///
    /// # Errors
    ///
    /// Returns an error if the counter backend rejects the reset.
    pub fn reset_counters(&self, dimension: Dimension, identifier: &str) -> EngineResult<()> {
        let key = RateLimitKey::new(dimension, identifier);
        self.backend.reset(&key)?;
        info!(key = %key, "counters reset");
        Ok(())
    }

    /// Replace (or clear) the base limits for one operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the limits contain a zero quota.
    pub fn set_operation_limits(
        &self,
        operation: &str,
        limits: Option<LimitSet>,
    ) -> EngineResult<()> {
        self.operations
            .set_custom_limits(operation, limits, Utc::now())?;
        Ok(())
    }

    /// Report the outcome of an executed request.
    pub fn report_outcome(&self, operation: &str, success: bool, latency: Duration) {
        self.operations
            .report_outcome(operation, success, latency, Utc::now());
    }

    /// Add a time window to the active configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn add_time_window(&self, window: TimeWindowConfig) -> EngineResult<()> {
        self.config.mutate(|config| config.time_windows.push(window))?;
        Ok(())
    }

    /// Add a rule to the active configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting configuration is invalid.
    pub fn add_rule(&self, rule: RuleConfig) -> EngineResult<()> {
        self.config.mutate(|config| config.rules.push(rule))?;
        Ok(())
    }

    /// Validate and atomically install a new configuration.
    ///
    /// # Errors
    ///
    /// Returns an error and keeps the active configuration if the new
    /// document is invalid.
    pub fn reload_config(&self, config: EngineConfig) -> EngineResult<()> {
        self.config.load(config)?;
        self.stats.config_reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Restore the configuration replaced by the last swap.
    ///
    /// # Errors
    ///
    /// Returns an error if nothing has been replaced.
    pub fn rollback_config(&self) -> EngineResult<()> {
        self.config.rollback()?;
        Ok(())
    }

    /// Serialize the active configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn export_config(&self, format: ConfigFormat) -> EngineResult<Vec<u8>> {
        Ok(self.config.export(format)?)
    }

    /// Parse and atomically install a serialized configuration.
    ///
    /// # Errors
    ///
    /// Returns an error and keeps the active configuration if the
    /// document is unparsable or invalid.
    pub fn import_config(&self, bytes: &[u8], format: ConfigFormat) -> EngineResult<()> {
        self.config.import(bytes, format)?;
        self.stats.config_reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The configuration store backing this tracker.
    #[must_use]
    pub fn config(&self) -> Arc<ConfigStore> {
        Arc::clone(&self.config)
    }

    /// Aggregate engine counters.
    #[must_use]
    pub fn get_stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Snapshot one address record.
    #[must_use]
    pub fn get_address_stats(&self, address: &str) -> Option<AddressStats> {
        self.addresses.get_stats(address, Utc::now())
    }

    /// Snapshot one identity record.
    #[must_use]
    pub fn get_identity_stats(&self, identity_id: &str) -> Option<IdentityStats> {
        self.identities.get_stats(identity_id)
    }

    /// Snapshot one operation record.
    #[must_use]
    pub fn get_operation_stats(&self, operation: &str) -> Option<OperationStats> {
        self.operations.get_stats(operation)
    }

    // --- maintenance -----------------------------------------------------

    /// Evict idle records and counters as of `now`. Returns the number of
    /// entries removed. Safe to call repeatedly.
    pub fn sweep_now(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.snapshot().eviction.idle_ttl;
        let removed = self.addresses.sweep(now, ttl)
            + self.identities.sweep(now, ttl)
            + self.operations.sweep(now, ttl)
            + self.backend.sweep(now, ttl);
        if removed > 0 {
            debug!(removed, "eviction sweep");
        }
        removed
    }

    /// Start the periodic eviction sweep in the background.
    pub fn start_eviction_sweep(self: &Arc<Self>, interval: Duration) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.sweeper.lock().unwrap() = Some(TaskHandle { shutdown_tx });

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracker.sweep_now(Utc::now());
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        info!(interval_secs = interval.as_secs(), "eviction sweep started");
    }

    /// Start hot-reloading the configuration from a file.
    pub fn start_hot_reload(&self, path: impl AsRef<Path>, poll_interval: Duration) {
        let mut watcher = ConfigWatcher::with_store(
            path,
            Arc::clone(&self.config),
            WatcherConfig::default().with_poll_interval(poll_interval),
        );
        let mut events = watcher.start();
        *self.watcher.lock().unwrap() = Some(watcher);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    crate::config::ConfigEvent::Reloaded => {}
                    crate::config::ConfigEvent::Error(e) => {
                        warn!(error = %e, "hot-reload rejected");
                    }
                }
            }
        });
    }

    /// Stop the hot-reload poller, if running.
    pub async fn stop_hot_reload(&self) {
        let watcher = self.watcher.lock().unwrap().take();
        if let Some(mut watcher) = watcher {
            watcher.stop().await;
        }
    }

    /// Stop the background sweeper and watcher, if running.
    pub async fn stop_background_tasks(&self) {
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(()).await;
        }
        self.stop_hot_reload().await;
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::datetime_from_secs;

    fn at(secs: i64) -> DateTime<Utc> {
        datetime_from_secs(secs)
    }

    fn request(secs: i64) -> RequestContext {
        RequestContext::new()
            .with_address("1.2.3.4")
            .with_identity("u1")
            .with_operation("search")
            .at(at(secs))
    }

    #[test]
    fn test_admitted_request_reports_tightest_quota() {
        let tracker = RequestTracker::new();
        tracker.assign_tier("u1", "silver").unwrap();

        let decision = tracker.check(&request(30));
        assert!(decision.allowed);
        assert!(decision.limiting_dimension.is_none());
        // Identity (50/min at silver) is the tightest dimension.
        assert_eq!(decision.limit, Some(50));
        assert_eq!(decision.remaining, Some(49));
    }

    #[test]
    fn test_denial_attributed_to_first_denying_dimension() {
        let tracker = RequestTracker::new();
        tracker.assign_tier("u1", "silver").unwrap();

        // Identity limit (50/min) binds first; address allows 100/min.
        let mut denied = None;
        for _ in 0..60 {
            let decision = tracker.check(&request(30));
            if !decision.allowed {
                denied = Some(decision);
                break;
            }
        }
        let decision = denied.expect("identity limit should bind");
        assert_eq!(decision.limiting_dimension, Some(Dimension::Identity));
        assert_eq!(decision.limit, Some(50));
        assert!(decision.retry_after_seconds.is_some());
    }

    #[test]
    fn test_anonymous_request_skips_identity_dimension() {
        let tracker = RequestTracker::new();
        let ctx = RequestContext::new()
            .with_address("5.5.5.5")
            .with_operation("search")
            .at(at(30));

        for _ in 0..60 {
            // Would exceed the 50/min identity base; no identity, no check.
            let decision = tracker.check(&ctx);
            if decision.allowed {
                continue;
            }
            // Address (100/min) binds before operation (200/min).
            assert_eq!(decision.limiting_dimension, Some(Dimension::Address));
            return;
        }
    }

    #[test]
    fn test_stats_track_allowed_and_denied() {
        let tracker = RequestTracker::new();
        let ctx = RequestContext::new().with_address("9.9.9.9").at(at(30));

        for _ in 0..110 {
            tracker.check(&ctx);
        }
        let stats = tracker.get_stats();
        assert_eq!(stats.total_requests, 110);
        assert_eq!(stats.allowed_requests, 100);
        assert_eq!(stats.denied_requests, 10);
        assert_eq!(stats.denied_by_address, 10);
        assert!((stats.denial_rate - 10.0 / 110.0).abs() < 1e-9);
    }

    #[test]
    fn test_quota_denials_raise_suspicion_and_auto_block() {
        let tracker = RequestTracker::new();
        let ctx = RequestContext::new().with_address("6.6.6.6").at(at(30));

        // 100 admitted, then 10 violations cross the default threshold.
        for _ in 0..110 {
            tracker.check(&ctx);
        }

        let stats = tracker.get_address_stats("6.6.6.6").unwrap();
        assert!(stats.blocked);
        assert_eq!(
            stats.block_reason.as_deref(),
            Some("auto: suspicious activity")
        );

        // Once blocked, denials are attributed to the block.
        let decision = tracker.check(&ctx);
        assert!(!decision.allowed);
        assert_eq!(decision.block_reason.as_deref(), Some("blocked"));
    }

    #[test]
    fn test_unblock_clears_runtime_and_config_blocks() {
        let tracker = RequestTracker::new();
        tracker.block_address("4.4.4.4", "manual");
        tracker
            .config()
            .mutate(|c| c.overrides.blocked_addresses.push("4.4.4.4".to_string()))
            .unwrap();

        assert!(tracker.unblock_address("4.4.4.4").unwrap());
        let ctx = RequestContext::new().with_address("4.4.4.4").at(at(30));
        assert!(tracker.check(&ctx).allowed);
    }

    #[test]
    fn test_reset_counters_restores_quota() {
        let config = EngineConfig::default()
            .with_limits(Dimension::Address, LimitSet::new(2, 20));
        let tracker = RequestTracker::with_config(config).unwrap();
        let ctx = RequestContext::new().with_address("3.3.3.3").at(at(30));

        assert!(tracker.check(&ctx).allowed);
        assert!(tracker.check(&ctx).allowed);
        assert!(!tracker.check(&ctx).allowed);

        tracker.reset_counters(Dimension::Address, "3.3.3.3").unwrap();
        assert!(tracker.check(&ctx).allowed);
    }

    #[test]
    fn test_sweep_now_removes_idle_state() {
        let tracker = RequestTracker::new();
        let ctx = RequestContext::new().with_address("1.1.1.1").at(at(0));
        tracker.check(&ctx);

        // Default TTL is one hour; two hours later everything is idle.
        let removed = tracker.sweep_now(at(7200));
        assert!(removed >= 1);
        assert!(tracker.get_address_stats("1.1.1.1").is_none());
        assert_eq!(tracker.sweep_now(at(7200)), 0);
    }
}
