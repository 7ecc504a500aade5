//! Operation (endpoint) tracking.
//!
//! Tracks per-operation request windows, optional custom limits that
//! replace the base limits for that operation, and post-hoc outcome
//! reports (success/failure, latency) that feed the observed error rate
//! used by rules.

use super::{check_windows, Verdict};
use crate::backend::{BackendResult, StateBackend};
use crate::config::{ConfigError, ConfigResult, ConfigStore, LimitOutcome, LimitSet, RuleContext};
use crate::counter::{Dimension, RateLimitKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Mutable per-operation record.
#[derive(Debug, Clone)]
struct OperationRecord {
    custom_limits: Option<LimitSet>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    total_requests: u64,
    denied_requests: u64,
    outcomes: u64,
    failures: u64,
    mean_latency_millis: f64,
}

impl OperationRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            custom_limits: None,
            first_seen: now,
            last_seen: now,
            total_requests: 0,
            denied_requests: 0,
            outcomes: 0,
            failures: 0,
            mean_latency_millis: 0.0,
        }
    }

    fn error_rate(&self) -> Option<f64> {
        if self.outcomes == 0 {
            None
        } else {
            Some(self.failures as f64 / self.outcomes as f64)
        }
    }
}

/// Point-in-time view of one operation record.
#[derive(Debug, Clone, Serialize)]
pub struct OperationStats {
    /// The tracked operation name.
    pub operation: String,

    /// Custom limits replacing the base limits, if set.
    pub custom_limits: Option<LimitSet>,

    /// First time the operation was invoked.
    pub first_seen: DateTime<Utc>,

    /// Most recent activity.
    pub last_seen: DateTime<Utc>,

    /// Requests checked for this operation.
    pub total_requests: u64,

    /// Requests this dimension denied.
    pub denied_requests: u64,

    /// Outcomes reported after execution.
    pub outcomes: u64,

    /// Reported failures.
    pub failures: u64,

    /// Observed failure fraction, when any outcome was reported.
    pub error_rate: Option<f64>,

    /// Running mean of reported latencies, in milliseconds.
    pub mean_latency_millis: f64,
}

/// Tracks request rates and observed outcomes per operation.
pub struct OperationTracker {
    config: Arc<ConfigStore>,
    backend: Arc<dyn StateBackend>,
    records: RwLock<HashMap<String, OperationRecord>>,
}

impl OperationTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            config,
            backend,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Check one request for `operation`, recording it against both
    /// windows. Custom limits, when set, replace the base limits; rules
    /// and overrides still take precedence.
    pub fn check(
        &self,
        operation: &str,
        ctx: &RuleContext<'_>,
        now: DateTime<Utc>,
    ) -> BackendResult<Verdict> {
        let custom_limits = {
            let mut records = self.records.write().unwrap();
            let record = records
                .entry(operation.to_string())
                .or_insert_with(|| OperationRecord::new(now));
            record.last_seen = now;
            record.total_requests += 1;
            record.custom_limits
        };

        let limits = match self
            .config
            .effective_limit(Dimension::Operation, ctx, custom_limits, now)
        {
            LimitOutcome::Unlimited => return Ok(Verdict::unlimited()),
            LimitOutcome::Blocked => {
                self.note_denied(operation);
                return Ok(Verdict::denied_with_reason("blocked"));
            }
            LimitOutcome::Limits(limits) => limits,
        };

        let key = RateLimitKey::operation(operation);
        let verdict = check_windows(self.backend.as_ref(), &key, &limits, now)?;
        if !verdict.allowed {
            self.note_denied(operation);
        }
        Ok(verdict)
    }

    /// Replace (or clear) the base limits for an operation.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the limits contain a zero quota.
    pub fn set_custom_limits(
        &self,
        operation: &str,
        limits: Option<LimitSet>,
        now: DateTime<Utc>,
    ) -> ConfigResult<()> {
        if let Some(limits) = &limits {
            limits.validate().map_err(ConfigError::ValidationError)?;
        }

        let mut records = self.records.write().unwrap();
        let record = records
            .entry(operation.to_string())
            .or_insert_with(|| OperationRecord::new(now));
        record.custom_limits = limits;
        info!(operation, ?limits, "custom operation limits updated");
        Ok(())
    }

    /// Report the outcome of an executed request. Feeds the observed
    /// error rate and the running latency mean.
    pub fn report_outcome(
        &self,
        operation: &str,
        success: bool,
        latency: Duration,
        now: DateTime<Utc>,
    ) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(operation.to_string())
            .or_insert_with(|| OperationRecord::new(now));
        record.outcomes += 1;
        if !success {
            record.failures += 1;
        }
        let millis = latency.as_secs_f64() * 1000.0;
        record.mean_latency_millis +=
            (millis - record.mean_latency_millis) / record.outcomes as f64;
    }

    /// Observed failure fraction for an operation.
    #[must_use]
    pub fn error_rate(&self, operation: &str) -> Option<f64> {
        self.records
            .read()
            .unwrap()
            .get(operation)
            .and_then(OperationRecord::error_rate)
    }

    /// Snapshot one operation record.
    #[must_use]
    pub fn get_stats(&self, operation: &str) -> Option<OperationStats> {
        let records = self.records.read().unwrap();
        let record = records.get(operation)?;
        Some(OperationStats {
            operation: operation.to_string(),
            custom_limits: record.custom_limits,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            total_requests: record.total_requests,
            denied_requests: record.denied_requests,
            outcomes: record.outcomes,
            failures: record.failures,
            error_rate: record.error_rate(),
            mean_latency_millis: record.mean_latency_millis,
        })
    }

    /// Number of tracked operations.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Drop records idle past `ttl`. Records with custom limits are
    /// retained. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut records = self.records.write().unwrap();
        let before = records.len();
        records.retain(|_, record| {
            record.custom_limits.is_some()
                || now.signed_duration_since(record.last_seen).num_seconds()
                    < ttl.as_secs() as i64
        });
        before - records.len()
    }

    fn note_denied(&self, operation: &str) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(operation) {
            record.denied_requests += 1;
        }
    }
}
