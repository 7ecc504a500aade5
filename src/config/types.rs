//! Engine configuration document.
//!
//! The whole document is parsed and validated in one pass before it is
//! ever visible to a tracker; invalid documents never reach live state.

use crate::counter::Dimension;
use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the admission-control engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base limits per tracking dimension.
    #[serde(default)]
    pub limits: DimensionLimits,

    /// Named quota tiers for identities.
    #[serde(default = "builtin_tiers")]
    pub tiers: Vec<TierConfig>,

    /// Time-of-day multiplier windows.
    #[serde(default)]
    pub time_windows: Vec<TimeWindowConfig>,

    /// Per-identifier overrides with highest precedence.
    #[serde(default)]
    pub overrides: OverrideConfig,

    /// Limit rules evaluated before base limits.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Address suspicion scoring.
    #[serde(default)]
    pub suspicion: SuspicionConfig,

    /// Record and counter eviction.
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Counter state backend.
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: DimensionLimits::default(),
            tiers: builtin_tiers(),
            time_windows: Vec::new(),
            overrides: OverrideConfig::default(),
            rules: Vec::new(),
            suspicion: SuspicionConfig::default(),
            eviction: EvictionConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base limits for one dimension.
    #[must_use]
    pub fn with_limits(mut self, dimension: Dimension, limits: LimitSet) -> Self {
        match dimension {
            Dimension::Address => self.limits.address = limits,
            Dimension::Identity => self.limits.identity = limits,
            Dimension::Operation => self.limits.operation = limits,
        }
        self
    }

    /// Add a time window.
    #[must_use]
    pub fn with_time_window(mut self, window: TimeWindowConfig) -> Self {
        self.time_windows.push(window);
        self
    }

    /// Add a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: RuleConfig) -> Self {
        self.rules.push(rule);
        self
    }

    /// Set the backend configuration.
    #[must_use]
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Validate the whole document.
    pub fn validate(&self) -> Result<(), String> {
        self.limits.validate()?;

        let mut tier_names: Vec<&str> = Vec::with_capacity(self.tiers.len());
        for tier in &self.tiers {
            tier.validate()?;
            if tier_names.contains(&tier.name.as_str()) {
                return Err(format!("duplicate tier '{}'", tier.name));
            }
            tier_names.push(&tier.name);
        }
        if self.tiers.is_empty() {
            return Err("at least one tier must be configured".to_string());
        }

        for window in &self.time_windows {
            window.validate()?;
        }

        self.overrides.validate()?;

        let mut rule_names: Vec<&str> = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            rule.validate()?;
            if rule_names.contains(&rule.name.as_str()) {
                return Err(format!("duplicate rule '{}'", rule.name));
            }
            rule_names.push(&rule.name);
        }

        self.suspicion.validate()?;
        self.eviction.validate()?;
        self.backend.validate()?;

        Ok(())
    }

    /// Look up a tier by name.
    #[must_use]
    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// The tier with the lowest multiplier, applied to anonymous callers.
    #[must_use]
    pub fn most_restrictive_tier(&self) -> Option<&TierConfig> {
        self.tiers
            .iter()
            .min_by(|a, b| a.multiplier.total_cmp(&b.multiplier))
    }

    /// Product of the multipliers of all time windows containing `now`.
    #[must_use]
    pub fn time_multiplier(&self, now: DateTime<Utc>) -> f64 {
        self.time_windows
            .iter()
            .filter(|w| w.contains(now))
            .map(|w| w.multiplier)
            .product()
    }
}

/// Base limits per dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionLimits {
    /// Limits for the address dimension.
    #[serde(default = "default_address_limits")]
    pub address: LimitSet,

    /// Limits for the identity dimension.
    #[serde(default = "default_identity_limits")]
    pub identity: LimitSet,

    /// Limits for the operation dimension.
    #[serde(default = "default_operation_limits")]
    pub operation: LimitSet,
}

fn default_address_limits() -> LimitSet {
    LimitSet::new(100, 1000)
}

fn default_identity_limits() -> LimitSet {
    LimitSet::new(50, 500)
}

fn default_operation_limits() -> LimitSet {
    LimitSet::new(200, 2000)
}

impl Default for DimensionLimits {
    fn default() -> Self {
        Self {
            address: default_address_limits(),
            identity: default_identity_limits(),
            operation: default_operation_limits(),
        }
    }
}

impl DimensionLimits {
    /// Base limits for one dimension.
    #[must_use]
    pub fn for_dimension(&self, dimension: Dimension) -> &LimitSet {
        match dimension {
            Dimension::Address => &self.address,
            Dimension::Identity => &self.identity,
            Dimension::Operation => &self.operation,
        }
    }

    /// Validate all dimensions.
    pub fn validate(&self) -> Result<(), String> {
        self.address
            .validate()
            .map_err(|e| format!("limits.address: {e}"))?;
        self.identity
            .validate()
            .map_err(|e| format!("limits.identity: {e}"))?;
        self.operation
            .validate()
            .map_err(|e| format!("limits.operation: {e}"))?;
        Ok(())
    }
}

/// A pair of request quotas over the two tracked windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSet {
    /// Requests admitted per trailing minute.
    pub per_minute: u64,

    /// Requests admitted per trailing hour.
    pub per_hour: u64,
}

impl LimitSet {
    /// Create a limit set.
    #[must_use]
    pub fn new(per_minute: u64, per_hour: u64) -> Self {
        Self {
            per_minute,
            per_hour,
        }
    }

    /// Validate the limits.
    pub fn validate(&self) -> Result<(), String> {
        if self.per_minute == 0 {
            return Err("per_minute must be greater than 0".to_string());
        }
        if self.per_hour == 0 {
            return Err("per_hour must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Scale both limits by a multiplier, flooring with a floor of 1 so
    /// multiplicative rounding can never lock a principal out entirely.
    #[must_use]
    pub fn scaled(&self, multiplier: f64) -> Self {
        let scale = |limit: u64| ((limit as f64 * multiplier).floor()).max(1.0) as u64;
        Self {
            per_minute: scale(self.per_minute),
            per_hour: scale(self.per_hour),
        }
    }
}

/// A named quota multiplier level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Tier name, referenced by identity records.
    pub name: String,

    /// Quota multiplier applied to identity base limits.
    pub multiplier: f64,

    /// Ordering priority (higher wins when comparing tiers).
    pub priority: u32,
}

impl TierConfig {
    /// Create a tier.
    #[must_use]
    pub fn new(name: impl Into<String>, multiplier: f64, priority: u32) -> Self {
        Self {
            name: name.into(),
            multiplier,
            priority,
        }
    }

    /// Validate the tier.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("tier name cannot be empty".to_string());
        }
        if self.multiplier < 0.0 || !self.multiplier.is_finite() {
            return Err(format!(
                "tier '{}': multiplier must be a finite value >= 0",
                self.name
            ));
        }
        Ok(())
    }
}

/// The built-in tier ladder.
#[must_use]
pub fn builtin_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::new("bronze", 0.5, 1),
        TierConfig::new("silver", 1.0, 2),
        TierConfig::new("gold", 1.5, 3),
        TierConfig::new("platinum", 2.0, 4),
        TierConfig::new("admin", 10.0, 10),
    ]
}

/// Day of the week for time-window matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    /// Monday.
    Mon,
    /// Tuesday.
    Tue,
    /// Wednesday.
    Wed,
    /// Thursday.
    Thu,
    /// Friday.
    Fri,
    /// Saturday.
    Sat,
    /// Sunday.
    Sun,
}

impl DayOfWeek {
    /// All seven days.
    #[must_use]
    pub fn all() -> Vec<Self> {
        vec![
            Self::Mon,
            Self::Tue,
            Self::Wed,
            Self::Thu,
            Self::Fri,
            Self::Sat,
            Self::Sun,
        ]
    }

    fn matches(&self, weekday: Weekday) -> bool {
        matches!(
            (self, weekday),
            (Self::Mon, Weekday::Mon)
                | (Self::Tue, Weekday::Tue)
                | (Self::Wed, Weekday::Wed)
                | (Self::Thu, Weekday::Thu)
                | (Self::Fri, Weekday::Fri)
                | (Self::Sat, Weekday::Sat)
                | (Self::Sun, Weekday::Sun)
        )
    }
}

/// A recurring wall-clock window that scales limits while active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindowConfig {
    /// Window name.
    pub name: String,

    /// Start of the window (UTC time of day, inclusive).
    pub start_time: NaiveTime,

    /// End of the window (UTC time of day, exclusive). An end before the
    /// start wraps past midnight.
    pub end_time: NaiveTime,

    /// Days the window applies on.
    #[serde(default = "DayOfWeek::all")]
    pub days_of_week: Vec<DayOfWeek>,

    /// Limit multiplier while the window is active.
    pub multiplier: f64,
}

impl TimeWindowConfig {
    /// Create a window active on all days.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        start_time: NaiveTime,
        end_time: NaiveTime,
        multiplier: f64,
    ) -> Self {
        Self {
            name: name.into(),
            start_time,
            end_time,
            days_of_week: DayOfWeek::all(),
            multiplier,
        }
    }

    /// Restrict to specific days.
    #[must_use]
    pub fn on_days(mut self, days: Vec<DayOfWeek>) -> Self {
        self.days_of_week = days;
        self
    }

    /// Validate the window.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("time window name cannot be empty".to_string());
        }
        if self.start_time == self.end_time {
            return Err(format!(
                "time window '{}': start_time and end_time must differ",
                self.name
            ));
        }
        if self.multiplier <= 0.0 || !self.multiplier.is_finite() {
            return Err(format!(
                "time window '{}': multiplier must be a finite value > 0",
                self.name
            ));
        }
        if self.days_of_week.is_empty() {
            return Err(format!(
                "time window '{}': days_of_week cannot be empty",
                self.name
            ));
        }
        Ok(())
    }

    /// Whether the window contains the given instant.
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let weekday = now.weekday();
        if !self.days_of_week.iter().any(|d| d.matches(weekday)) {
            return false;
        }

        let time = NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
            .unwrap_or(self.start_time);
        if self.start_time < self.end_time {
            time >= self.start_time && time < self.end_time
        } else {
            // Wraps past midnight.
            time >= self.start_time || time < self.end_time
        }
    }
}

/// Per-identifier overrides, highest precedence in limit resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideConfig {
    /// Identities that bypass quota checks entirely.
    #[serde(default)]
    pub admins: Vec<String>,

    /// Addresses denied before any counter is consulted. Entries may be
    /// exact addresses or CIDR blocks.
    #[serde(default)]
    pub blocked_addresses: Vec<String>,
}

impl OverrideConfig {
    /// Whether an identity is an admin.
    #[must_use]
    pub fn is_admin(&self, identity_id: &str) -> bool {
        self.admins.iter().any(|a| a == identity_id)
    }

    /// Whether an address is on the blocklist.
    #[must_use]
    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked_addresses
            .iter()
            .any(|pattern| address_matches(address, pattern))
    }

    /// Validate the blocklist. Entries containing `/` must be
    /// well-formed CIDR blocks; anything else is an exact address.
    pub fn validate(&self) -> Result<(), String> {
        for pattern in &self.blocked_addresses {
            if pattern.contains('/') && !is_valid_cidr(pattern) {
                return Err(format!(
                    "overrides: '{pattern}' is not a valid CIDR block"
                ));
            }
        }
        Ok(())
    }
}

/// Request attributes a rule condition can inspect.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleContext<'a> {
    /// Caller address.
    pub address: Option<&'a str>,

    /// Authenticated identity.
    pub identity_id: Option<&'a str>,

    /// Resolved tier name.
    pub tier: Option<&'a str>,

    /// Invoked operation.
    pub operation: Option<&'a str>,

    /// Observed error rate for the operation, if known.
    pub error_rate: Option<f64>,
}

/// Predicate over a request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RuleCondition {
    /// Matches every request.
    Always,

    /// Matches an exact caller address.
    AddressIs {
        /// The address to match.
        address: String,
    },

    /// Matches addresses inside a CIDR block.
    AddressInCidr {
        /// The CIDR block, e.g. `10.0.0.0/8`.
        cidr: String,
    },

    /// Matches an exact identity.
    IdentityIs {
        /// The identity id to match.
        identity_id: String,
    },

    /// Matches identities on a given tier.
    TierIs {
        /// The tier name to match.
        tier: String,
    },

    /// Matches requests without an authenticated identity.
    Anonymous,

    /// Matches an exact operation name.
    OperationIs {
        /// The operation name to match.
        operation: String,
    },

    /// Matches operations whose observed error rate exceeds a threshold.
    ErrorRateAbove {
        /// Error-rate threshold in `[0, 1]`.
        threshold: f64,
    },
}

impl RuleCondition {
    /// Evaluate the predicate. Missing context attributes never match
    /// (except for `Anonymous`, which requires the identity be missing).
    #[must_use]
    pub fn matches(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::AddressIs { address } => ctx.address == Some(address.as_str()),
            Self::AddressInCidr { cidr } => {
                ctx.address.is_some_and(|addr| address_matches(addr, cidr))
            }
            Self::IdentityIs { identity_id } => ctx.identity_id == Some(identity_id.as_str()),
            Self::TierIs { tier } => ctx.tier == Some(tier.as_str()),
            Self::Anonymous => ctx.identity_id.is_none(),
            Self::OperationIs { operation } => ctx.operation == Some(operation.as_str()),
            Self::ErrorRateAbove { threshold } => {
                ctx.error_rate.is_some_and(|rate| rate > *threshold)
            }
        }
    }
}

/// A named limit rule. Highest priority wins; ties keep insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Rule name.
    pub name: String,

    /// Dimension the rule applies to.
    pub dimension: Dimension,

    /// Predicate selecting matching requests.
    pub condition: RuleCondition,

    /// Limit set applied when the rule matches.
    pub action: LimitSet,

    /// Evaluation priority (descending).
    pub priority: u32,
}

impl RuleConfig {
    /// Create a rule.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        dimension: Dimension,
        condition: RuleCondition,
        action: LimitSet,
        priority: u32,
    ) -> Self {
        Self {
            name: name.into(),
            dimension,
            condition,
            action,
            priority,
        }
    }

    /// Validate the rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("rule name cannot be empty".to_string());
        }
        self.action
            .validate()
            .map_err(|e| format!("rule '{}': {e}", self.name))?;
        if let RuleCondition::ErrorRateAbove { threshold } = &self.condition {
            if !(0.0..=1.0).contains(threshold) {
                return Err(format!(
                    "rule '{}': error rate threshold must be within [0, 1]",
                    self.name
                ));
            }
        }
        if let RuleCondition::AddressInCidr { cidr } = &self.condition {
            if !is_valid_cidr(cidr) {
                return Err(format!(
                    "rule '{}': '{cidr}' is not a valid CIDR block",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// Address suspicion scoring and auto-blocking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspicionConfig {
    /// Half-life of the exponential score decay.
    #[serde(default = "default_half_life", with = "humantime_serde")]
    pub half_life: Duration,

    /// Score added per rate-limit violation.
    #[serde(default = "default_violation_increment")]
    pub violation_increment: f64,

    /// Score at which an address is auto-blocked.
    #[serde(default = "default_block_threshold")]
    pub block_threshold: f64,
}

fn default_half_life() -> Duration {
    Duration::from_secs(300)
}

fn default_violation_increment() -> f64 {
    1.0
}

fn default_block_threshold() -> f64 {
    10.0
}

impl Default for SuspicionConfig {
    fn default() -> Self {
        Self {
            half_life: default_half_life(),
            violation_increment: default_violation_increment(),
            block_threshold: default_block_threshold(),
        }
    }
}

impl SuspicionConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.half_life.is_zero() {
            return Err("suspicion.half_life must be greater than 0".to_string());
        }
        if self.violation_increment <= 0.0 {
            return Err("suspicion.violation_increment must be greater than 0".to_string());
        }
        if self.block_threshold <= 0.0 {
            return Err("suspicion.block_threshold must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Record and counter eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Inactivity TTL before a record is swept. Defaults to the longest
    /// tracked window (one hour).
    #[serde(default = "default_idle_ttl", with = "humantime_serde")]
    pub idle_ttl: Duration,

    /// Interval between background sweeps.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

fn default_idle_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: default_idle_ttl(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl EvictionConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_ttl.is_zero() {
            return Err("eviction.idle_ttl must be greater than 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("eviction.sweep_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Counter state backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend mode.
    #[serde(default)]
    pub mode: BackendMode,

    /// Budget for a shared-store call before degrading to local state.
    #[serde(default = "default_call_budget", with = "humantime_serde")]
    pub call_budget: Duration,

    /// On shared-store failure, fall back to the local count (`true`) or
    /// deny the request (`false`).
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

fn default_call_budget() -> Duration {
    Duration::from_millis(50)
}

fn default_fail_open() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            call_budget: default_call_budget(),
            fail_open: default_fail_open(),
        }
    }
}

impl BackendConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.call_budget.is_zero() {
            return Err("backend.call_budget must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Backend mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process counters only.
    #[default]
    Local,

    /// Counters converge through a shared store.
    Shared,
}

/// Whether a pattern is a well-formed IPv4 CIDR block with a prefix
/// length in `0..=32`.
fn is_valid_cidr(pattern: &str) -> bool {
    let Some((network, bits_str)) = pattern.split_once('/') else {
        return false;
    };
    let octets = network.split('.').collect::<Vec<_>>();
    octets.len() == 4
        && octets.iter().all(|o| o.parse::<u8>().is_ok())
        && bits_str.parse::<u32>().map_or(false, |bits| bits <= 32)
}

/// Check whether an IPv4 address matches a pattern, where the pattern is
/// either an exact address or a CIDR block.
#[must_use]
pub fn address_matches(address: &str, pattern: &str) -> bool {
    let Some((network, bits_str)) = pattern.split_once('/') else {
        return address == pattern;
    };

    let network_octets: Vec<u8> = network.split('.').filter_map(|s| s.parse().ok()).collect();
    let address_octets: Vec<u8> = address.split('.').filter_map(|s| s.parse().ok()).collect();
    if network_octets.len() != 4 || address_octets.len() != 4 {
        return false;
    }

    let bits: u32 = bits_str.parse().unwrap_or(32);
    let mask = if bits == 0 {
        // A /0 block matches every address.
        0
    } else if bits >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - bits)
    };

    let network_u32 = u32::from_be_bytes([
        network_octets[0],
        network_octets[1],
        network_octets[2],
        network_octets[3],
    ]);
    let address_u32 = u32::from_be_bytes([
        address_octets[0],
        address_octets[1],
        address_octets[2],
        address_octets[3],
    ]);

    (network_u32 & mask) == (address_u32 & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::datetime_from_secs;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tiers.len(), 5);
    }

    #[test]
    fn test_builtin_tier_multipliers() {
        let config = EngineConfig::default();
        assert_eq!(config.tier("bronze").unwrap().multiplier, 0.5);
        assert_eq!(config.tier("gold").unwrap().multiplier, 1.5);
        assert_eq!(config.tier("admin").unwrap().multiplier, 10.0);
        assert_eq!(config.most_restrictive_tier().unwrap().name, "bronze");
    }

    #[test]
    fn test_limit_set_validation() {
        assert!(LimitSet::new(100, 1000).validate().is_ok());
        assert!(LimitSet::new(0, 1000).validate().is_err());
        assert!(LimitSet::new(100, 0).validate().is_err());
    }

    #[test]
    fn test_limit_set_scaling_floors_at_one() {
        let limits = LimitSet::new(50, 500);
        assert_eq!(limits.scaled(1.5), LimitSet::new(75, 750));
        assert_eq!(limits.scaled(10.0), LimitSet::new(500, 5000));
        assert_eq!(limits.scaled(0.001), LimitSet::new(1, 1));
    }

    #[test]
    fn test_duplicate_tier_rejected() {
        let mut config = EngineConfig::default();
        config.tiers.push(TierConfig::new("gold", 2.0, 5));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_multiplier_rejected() {
        let config = EngineConfig {
            tiers: vec![TierConfig::new("broken", -1.0, 1)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_time_window_contains() {
        let window = TimeWindowConfig::new(
            "business-hours",
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            0.7,
        );

        // 2024-01-01 is a Monday; 12:00 UTC.
        let monday_noon = datetime_from_secs(1_704_110_400);
        assert!(window.contains(monday_noon));

        // 20:00 is outside.
        let monday_evening = datetime_from_secs(1_704_139_200);
        assert!(!window.contains(monday_evening));
    }

    #[test]
    fn test_time_window_day_restriction() {
        let window = TimeWindowConfig::new(
            "weekend",
            NaiveTime::from_hms_opt(0, 0, 1).unwrap(),
            NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
            2.0,
        )
        .on_days(vec![DayOfWeek::Sat, DayOfWeek::Sun]);

        let monday_noon = datetime_from_secs(1_704_110_400);
        assert!(!window.contains(monday_noon));

        // 2024-01-06 is a Saturday.
        let saturday_noon = datetime_from_secs(1_704_542_400);
        assert!(window.contains(saturday_noon));
    }

    #[test]
    fn test_time_window_midnight_wraparound() {
        let window = TimeWindowConfig::new(
            "overnight",
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            0.5,
        );

        let monday_noon = datetime_from_secs(1_704_110_400);
        assert!(!window.contains(monday_noon));

        // Monday 23:00.
        let monday_night = datetime_from_secs(1_704_150_000);
        assert!(window.contains(monday_night));

        // Tuesday 03:00.
        let tuesday_early = datetime_from_secs(1_704_164_400);
        assert!(window.contains(tuesday_early));
    }

    #[test]
    fn test_time_multiplier_composition() {
        let config = EngineConfig::default()
            .with_time_window(TimeWindowConfig::new(
                "all-day-a",
                NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                0.5,
            ))
            .with_time_window(TimeWindowConfig::new(
                "all-day-b",
                NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                0.8,
            ));

        let noon = datetime_from_secs(1_704_110_400);
        assert!((config.time_multiplier(noon) - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_rule_conditions() {
        let ctx = RuleContext {
            address: Some("10.1.2.3"),
            identity_id: Some("u1"),
            tier: Some("gold"),
            operation: Some("search"),
            error_rate: Some(0.25),
        };

        assert!(RuleCondition::Always.matches(&ctx));
        assert!(RuleCondition::AddressIs {
            address: "10.1.2.3".to_string()
        }
        .matches(&ctx));
        assert!(RuleCondition::AddressInCidr {
            cidr: "10.0.0.0/8".to_string()
        }
        .matches(&ctx));
        assert!(!RuleCondition::AddressInCidr {
            cidr: "192.168.0.0/16".to_string()
        }
        .matches(&ctx));
        assert!(RuleCondition::TierIs {
            tier: "gold".to_string()
        }
        .matches(&ctx));
        assert!(!RuleCondition::Anonymous.matches(&ctx));
        assert!(RuleCondition::ErrorRateAbove { threshold: 0.2 }.matches(&ctx));
        assert!(!RuleCondition::ErrorRateAbove { threshold: 0.5 }.matches(&ctx));

        let anonymous = RuleContext {
            address: Some("10.1.2.3"),
            ..Default::default()
        };
        assert!(RuleCondition::Anonymous.matches(&anonymous));
    }

    #[test]
    fn test_override_blocklist_supports_cidr() {
        let overrides = OverrideConfig {
            admins: vec!["root".to_string()],
            blocked_addresses: vec!["192.168.1.100".to_string(), "10.0.0.0/8".to_string()],
        };

        assert!(overrides.is_admin("root"));
        assert!(!overrides.is_admin("u1"));
        assert!(overrides.is_blocked("192.168.1.100"));
        assert!(overrides.is_blocked("10.255.0.1"));
        assert!(!overrides.is_blocked("192.168.1.101"));
    }

    #[test]
    fn test_match_all_cidr_block_matches_everything() {
        assert!(address_matches("1.2.3.4", "0.0.0.0/0"));
        assert!(address_matches("255.255.255.255", "0.0.0.0/0"));

        let overrides = OverrideConfig {
            admins: Vec::new(),
            blocked_addresses: vec!["0.0.0.0/0".to_string()],
        };
        assert!(overrides.validate().is_ok());
        assert!(overrides.is_blocked("198.51.100.7"));
    }

    #[test]
    fn test_malformed_cidr_blocks_rejected() {
        let bad = ["10.0.0.0/33", "10.0.0/8", "10.0.0.0/x", "300.0.0.0/8"];
        for pattern in bad {
            let overrides = OverrideConfig {
                admins: Vec::new(),
                blocked_addresses: vec![pattern.to_string()],
            };
            assert!(overrides.validate().is_err(), "'{pattern}' should be rejected");

            let rule = RuleConfig::new(
                "bad-cidr",
                Dimension::Address,
                RuleCondition::AddressInCidr {
                    cidr: pattern.to_string(),
                },
                LimitSet::new(10, 100),
                1,
            );
            assert!(rule.validate().is_err(), "'{pattern}' should be rejected");
        }

        // Exact addresses are not CIDR blocks and stay valid.
        let overrides = OverrideConfig {
            admins: Vec::new(),
            blocked_addresses: vec!["192.168.1.100".to_string()],
        };
        assert!(overrides.validate().is_ok());
    }

    #[test]
    fn test_rule_validation() {
        let rule = RuleConfig::new(
            "bad-threshold",
            Dimension::Operation,
            RuleCondition::ErrorRateAbove { threshold: 2.0 },
            LimitSet::new(10, 100),
            1,
        );
        assert!(rule.validate().is_err());

        let rule = RuleConfig::new(
            "zero-action",
            Dimension::Address,
            RuleCondition::Always,
            LimitSet::new(0, 100),
            1,
        );
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = EngineConfig::default().with_rule(RuleConfig::new(
            "throttle-search",
            Dimension::Operation,
            RuleCondition::OperationIs {
                operation: "search".to_string(),
            },
            LimitSet::new(10, 100),
            5,
        ));

        let encoded = toml::to_string(&config).unwrap();
        let decoded: EngineConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.rules.len(), 1);
        assert_eq!(decoded.rules[0].name, "throttle-search");
        assert!(decoded.validate().is_ok());
    }
}
