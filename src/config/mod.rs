//! Limit configuration: document types, live store, and hot-reload.
//!
//! The configuration document ([`EngineConfig`]) carries base limits,
//! quota tiers, time windows, overrides and rules. The [`ConfigStore`]
//! exposes it as immutable snapshots swapped atomically after
//! validation, and [`ConfigWatcher`] hot-reloads the store from disk.

pub mod error;
pub mod store;
pub mod types;
pub mod watcher;

pub use error::{ConfigError, ConfigResult};
pub use store::{load_path, ConfigFormat, ConfigStore, LimitOutcome};
pub use types::{
    address_matches, builtin_tiers, BackendConfig, BackendMode, DayOfWeek, DimensionLimits,
    EngineConfig, EvictionConfig, LimitSet, OverrideConfig, RuleCondition, RuleConfig, RuleContext,
    SuspicionConfig, TierConfig, TimeWindowConfig,
};
pub use watcher::{ConfigEvent, ConfigWatcher, WatcherConfig};
