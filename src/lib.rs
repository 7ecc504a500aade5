//! # gatewarden
//!
//! Admission-control and rate-limiting engine for API gateways.
//!
//! Every incoming request is checked along up to three dimensions: the
//! caller address, the authenticated identity, and the invoked
//! operation. Each dimension enforces a per-minute and a per-hour quota
//! using an O(1) two-bucket sliding-window approximation, scaled by
//! quota tiers, time-of-day windows, and rules, with per-identifier
//! overrides on top. Abusive addresses accumulate a decaying suspicion
//! score and are blocked automatically.
//!
//! ## Quick start
//!
//! ```
//! use gatewarden::{RequestContext, RequestTracker};
//!
//! let tracker = RequestTracker::new();
//! let decision = tracker.check(
//!     &RequestContext::new()
//!         .with_address("203.0.113.7")
//!         .with_identity("user-42")
//!         .with_operation("search"),
//! );
//! assert!(decision.allowed);
//! ```
//!
//! Configuration is a TOML document loaded into a [`config::ConfigStore`]
//! and hot-reloadable at runtime; an invalid document never replaces the
//! active one. Counter state lives behind the [`backend::StateBackend`]
//! trait so several engine instances can converge through a shared store.

pub mod backend;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod trackers;

pub use backend::{
    create_backend, create_shared_backend, BackendError, BackendResult, LocalBackend,
    SharedBackend, SharedStore, StateBackend, WindowSnapshot,
};
pub use config::{
    ConfigError, ConfigFormat, ConfigResult, ConfigStore, ConfigWatcher, EngineConfig, LimitSet,
    RuleCondition, RuleConfig, TierConfig, TimeWindowConfig,
};
pub use counter::{Dimension, RateLimitKey, WindowState};
pub use engine::{Decision, EngineStatsSnapshot, RequestContext, RequestTracker};
pub use error::{EngineError, EngineResult};
pub use trackers::{
    AddressStats, AddressTracker, GeoInfo, IdentityStats, IdentityTracker, OperationStats,
    OperationTracker, Verdict,
};
