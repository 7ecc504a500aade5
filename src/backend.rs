//! Counter state backends.
//!
//! The trackers depend on the [`StateBackend`] trait only, never on a
//! concrete store. [`LocalBackend`] keeps window state in-process;
//! [`SharedBackend`] additionally merges counts into a [`SharedStore`]
//! that multiple engine instances can observe, giving an eventually
//! consistent view with bounded staleness.

use crate::config::{BackendConfig, BackendMode};
use crate::counter::{RateLimitKey, WindowState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Maximum optimistic-merge attempts before giving up on a key.
const MAX_MERGE_RETRIES: usize = 4;

/// Errors surfaced by counter state backends.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The shared store could not be reached.
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    /// A shared-store call exceeded the configured budget.
    #[error("backend call exceeded budget of {budget:?}")]
    Timeout {
        /// The budget that was exceeded.
        budget: Duration,
    },

    /// Concurrent updates to the same key exhausted the retry budget.
    #[error("concurrent update conflict on key '{0}'")]
    Conflict(String),
}

impl BackendError {
    /// Whether a local-only fallback is a valid response to this error.
    /// Conflicts are not recoverable: the decision fails safe to deny.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Point-in-time view of one counter window.
#[derive(Debug, Clone, Copy)]
pub struct WindowSnapshot {
    /// Weighted count in the trailing window, including the recorded event.
    pub count: f64,

    /// When the current bucket ends.
    pub reset_at: DateTime<Utc>,
}

/// Storage abstraction for window counters.
pub trait StateBackend: Send + Sync {
    /// Record one event for `key` in the given window and return the
    /// resulting weighted count.
    fn record(
        &self,
        key: &RateLimitKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot>;

    /// Read the weighted count without recording.
    fn peek(
        &self,
        key: &RateLimitKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot>;

    /// Drop all windows tracked for `key`.
    fn reset(&self, key: &RateLimitKey) -> BackendResult<()>;

    /// Remove keys whose buckets fully expired at least `ttl` ago.
    /// Returns the number of entries removed.
    fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize;

    /// Whether the backend is fully operational.
    fn is_healthy(&self) -> bool;
}

/// Entry in the local window map.
type WindowSlot = Arc<Mutex<WindowState>>;

/// In-process counter storage (the default backend).
#[derive(Debug, Default)]
pub struct LocalBackend {
    /// Window state per `dimension:identifier:window_secs` key.
    windows: RwLock<HashMap<String, WindowSlot>>,
}

impl LocalBackend {
    /// Create an empty local backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked windows.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.read().unwrap().len()
    }

    fn storage_key(key: &RateLimitKey, window: Duration) -> String {
        format!("{}:{}", key, window.as_secs())
    }

    /// Get or create the slot for a key, creating under the write lock
    /// with a double check so concurrent creation always keeps one slot.
    fn slot(&self, key: &RateLimitKey, window: Duration) -> WindowSlot {
        let storage_key = Self::storage_key(key, window);

        {
            let windows = self.windows.read().unwrap();
            if let Some(slot) = windows.get(&storage_key) {
                return Arc::clone(slot);
            }
        }

        let mut windows = self.windows.write().unwrap();
        if let Some(slot) = windows.get(&storage_key) {
            return Arc::clone(slot);
        }

        let slot = Arc::new(Mutex::new(WindowState::new(window)));
        windows.insert(storage_key, Arc::clone(&slot));
        slot
    }
}

impl StateBackend for LocalBackend {
    fn record(
        &self,
        key: &RateLimitKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot> {
        let slot = self.slot(key, window);
        let mut state = slot.lock().unwrap();
        let count = state.record(now);
        Ok(WindowSnapshot {
            count,
            reset_at: state.reset_at(),
        })
    }

    fn peek(
        &self,
        key: &RateLimitKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot> {
        let slot = self.slot(key, window);
        let mut state = slot.lock().unwrap();
        let count = state.peek(now);
        Ok(WindowSnapshot {
            count,
            reset_at: state.reset_at(),
        })
    }

    fn reset(&self, key: &RateLimitKey) -> BackendResult<()> {
        let prefix = format!("{key}:");
        let mut windows = self.windows.write().unwrap();
        windows.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut windows = self.windows.write().unwrap();
        let before = windows.len();
        windows.retain(|_, slot| !slot.lock().unwrap().is_expired(now, ttl));
        before - windows.len()
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Versioned entry in the shared store.
#[derive(Debug, Clone)]
struct VersionedWindow {
    version: u64,
    state: WindowState,
}

/// Shared counter store observable by multiple engine instances.
///
/// Entries carry a version and are merged with an optimistic
/// compare-and-swap loop, so two instances recording the same key
/// converge without losing increments.
#[derive(Debug, Default)]
pub struct SharedStore {
    entries: RwLock<HashMap<String, VersionedWindow>>,

    /// Simulates store reachability (outage drills and tests).
    available: AtomicBool,

    /// Artificial per-call latency in milliseconds.
    latency_millis: AtomicU64,
}

impl SharedStore {
    /// Create an available shared store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            latency_millis: AtomicU64::new(0),
        }
    }

    /// Mark the store reachable or unreachable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Whether the store is reachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Add a fixed latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_millis
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Number of keys in the store.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    fn simulate_call(&self) -> BackendResult<()> {
        if !self.is_available() {
            return Err(BackendError::Unavailable("store offline".to_string()));
        }
        let latency = self.latency_millis.load(Ordering::Acquire);
        if latency > 0 {
            std::thread::sleep(Duration::from_millis(latency));
        }
        Ok(())
    }

    /// Record one event for `key`, merging optimistically against
    /// concurrent writers. Exhausting the retry budget is a conflict.
    fn merge(
        &self,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot> {
        self.simulate_call()?;

        for _ in 0..MAX_MERGE_RETRIES {
            let observed = {
                let entries = self.entries.read().unwrap();
                entries.get(key).cloned()
            };

            let (expected_version, mut state) = match observed {
                Some(entry) => (Some(entry.version), entry.state),
                None => (None, WindowState::new(window)),
            };
            let count = state.record(now);
            let reset_at = state.reset_at();

            let mut entries = self.entries.write().unwrap();
            let current_version = entries.get(key).map(|e| e.version);
            if current_version != expected_version {
                continue;
            }
            let version = expected_version.map_or(1, |v| v + 1);
            entries.insert(key.to_string(), VersionedWindow { version, state });
            return Ok(WindowSnapshot { count, reset_at });
        }

        Err(BackendError::Conflict(key.to_string()))
    }

    fn read(&self, key: &str, now: DateTime<Utc>) -> BackendResult<Option<WindowSnapshot>> {
        self.simulate_call()?;
        let entries = self.entries.read().unwrap();
        Ok(entries.get(key).map(|entry| {
            let mut state = entry.state.clone();
            let count = state.peek(now);
            WindowSnapshot {
                count,
                reset_at: state.reset_at(),
            }
        }))
    }

    fn remove_prefix(&self, prefix: &str) -> BackendResult<()> {
        self.simulate_call()?;
        let mut entries = self.entries.write().unwrap();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        if !self.is_available() {
            return 0;
        }
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| !entry.state.is_expired(now, ttl));
        before - entries.len()
    }
}

/// Backend that keeps a local copy and converges through a shared store.
///
/// The shared call runs under a bounded budget. On outage or budget
/// overrun the decision degrades to the local count per the configured
/// fail-open/fail-closed policy; the failure never reaches the gateway
/// as a panic or a request-aborting error.
pub struct SharedBackend {
    local: LocalBackend,
    store: Arc<SharedStore>,
    call_budget: Duration,
    fail_open: bool,

    /// Calls answered locally because the shared store degraded.
    degraded_calls: AtomicU64,
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("call_budget", &self.call_budget)
            .field("fail_open", &self.fail_open)
            .field("degraded_calls", &self.degraded_calls)
            .finish()
    }
}

impl SharedBackend {
    /// Create a shared backend over its own store.
    #[must_use]
    pub fn new(call_budget: Duration, fail_open: bool) -> Self {
        Self::with_store(Arc::new(SharedStore::new()), call_budget, fail_open)
    }

    /// Create a shared backend over an existing store, so several engine
    /// instances observe the same counters.
    #[must_use]
    pub fn with_store(store: Arc<SharedStore>, call_budget: Duration, fail_open: bool) -> Self {
        Self {
            local: LocalBackend::new(),
            store,
            call_budget,
            fail_open,
            degraded_calls: AtomicU64::new(0),
        }
    }

    /// The underlying shared store.
    #[must_use]
    pub fn store(&self) -> Arc<SharedStore> {
        Arc::clone(&self.store)
    }

    /// Calls that fell back to the local count.
    #[must_use]
    pub fn degraded_calls(&self) -> u64 {
        self.degraded_calls.load(Ordering::Relaxed)
    }

    /// Apply the fail policy to a degraded call.
    fn degrade(
        &self,
        key: &RateLimitKey,
        error: &BackendError,
        local: WindowSnapshot,
    ) -> BackendResult<WindowSnapshot> {
        self.degraded_calls.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, error = %error, fail_open = self.fail_open, "shared store degraded");

        if error.is_recoverable() && self.fail_open {
            Ok(local)
        } else {
            Err(BackendError::Unavailable(error.to_string()))
        }
    }

    /// Run a store call and check the budget after it returns: the call
    /// itself is not interrupted, but an answer that arrived late is
    /// discarded and treated as a timeout. A slow store therefore still
    /// holds the caller for its full latency once; sustained slowness
    /// shows up as repeated degradations, not as unbounded stalls.
    fn budgeted<T>(
        &self,
        call: impl FnOnce() -> BackendResult<T>,
    ) -> BackendResult<T> {
        let started = Instant::now();
        let result = call()?;
        if started.elapsed() > self.call_budget {
            return Err(BackendError::Timeout {
                budget: self.call_budget,
            });
        }
        Ok(result)
    }
}

impl StateBackend for SharedBackend {
    fn record(
        &self,
        key: &RateLimitKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot> {
        let local = self.local.record(key, window, now)?;
        let storage_key = LocalBackend::storage_key(key, window);

        match self.budgeted(|| self.store.merge(&storage_key, window, now)) {
            Ok(shared) => {
                // The shared count includes increments from other
                // instances; take the larger view.
                let count = shared.count.max(local.count);
                Ok(WindowSnapshot {
                    count,
                    reset_at: shared.reset_at,
                })
            }
            Err(BackendError::Conflict(key)) => {
                // Retries exhausted: fail safe, never fail open.
                debug!(key = %key, "merge conflict, failing safe");
                Err(BackendError::Conflict(key))
            }
            Err(e) => self.degrade(key, &e, local),
        }
    }

    fn peek(
        &self,
        key: &RateLimitKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> BackendResult<WindowSnapshot> {
        let local = self.local.peek(key, window, now)?;
        let storage_key = LocalBackend::storage_key(key, window);

        match self.budgeted(|| self.store.read(&storage_key, now)) {
            Ok(Some(shared)) => Ok(WindowSnapshot {
                count: shared.count.max(local.count),
                reset_at: shared.reset_at,
            }),
            Ok(None) => Ok(local),
            Err(e) => self.degrade(key, &e, local),
        }
    }

    fn reset(&self, key: &RateLimitKey) -> BackendResult<()> {
        self.local.reset(key)?;
        let prefix = format!("{key}:");
        if let Err(e) = self.store.remove_prefix(&prefix) {
            warn!(key = %key, error = %e, "shared reset degraded to local");
        }
        Ok(())
    }

    fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        self.local.sweep(now, ttl) + self.store.sweep(now, ttl)
    }

    fn is_healthy(&self) -> bool {
        self.store.is_available()
    }
}

/// Build a backend from configuration.
#[must_use]
pub fn create_backend(config: &BackendConfig) -> Arc<dyn StateBackend> {
    match config.mode {
        BackendMode::Local => Arc::new(LocalBackend::new()),
        BackendMode::Shared => Arc::new(SharedBackend::new(config.call_budget, config.fail_open)),
    }
}

/// Build a shared backend bound to an existing store.
#[must_use]
pub fn create_shared_backend(
    config: &BackendConfig,
    store: Arc<SharedStore>,
) -> Arc<dyn StateBackend> {
    Arc::new(SharedBackend::with_store(
        store,
        config.call_budget,
        config.fail_open,
    ))
}
