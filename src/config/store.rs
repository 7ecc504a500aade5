//! Live configuration store.
//!
//! Holds the active configuration behind an `Arc` snapshot. Readers clone
//! the `Arc` and observe an entirely-old or entirely-new document, never a
//! half-applied one; a new document is validated before the swap and the
//! replaced snapshot is retained for rollback.

use super::error::{ConfigError, ConfigResult};
use super::types::{EngineConfig, LimitSet, RuleConfig, RuleContext};
use crate::counter::Dimension;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Serialization format for configuration export and import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML, the on-disk format.
    Toml,
    /// JSON, for admin APIs.
    Json,
}

/// Outcome of resolving the effective limit for one dimension check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitOutcome {
    /// No quota applies (admin override).
    Unlimited,

    /// The principal is blocked outright.
    Blocked,

    /// The resolved limits to enforce.
    Limits(LimitSet),
}

/// Thread-safe holder for the active [`EngineConfig`].
#[derive(Debug)]
pub struct ConfigStore {
    active: RwLock<Arc<EngineConfig>>,
    previous: RwLock<Option<Arc<EngineConfig>>>,
}

impl ConfigStore {
    /// Create a store from an initial configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration fails validation.
    pub fn new(config: EngineConfig) -> ConfigResult<Self> {
        config.validate().map_err(ConfigError::ValidationError)?;
        Ok(Self {
            active: RwLock::new(Arc::new(config)),
            previous: RwLock::new(None),
        })
    }

    /// Create a store with the default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            active: RwLock::new(Arc::new(EngineConfig::default())),
            previous: RwLock::new(None),
        }
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unparsable or invalid.
    pub fn from_path(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::new(load_path(path)?)
    }

    /// The current snapshot. In-flight decisions keep reading their clone
    /// even if the configuration is swapped mid-request.
    #[must_use]
    pub fn snapshot(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.active.read().unwrap())
    }

    /// Validate and atomically install a new configuration, retaining the
    /// replaced one for [`rollback`](Self::rollback).
    ///
    /// # Errors
    ///
    /// Returns a validation error and leaves the active configuration
    /// untouched if the new document is invalid.
    pub fn load(&self, config: EngineConfig) -> ConfigResult<()> {
        config.validate().map_err(ConfigError::ValidationError)?;

        let new = Arc::new(config);
        let old = {
            let mut active = self.active.write().unwrap();
            std::mem::replace(&mut *active, new)
        };
        *self.previous.write().unwrap() = Some(old);
        info!("configuration replaced");
        Ok(())
    }

    /// Reload from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated;
    /// the active configuration is untouched on failure.
    pub fn reload_from(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        self.load(load_path(path)?)
    }

    /// Restore the configuration that was active before the last swap.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoRollback`] if nothing has been replaced.
    pub fn rollback(&self) -> ConfigResult<()> {
        let restored = self
            .previous
            .write()
            .unwrap()
            .take()
            .ok_or(ConfigError::NoRollback)?;
        *self.active.write().unwrap() = restored;
        info!("configuration rolled back");
        Ok(())
    }

    /// Apply a mutation to a copy of the active configuration and install
    /// the result if it still validates. Used by single-field admin
    /// operations so they share the validate-before-swap path.
    ///
    /// # Errors
    ///
    /// Returns a validation error and keeps the active configuration if
    /// the mutation produces an invalid document.
    pub fn mutate(&self, f: impl FnOnce(&mut EngineConfig)) -> ConfigResult<()> {
        let mut updated = (*self.snapshot()).clone();
        f(&mut updated);
        self.load(updated)
    }

    /// Resolve the limits to enforce for one dimension check.
    ///
    /// Precedence: per-identifier overrides, then the highest-priority
    /// matching rule, then the base limits (or `base_override`) scaled by
    /// the tier multiplier (identity dimension only) and by any active
    /// time windows.
    #[must_use]
    pub fn effective_limit(
        &self,
        dimension: Dimension,
        ctx: &RuleContext<'_>,
        base_override: Option<LimitSet>,
        now: DateTime<Utc>,
    ) -> LimitOutcome {
        let config = self.snapshot();

        match dimension {
            Dimension::Address => {
                if let Some(address) = ctx.address {
                    if config.overrides.is_blocked(address) {
                        return LimitOutcome::Blocked;
                    }
                }
            }
            Dimension::Identity => {
                if let Some(identity_id) = ctx.identity_id {
                    if config.overrides.is_admin(identity_id) {
                        return LimitOutcome::Unlimited;
                    }
                }
            }
            Dimension::Operation => {}
        }

        // Highest priority wins; ties keep insertion order.
        let mut matched: Option<&RuleConfig> = None;
        for rule in &config.rules {
            if rule.dimension != dimension || !rule.condition.matches(ctx) {
                continue;
            }
            if matched.map_or(true, |best| rule.priority > best.priority) {
                matched = Some(rule);
            }
        }
        if let Some(rule) = matched {
            return LimitOutcome::Limits(rule.action);
        }

        let base = base_override.unwrap_or(*config.limits.for_dimension(dimension));

        let tier_multiplier = if dimension == Dimension::Identity {
            ctx.tier
                .and_then(|name| config.tier(name))
                .map_or(1.0, |tier| tier.multiplier)
        } else {
            1.0
        };

        let multiplier = tier_multiplier * config.time_multiplier(now);
        LimitOutcome::Limits(base.scaled(multiplier))
    }

    /// Serialize the active configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn export(&self, format: ConfigFormat) -> ConfigResult<Vec<u8>> {
        let config = self.snapshot();
        match format {
            ConfigFormat::Toml => Ok(toml::to_string_pretty(&*config)?.into_bytes()),
            ConfigFormat::Json => Ok(serde_json::to_vec_pretty(&*config)?),
        }
    }

    /// Parse a serialized configuration and install it atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unparsable or invalid; the
    /// active configuration is untouched on failure.
    pub fn import(&self, bytes: &[u8], format: ConfigFormat) -> ConfigResult<()> {
        let config: EngineConfig = match format {
            ConfigFormat::Toml => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    ConfigError::ValidationError(format!("document is not valid UTF-8: {e}"))
                })?;
                toml::from_str(text)?
            }
            ConfigFormat::Json => serde_json::from_slice(bytes)?,
        };
        self.load(config)
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Read and parse a TOML configuration file.
///
/// # Errors
///
/// Returns an error if the file is missing, unreadable or unparsable.
pub fn load_path(path: impl AsRef<Path>) -> ConfigResult<EngineConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}
