//! Dispatch engine configuration.
//!
//! Configuration is loaded in priority order: environment variables
//! (prefixed `POSTBOX_`), then `postbox.toml`, then built-in defaults. The
//! engine works out of the box with the defaults; per-event-type overrides
//! let operators disable a type or tighten its attempt ceiling without
//! redeploying.

use std::{collections::HashMap, time::Duration};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use postbox_core::models::EventType;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

const CONFIG_FILE: &str = "postbox.toml";

/// Configuration for the dispatch engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of concurrent dispatch workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Maximum envelopes fetched per worker pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How often workers poll when no work is due.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Upper bound on a single handler invocation.
    ///
    /// A handler exceeding this is treated as a retryable failure.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout: Duration,

    /// How long an acquired lock key stays held without release.
    ///
    /// Guards against a crashed holder starving its key; must exceed the
    /// handler timeout so live holders never expire mid-run.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: Duration,

    /// Maximum time to wait for workers during graceful shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Default retry policy for envelopes without a type override.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-event-type overrides, keyed by event type tag.
    #[serde(default)]
    pub type_overrides: HashMap<String, TypeOverride>,
}

/// Per-event-type configuration override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeOverride {
    /// Whether envelopes of this type are dispatched at all.
    ///
    /// Disabled types stay pending until re-enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Attempt ceiling for this type, overriding the default policy.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for TypeOverride {
    fn default() -> Self {
        Self { enabled: true, max_attempts: None }
    }
}

impl DispatchConfig {
    /// Loads configuration from defaults, `postbox.toml`, and `POSTBOX_`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns error when a source fails to parse or a value is invalid.
    pub fn load() -> anyhow::Result<Self> {
        use anyhow::Context;

        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed("POSTBOX_"));

        let config: Self = figment.extract().context("failed to load dispatch configuration")?;
        config.validate().context("invalid dispatch configuration")?;
        Ok(config)
    }

    /// Whether envelopes of `event_type` should be dispatched.
    pub fn is_type_enabled(&self, event_type: &EventType) -> bool {
        self.type_overrides.get(event_type.as_str()).is_none_or(|o| o.enabled)
    }

    /// Effective retry policy for `event_type`.
    ///
    /// Starts from the default policy and applies the type's attempt ceiling
    /// override, if any.
    pub fn retry_policy_for(&self, event_type: &EventType) -> RetryPolicy {
        let mut policy = self.retry.clone();
        if let Some(max_attempts) =
            self.type_overrides.get(event_type.as_str()).and_then(|o| o.max_attempts)
        {
            policy.max_attempts = max_attempts;
        }
        policy
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value found.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("retry.jitter_factor must be between 0.0 and 1.0");
        }
        if self.lock_ttl < self.handler_timeout {
            anyhow::bail!("lock_ttl must not be shorter than handler_timeout");
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
            poll_interval: default_poll_interval(),
            handler_timeout: default_handler_timeout(),
            lock_ttl: default_lock_ttl(),
            shutdown_timeout: default_shutdown_timeout(),
            retry: RetryPolicy::default(),
            type_overrides: HashMap::new(),
        }
    }
}

fn default_worker_count() -> usize {
    crate::DEFAULT_WORKER_COUNT
}

fn default_batch_size() -> usize {
    crate::DEFAULT_BATCH_SIZE
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_handler_timeout() -> Duration {
    Duration::from_secs(crate::DEFAULT_HANDLER_TIMEOUT_SECONDS)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_enabled() -> bool {
    true
}
