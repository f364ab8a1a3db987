//! Configuration for the worker fleet.
//!
//! Settings are loaded with priority: env var > default. Every `resolve()`
//! is fail-fast; a malformed value is a [`ConfigError`], never a silent
//! fallback.

pub(crate) mod helpers;
mod template;

pub use self::template::{PullPolicy, RuntimeSpec, WorkerTemplate};

use self::helpers::{parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Fleet-level configuration.
///
/// Per-template settings (image, pull policy, resources) live on
/// [`WorkerTemplate`]; per-connector settings live on the connector structs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FleetConfig {
    /// Name of the pool this fleet belongs to; stamped on every container
    /// so the orphan sweep can find strays after a crash.
    pub pool: String,
    /// Prefix for container and worker names.
    pub name_prefix: String,
    /// Container engine endpoint, e.g. `unix:///var/run/docker.sock`.
    pub engine_endpoint: String,
    /// Minutes a worker may sit idle before it is torn down.
    pub idle_minutes: u32,
    /// Grace period handed to the engine when stopping a container.
    pub stop_timeout_secs: i64,
    /// How often the orphan sweep runs.
    pub sweep_interval_secs: u64,
    /// Containers younger than this are never swept, so an in-flight
    /// provision is not raced by the watchdog.
    pub sweep_grace_secs: u64,
    /// TTL for idle engine client handles in the usage-tracking cache.
    pub client_ttl_secs: u64,
    /// Upper bound on simultaneously live workers (admission ceiling).
    pub max_workers: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            pool: "default".to_string(),
            name_prefix: "kindling".to_string(),
            engine_endpoint: "unix:///var/run/docker.sock".to_string(),
            idle_minutes: 10,
            stop_timeout_secs: 10,
            sweep_interval_secs: 300,
            sweep_grace_secs: 300,
            client_ttl_secs: 600,
            max_workers: 10,
        }
    }
}

impl FleetConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            pool: parse_string_env("KINDLING_POOL", defaults.pool)?,
            name_prefix: parse_string_env("KINDLING_NAME_PREFIX", defaults.name_prefix)?,
            engine_endpoint: parse_string_env(
                "KINDLING_ENGINE_ENDPOINT",
                defaults.engine_endpoint,
            )?,
            idle_minutes: parse_optional_env("KINDLING_IDLE_MINUTES", defaults.idle_minutes)?,
            stop_timeout_secs: parse_optional_env(
                "KINDLING_STOP_TIMEOUT_SECS",
                defaults.stop_timeout_secs,
            )?,
            sweep_interval_secs: parse_optional_env(
                "KINDLING_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            sweep_grace_secs: parse_optional_env(
                "KINDLING_SWEEP_GRACE_SECS",
                defaults.sweep_grace_secs,
            )?,
            client_ttl_secs: parse_optional_env(
                "KINDLING_CLIENT_TTL_SECS",
                defaults.client_ttl_secs,
            )?,
            max_workers: parse_optional_env("KINDLING_MAX_WORKERS", defaults.max_workers)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = FleetConfig::default();
        assert_eq!(c.pool, "default");
        assert_eq!(c.idle_minutes, 10);
        assert!(c.sweep_grace_secs > 0);
    }

    #[test]
    fn env_overrides_apply() {
        unsafe { std::env::set_var("KINDLING_IDLE_MINUTES", "3") };
        let c = FleetConfig::resolve().unwrap();
        assert_eq!(c.idle_minutes, 3);
        unsafe { std::env::remove_var("KINDLING_IDLE_MINUTES") };
    }
}
