//! Small helpers for resolving configuration from environment variables.
//!
//! Every setting has a default; env vars override. Parse failures are
//! reported as [`ConfigError`] rather than silently falling back, so a typo
//! in a deployment manifest is caught at startup.

use std::fmt::Display;
use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating unset and whitespace-only values as absent.
pub(crate) fn optional_env(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(name) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!("{name}: {e}"))),
    }
}

/// Read a string env var with a default.
pub(crate) fn parse_string_env(
    name: &str,
    default: impl Into<String>,
) -> Result<String, ConfigError> {
    Ok(optional_env(name)?.unwrap_or_else(|| default.into()))
}

/// Read any `FromStr` env var with a default.
pub(crate) fn parse_optional_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional_env(name)? {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| ConfigError::ParseError(format!("{name}: {e}"))),
    }
}
