use std::time::Duration;

use crate::{
    constants::{
        DEFAULT_TIMEOUT_GRACE_MS, ENV_MAX_RECURSION, ENV_STDERR_LIMIT_BYTES,
        ENV_STDOUT_LIMIT_BYTES, ENV_TIMEOUT_GRACE_MS, ENV_TIMEOUT_MS,
    },
    core::domain::ExecutionLimits,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SandboxConfig {
    pub limits: ExecutionLimits,
    /// Time the controller waits past `limits.time_ms` before it marks a
    /// request as timed out on its own.
    pub timeout_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            limits: ExecutionLimits::default(),
            timeout_grace_ms: DEFAULT_TIMEOUT_GRACE_MS,
        }
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let limits = ExecutionLimits {
            time_ms: positive(&lookup, ENV_TIMEOUT_MS)?.unwrap_or(defaults.limits.time_ms),
            stdout_size_bytes: positive(&lookup, ENV_STDOUT_LIMIT_BYTES)?
                .unwrap_or(defaults.limits.stdout_size_bytes),
            stderr_size_bytes: positive(&lookup, ENV_STDERR_LIMIT_BYTES)?
                .unwrap_or(defaults.limits.stderr_size_bytes),
            max_recursion_depth: positive(&lookup, ENV_MAX_RECURSION)?
                .unwrap_or(defaults.limits.max_recursion_depth),
            ..defaults.limits
        };
        let timeout_grace_ms = match lookup(ENV_TIMEOUT_GRACE_MS) {
            Some(value) => parse(ENV_TIMEOUT_GRACE_MS, &value)?,
            None => defaults.timeout_grace_ms,
        };

        Ok(Self {
            limits,
            timeout_grace_ms,
        })
    }

    pub fn backstop(&self, timeout_ms: u64) -> Duration {
        Duration::from_millis(timeout_ms.saturating_add(self.timeout_grace_ms))
    }
}

fn positive<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed: T = parse(var, &value)?;
    if parsed == T::default() {
        return Err(ConfigError::InvalidValue {
            var,
            value,
            reason: "must be positive".to_string(),
        });
    }
    Ok(Some(parsed))
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SandboxConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SandboxConfig::default());
        assert_eq!(config.limits.time_ms, 5000);
    }

    #[test]
    fn test_overrides_from_env() {
        let config = SandboxConfig::from_lookup(lookup(&[
            (ENV_TIMEOUT_MS, "200"),
            (ENV_TIMEOUT_GRACE_MS, "0"),
            (ENV_STDOUT_LIMIT_BYTES, "1024"),
        ]))
        .unwrap();

        assert_eq!(config.limits.time_ms, 200);
        assert_eq!(config.limits.stdout_size_bytes, 1024);
        assert_eq!(config.timeout_grace_ms, 0);
        assert_eq!(config.backstop(200), Duration::from_millis(200));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = SandboxConfig::from_lookup(lookup(&[(ENV_TIMEOUT_MS, "soon")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { var, .. } if var == ENV_TIMEOUT_MS
        ));

        let err = SandboxConfig::from_lookup(lookup(&[(ENV_MAX_RECURSION, "0")])).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }
}
