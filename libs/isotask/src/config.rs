// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Execution configuration for wrapped functions.
//!
//! Values come from code (`with_*` builders), a TOML file, or `ISOTASK_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TaskError};
use crate::limiter::ConcurrencyLimit;

/// Environment variable overriding [`ExecConfig::poll_interval`] (milliseconds).
pub const ENV_POLL_INTERVAL_MS: &str = "ISOTASK_POLL_INTERVAL_MS";
/// Environment variable overriding [`TerminationPolicy::grace_period`] (milliseconds).
pub const ENV_GRACE_PERIOD_MS: &str = "ISOTASK_GRACE_PERIOD_MS";
/// Environment variable overriding [`TerminationPolicy::kill_wait`] (milliseconds).
pub const ENV_KILL_WAIT_MS: &str = "ISOTASK_KILL_WAIT_MS";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
const DEFAULT_KILL_WAIT: Duration = Duration::from_secs(1);

/// Timing of the cooperative-then-forceful worker shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// How long a worker gets to exit after the cooperative stop request.
    pub grace_period: Duration,
    /// How long to wait for the process to disappear after the forced kill.
    pub kill_wait: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            kill_wait: DEFAULT_KILL_WAIT,
        }
    }
}

impl TerminationPolicy {
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_kill_wait(mut self, kill_wait: Duration) -> Self {
        self.kill_wait = kill_wait;
        self
    }

    /// Upper bound on the time the termination protocol may block.
    pub fn max_duration(&self) -> Duration {
        self.grace_period + self.kill_wait
    }
}

/// Per-wrapper execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecConfig {
    /// Maximum simultaneously in-flight invocations of the wrapped function.
    pub max_concurrent: ConcurrencyLimit,
    /// Terminate the worker process once its outcome has been observed.
    pub terminate_on_return: bool,
    /// Bound on a single result-channel receive in the synchronization loop.
    pub poll_interval: Duration,
    pub termination: TerminationPolicy,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_concurrent: ConcurrencyLimit::Unbounded,
            terminate_on_return: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            termination: TerminationPolicy::default(),
        }
    }
}

/// On-disk shape of an [`ExecConfig`]. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecConfigFile {
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    terminate_on_return: Option<bool>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    grace_period_ms: Option<u64>,
    #[serde(default)]
    kill_wait_ms: Option<u64>,
}

impl ExecConfig {
    pub fn with_max_concurrent(mut self, limit: impl Into<ConcurrencyLimit>) -> Self {
        self.max_concurrent = limit.into();
        self
    }

    pub fn with_terminate_on_return(mut self, terminate: bool) -> Self {
        self.terminate_on_return = terminate;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_termination(mut self, termination: TerminationPolicy) -> Self {
        self.termination = termination;
        self
    }

    /// Defaults with `ISOTASK_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// Malformed values are logged and ignored. `0` keeps the current value.
    pub fn with_env_overrides<L>(mut self, lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = read_millis(&lookup, ENV_POLL_INTERVAL_MS) {
            self.poll_interval = ms;
        }
        if let Some(ms) = read_millis(&lookup, ENV_GRACE_PERIOD_MS) {
            self.termination.grace_period = ms;
        }
        if let Some(ms) = read_millis(&lookup, ENV_KILL_WAIT_MS) {
            self.termination.kill_wait = ms;
        }
        self
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ExecConfigFile = toml::from_str(content)
            .map_err(|e| TaskError::Configuration(format!("Failed to parse config: {}", e)))?;
        file.into_config()
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let file: ExecConfigFile = toml::from_str(&content).map_err(|e| {
            TaskError::Configuration(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        let config = file.into_config()?;
        tracing::info!("Loaded exec config from {}", path.display());
        Ok(config)
    }
}

impl ExecConfigFile {
    fn into_config(self) -> Result<ExecConfig> {
        let mut config = ExecConfig::default();

        if let Some(max) = self.max_concurrent {
            config.max_concurrent = ConcurrencyLimit::AtMost(max);
        }
        if let Some(terminate) = self.terminate_on_return {
            config.terminate_on_return = terminate;
        }
        if let Some(ms) = self.poll_interval_ms {
            if ms == 0 {
                return Err(TaskError::Configuration(
                    "poll_interval_ms must be greater than zero".to_string(),
                ));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.grace_period_ms {
            config.termination.grace_period = Duration::from_millis(ms);
        }
        if let Some(ms) = self.kill_wait_ms {
            config.termination.kill_wait = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn read_millis<L>(lookup: &L, key: &str) -> Option<Duration>
where
    L: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(ms) => {
            tracing::debug!("{}={}ms", key, ms);
            Some(Duration::from_millis(ms))
        }
        Err(e) => {
            tracing::warn!("Ignoring {}='{}': {}", key, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_in(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ExecConfig::default();
        assert_eq!(config.max_concurrent, ConcurrencyLimit::Unbounded);
        assert!(!config.terminate_on_return);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.termination.grace_period, Duration::from_secs(5));
        assert_eq!(config.termination.kill_wait, Duration::from_secs(1));
        assert_eq!(config.termination.max_duration(), Duration::from_secs(6));
    }

    #[test]
    fn test_env_overrides() {
        let config = ExecConfig::default().with_env_overrides(lookup_in(&[
            (ENV_POLL_INTERVAL_MS, "25"),
            (ENV_GRACE_PERIOD_MS, " 300 "),
            (ENV_KILL_WAIT_MS, "50"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.termination.grace_period, Duration::from_millis(300));
        assert_eq!(config.termination.kill_wait, Duration::from_millis(50));
    }

    #[test]
    fn test_env_malformed_and_zero_are_ignored() {
        let config = ExecConfig::default().with_env_overrides(lookup_in(&[
            (ENV_POLL_INTERVAL_MS, "fast"),
            (ENV_GRACE_PERIOD_MS, "0"),
        ]));
        assert_eq!(config, ExecConfig::default());
    }

    #[test]
    fn test_toml_partial() {
        let config = ExecConfig::from_toml_str(
            r#"
            max_concurrent = 2
            terminate_on_return = true
            grace_period_ms = 200
            "#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent, ConcurrencyLimit::AtMost(2));
        assert!(config.terminate_on_return);
        assert_eq!(config.termination.grace_period, Duration::from_millis(200));
        assert_eq!(config.termination.kill_wait, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_toml_empty_is_default() {
        assert_eq!(ExecConfig::from_toml_str("").unwrap(), ExecConfig::default());
    }

    #[test]
    fn test_toml_rejects_unknown_key_and_zero_poll() {
        assert!(matches!(
            ExecConfig::from_toml_str("max_concurent = 1"),
            Err(TaskError::Configuration(_))
        ));
        assert!(matches!(
            ExecConfig::from_toml_str("poll_interval_ms = 0"),
            Err(TaskError::Configuration(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_configuration_error() {
        let err = ExecConfig::load(Path::new("/definitely/not/here/isotask.toml")).unwrap_err();
        assert!(matches!(err, TaskError::Configuration(_)));
    }
}
