//! Engine and recovery configuration.
//!
//! Configuration is read-only input to the engine. It can be built in code
//! (every struct implements `Default`) or parsed from TOML:
//!
//! ```
//! use magicflow::MagicFlowConfig;
//!
//! let config = MagicFlowConfig::from_toml_str(r#"
//!     [engine]
//!     step_timeout_ms = 5000
//!     max_concurrent_workflows = 8
//!
//!     [engine.features]
//!     metrics = true
//!
//!     [recovery]
//!     cooldown_ms = 60000
//! "#)?;
//!
//! assert_eq!(config.engine.max_concurrent_workflows, 8);
//! # Ok::<(), magicflow::MagicFlowError>(())
//! ```

use crate::recovery::RecoveryPolicy;
use magicflow_core::{ErrorCode, MagicFlowError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MagicFlowConfig {
    pub engine: EngineConfig,
    pub recovery: RecoveryConfig,
}

impl MagicFlowConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, MagicFlowError> {
        let config: Self = toml::from_str(source).map_err(|e| {
            MagicFlowError::new(ErrorCode::ConfigLoad, format!("invalid TOML: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MagicFlowError> {
        self.engine.validate()?;
        self.recovery.validate()
    }
}

/// Optional behaviors the engine can switch on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Record workflow-level metrics into the context metadata.
    pub metrics: bool,
    /// Wrap each run in a `tracing` span.
    pub tracing: bool,
    /// Log per-step wall time at debug level.
    pub profiling: bool,
}

/// Timeouts and limits for [`WorkflowEngine`](crate::WorkflowEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(rename = "step_timeout_ms", with = "duration_ms")]
    pub step_timeout: Duration,
    #[serde(rename = "workflow_timeout_ms", with = "duration_ms")]
    pub workflow_timeout: Duration,
    #[serde(rename = "shutdown_timeout_ms", with = "duration_ms")]
    pub shutdown_timeout: Duration,
    #[serde(rename = "middleware_timeout_ms", with = "duration_ms")]
    pub middleware_timeout: Duration,
    pub max_concurrent_workflows: usize,
    /// Upper bound on step invocations in one run; stops jump cycles.
    pub max_step_executions: usize,
    /// Capacity of the broadcast event bus.
    pub event_buffer: usize,
    pub features: FeatureFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            workflow_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
            middleware_timeout: Duration::from_secs(10),
            max_concurrent_workflows: 100,
            max_step_executions: 10_000,
            event_buffer: 1024,
            features: FeatureFlags::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), MagicFlowError> {
        for (key, value) in [
            ("step_timeout_ms", self.step_timeout),
            ("workflow_timeout_ms", self.workflow_timeout),
            ("shutdown_timeout_ms", self.shutdown_timeout),
            ("middleware_timeout_ms", self.middleware_timeout),
        ] {
            if value.is_zero() {
                return Err(MagicFlowError::config(key, "must be greater than zero"));
            }
        }
        if self.max_concurrent_workflows == 0 {
            return Err(MagicFlowError::config(
                "max_concurrent_workflows",
                "must be greater than zero",
            ));
        }
        if self.max_step_executions == 0 {
            return Err(MagicFlowError::config(
                "max_step_executions",
                "must be greater than zero",
            ));
        }
        if self.event_buffer == 0 {
            return Err(MagicFlowError::config(
                "event_buffer",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Settings for [`RecoveryManager`](crate::RecoveryManager) and its monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    #[serde(rename = "monitor_interval_ms", with = "duration_ms")]
    pub monitor_interval: Duration,
    /// Minimum age of a failure, and of the last attempt, before the
    /// monitor tries again.
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
    pub history_limit: usize,
    pub default_policy: RecoveryPolicy,
    /// Policies keyed by workflow name.
    pub policies: HashMap<String, RecoveryPolicy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            history_limit: 10,
            default_policy: RecoveryPolicy::default(),
            policies: HashMap::new(),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), MagicFlowError> {
        if self.monitor_interval.is_zero() {
            return Err(MagicFlowError::config(
                "monitor_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.history_limit == 0 {
            return Err(MagicFlowError::config(
                "history_limit",
                "must be greater than zero",
            ));
        }
        self.default_policy.validate()?;
        for policy in self.policies.values() {
            policy.validate()?;
        }
        Ok(())
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryStrategy;

    #[test]
    fn test_defaults_are_valid() {
        let config = MagicFlowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.step_timeout, Duration::from_secs(30));
        assert_eq!(config.recovery.history_limit, 10);
    }

    #[test]
    fn test_parse_toml_with_policies() {
        let config = MagicFlowConfig::from_toml_str(
            r#"
            [engine]
            workflow_timeout_ms = 1500
            [engine.features]
            tracing = true

            [recovery]
            history_limit = 5

            [recovery.policies.billing]
            strategy = "skip"
            max_retries = 1
            retry_delay_ms = 10
            backoff_factor = 1.5
            max_delay_ms = 100
            timeout_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.engine.workflow_timeout, Duration::from_millis(1500));
        assert_eq!(config.engine.step_timeout, Duration::from_secs(30));
        assert!(config.engine.features.tracing);
        assert!(!config.engine.features.metrics);
        let billing = &config.recovery.policies["billing"];
        assert_eq!(billing.strategy, RecoveryStrategy::Skip);
        assert_eq!(billing.max_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let err = MagicFlowConfig::from_toml_str("[engine]\nstep_timeout_ms = 0").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let err = MagicFlowConfig::from_toml_str("[engine\n").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigLoad);
    }
}
