use crate::errors::{EngineError, EngineResult};
use crate::retry::RetryBackoffConfig;

pub const ENV_PREFIX: &str = "CONDUCTOR_";

const THIRTY_DAYS_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

/// Runtime configuration for an orchestrator instance.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub sweeping_output_ttl_ms: u64,
    pub node_execution_ttl_ms: Option<u64>,
    /// Policy for best-effort cancellation of remote tasks.
    pub abort_backoff: RetryBackoffConfig,
    pub plan_poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweeping_output_ttl_ms: THIRTY_DAYS_MS,
            node_execution_ttl_ms: None,
            abort_backoff: RetryBackoffConfig::default(),
            plan_poll_interval_ms: 20,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by `CONDUCTOR_*` keys resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let read = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = read("SWEEPING_OUTPUT_TTL_MS") {
            config.sweeping_output_ttl_ms = parse_u64("SWEEPING_OUTPUT_TTL_MS", &value)?;
        }
        if let Some(value) = read("NODE_EXECUTION_TTL_MS") {
            config.node_execution_ttl_ms = Some(parse_u64("NODE_EXECUTION_TTL_MS", &value)?);
        }
        if let Some(value) = read("ABORT_MAX_ATTEMPTS") {
            let attempts = parse_u64("ABORT_MAX_ATTEMPTS", &value)?;
            config.abort_backoff.max_attempts = u32::try_from(attempts).map_err(|_| {
                EngineError::Configuration(format!(
                    "{ENV_PREFIX}ABORT_MAX_ATTEMPTS must fit in 32 bits, got '{value}'"
                ))
            })?;
        }
        if let Some(value) = read("ABORT_INITIAL_DELAY_MS") {
            config.abort_backoff.initial_delay_ms = parse_u64("ABORT_INITIAL_DELAY_MS", &value)?;
        }
        if let Some(value) = read("ABORT_MAX_DELAY_MS") {
            config.abort_backoff.max_delay_ms = parse_u64("ABORT_MAX_DELAY_MS", &value)?;
        }
        if let Some(value) = read("PLAN_POLL_INTERVAL_MS") {
            config.plan_poll_interval_ms = parse_u64("PLAN_POLL_INTERVAL_MS", &value)?.max(1);
        }
        Ok(config)
    }
}

fn parse_u64(name: &str, value: &str) -> EngineResult<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        EngineError::Configuration(format!(
            "{ENV_PREFIX}{name} must be a non-negative integer, got '{value}'"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn engine_config_defaults_expected_thirty_day_output_ttl() {
        let config = EngineConfig::default();
        assert_eq!(config.sweeping_output_ttl_ms, 2_592_000_000);
        assert_eq!(config.node_execution_ttl_ms, None);
        assert_eq!(config.abort_backoff.max_attempts, 3);
        assert_eq!(config.abort_backoff.initial_delay_ms, 100);
        assert!(!config.abort_backoff.jitter);
        assert_eq!(config.plan_poll_interval_ms, 20);
    }

    #[test]
    fn from_lookup_overrides_expected_applied() {
        let vars = HashMap::from([
            ("CONDUCTOR_NODE_EXECUTION_TTL_MS".to_string(), "5000".to_string()),
            ("CONDUCTOR_ABORT_MAX_ATTEMPTS".to_string(), "7".to_string()),
        ]);
        let config = EngineConfig::from_lookup(|key| vars.get(key).cloned())
            .expect("config should load");
        assert_eq!(config.node_execution_ttl_ms, Some(5_000));
        assert_eq!(config.abort_backoff.max_attempts, 7);
    }

    #[test]
    fn from_lookup_invalid_number_expected_configuration_error() {
        let error = EngineConfig::from_lookup(|key| {
            (key == "CONDUCTOR_PLAN_POLL_INTERVAL_MS").then(|| "soon".to_string())
        })
        .expect_err("invalid value should fail");
        assert!(matches!(error, EngineError::Configuration(_)));
    }

    #[test]
    fn from_lookup_abort_attempts_past_u32_expected_configuration_error() {
        let error = EngineConfig::from_lookup(|key| {
            (key == "CONDUCTOR_ABORT_MAX_ATTEMPTS").then(|| "4294967296".to_string())
        })
        .expect_err("oversized attempt count should fail");
        assert!(
            matches!(error, EngineError::Configuration(message) if message.contains("32 bits"))
        );
    }
}
