//! Runtime configuration with environment and JSON overlays.

use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::factory::DEFAULT_MAX_ENGINE_NAME_LENGTH;

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_value(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    env_value(key)
        .map(|value| {
            value
                .trim()
                .parse::<usize>()
                .map_err(|_| RuntimeError::invalid_argument(key, format!("'{value}' is not a count")))
        })
        .transpose()
}

/// Settings of the dependency-scheduled recurrent executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker threads; 0 uses the available parallelism.
    pub num_threads: usize,
    /// Timesteps allowed in flight at once.
    pub max_parallel_timesteps: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            num_threads: 0,
            max_parallel_timesteps: 2,
        }
    }
}

impl ExecutorConfig {
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Skip per-operator and per-device engine preferences during resolution.
    pub disable_implicit_engine_preference: bool,
    pub max_engine_name_length: usize,
    /// Permits recurrent operators to use the dependency-scheduled executor.
    pub rnn_executor: bool,
    pub executor: ExecutorConfig,
    /// Rotating step-scope pool size for forward-only sequential runs.
    pub forward_only_scope_pool: usize,
    /// Rotating step-scope pool size for forward-only scheduled runs.
    pub executor_scope_pool: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            disable_implicit_engine_preference: false,
            max_engine_name_length: DEFAULT_MAX_ENGINE_NAME_LENGTH,
            rnn_executor: true,
            executor: ExecutorConfig::default(),
            forward_only_scope_pool: 2,
            executor_scope_pool: 4,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `BLOBNET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = RuntimeConfig::default();
        if let Some(value) = env_value("BLOBNET_DISABLE_IMPLICIT_ENGINE_PREFERENCE") {
            config.disable_implicit_engine_preference = parse_bool(&value);
        }
        if let Some(value) = env_usize("BLOBNET_MAX_ENGINE_NAME_LENGTH")? {
            config.max_engine_name_length = value;
        }
        if let Some(value) = env_value("BLOBNET_RNN_EXECUTOR") {
            config.rnn_executor = parse_bool(&value);
        }
        if let Some(value) = env_usize("BLOBNET_EXECUTOR_THREADS")? {
            config.executor.num_threads = value;
        }
        if let Some(value) = env_usize("BLOBNET_EXECUTOR_MAX_PARALLEL_TIMESTEPS")? {
            config.executor.max_parallel_timesteps = value;
        }
        if let Some(value) = env_usize("BLOBNET_FORWARD_ONLY_SCOPE_POOL")? {
            config.forward_only_scope_pool = value;
        }
        if let Some(value) = env_usize("BLOBNET_EXECUTOR_SCOPE_POOL")? {
            config.executor_scope_pool = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(text)
            .map_err(|err| RuntimeError::invalid_argument("config", err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.forward_only_scope_pool == 0 || self.executor_scope_pool == 0 {
            return Err(RuntimeError::invalid_argument(
                "scope_pool",
                "step-scope pools must hold at least one scope",
            ));
        }
        if self.executor.max_parallel_timesteps == 0 {
            return Err(RuntimeError::invalid_argument(
                "max_parallel_timesteps",
                "at least one timestep must be allowed in flight",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "nope"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn json_overlays_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{"rnn_executor": false, "executor": {"max_parallel_timesteps": 3}}"#,
        )
        .unwrap();
        assert!(!config.rnn_executor);
        assert_eq!(config.executor.max_parallel_timesteps, 3);
        assert_eq!(config.executor.num_threads, 0);
        assert_eq!(config.max_engine_name_length, 10);
        assert_eq!(config.executor_scope_pool, 4);
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        assert!(RuntimeConfig::from_json_str(r#"{"forward_only_scope_pool": 0}"#).is_err());
    }
}
