use std::env;

use anyhow::Result;
use blobnet::{Runtime, RuntimeConfig, RuntimeError};

#[test]
fn defaults_match_documented_values() {
    let config = RuntimeConfig::default();
    assert!(!config.disable_implicit_engine_preference);
    assert_eq!(config.max_engine_name_length, 10);
    assert!(config.rnn_executor);
    assert_eq!(config.forward_only_scope_pool, 2);
    assert_eq!(config.executor_scope_pool, 4);
    assert_eq!(config.executor.max_parallel_timesteps, 2);
    assert!(config.executor.resolved_threads() >= 1);
}

#[test]
fn json_overrides_only_the_given_fields() -> Result<()> {
    let config = RuntimeConfig::from_json_str(
        r#"{ "rnn_executor": false, "executor": { "num_threads": 3 } }"#,
    )?;
    assert!(!config.rnn_executor);
    assert_eq!(config.executor.num_threads, 3);
    assert_eq!(config.executor.max_parallel_timesteps, 2);
    assert_eq!(config.forward_only_scope_pool, 2);
    Ok(())
}

#[test]
fn invalid_configs_are_rejected() {
    let err = RuntimeConfig::from_json_str(r#"{ "executor_scope_pool": 0 }"#).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { .. }), "{err}");

    let err = RuntimeConfig::from_json_str("not json").unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { ref name, .. } if name == "config"));

    let config = RuntimeConfig {
        executor: blobnet::ExecutorConfig {
            num_threads: 1,
            max_parallel_timesteps: 0,
        },
        ..RuntimeConfig::default()
    };
    let err = Runtime::builder().with_config(config).build().unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { .. }), "{err}");
}

// Every environment assertion lives in this one test; the variables are process-wide.
#[test]
fn environment_overlays_defaults() -> Result<()> {
    env::set_var("BLOBNET_DISABLE_IMPLICIT_ENGINE_PREFERENCE", "yes");
    env::set_var("BLOBNET_MAX_ENGINE_NAME_LENGTH", "6");
    env::set_var("BLOBNET_RNN_EXECUTOR", "0");
    env::set_var("BLOBNET_EXECUTOR_MAX_PARALLEL_TIMESTEPS", " 4 ");
    env::set_var("BLOBNET_FORWARD_ONLY_SCOPE_POOL", "");
    let config = RuntimeConfig::from_env()?;
    assert!(config.disable_implicit_engine_preference);
    assert_eq!(config.max_engine_name_length, 6);
    assert!(!config.rnn_executor);
    assert_eq!(config.executor.max_parallel_timesteps, 4);
    assert_eq!(config.forward_only_scope_pool, 2);

    env::set_var("BLOBNET_EXECUTOR_THREADS", "many");
    let err = RuntimeConfig::from_env().unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument { .. }), "{err}");

    for key in [
        "BLOBNET_DISABLE_IMPLICIT_ENGINE_PREFERENCE",
        "BLOBNET_MAX_ENGINE_NAME_LENGTH",
        "BLOBNET_RNN_EXECUTOR",
        "BLOBNET_EXECUTOR_MAX_PARALLEL_TIMESTEPS",
        "BLOBNET_FORWARD_ONLY_SCOPE_POOL",
        "BLOBNET_EXECUTOR_THREADS",
    ] {
        env::remove_var(key);
    }
    assert_eq!(RuntimeConfig::from_env()?, RuntimeConfig::default());
    Ok(())
}
