//! Configuration files and environment overrides.

use std::fs;
use std::time::Duration;
use tempfile::TempDir;

use tickframe::config::RuntimeConfig;
use tickframe::module::OnExceptionBehaviour;

#[test]
fn test_partial_file_overlays_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tickframe.toml");
    fs::write(
        &path,
        r#"
[performance]
max_tick_budget_ms = 2
init_stall_timeout_ms = 500

[exceptions]
on_update = "pause_module"
"#,
    )
    .unwrap();

    let config = RuntimeConfig::load_from(&path).unwrap();

    assert_eq!(config.performance.max_tick_budget_ms, Some(2));
    assert_eq!(config.performance.init_stall_timeout_ms, Some(500));
    assert_eq!(config.exceptions.on_update, OnExceptionBehaviour::PauseModule);
    // Untouched sections keep their defaults
    assert_eq!(config.exceptions.on_load, RuntimeConfig::default().exceptions.on_load);
    assert_eq!(config.observability, RuntimeConfig::default().observability);

    let defaults = config.module_defaults();
    assert_eq!(
        defaults.performance_policy.max_tick_budget,
        Some(Duration::from_millis(2))
    );
    assert_eq!(
        defaults.exception_policy.on_update,
        OnExceptionBehaviour::PauseModule
    );
}

#[test]
fn test_saved_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saved.toml");

    let mut config = RuntimeConfig::default();
    config.observability.json = true;
    config.observability.log_level = "tickframe=debug".to_string();
    config.tick.fixed_every = 0;
    config.exceptions.skip_unload_if_exception = false;
    config.save_to_file(&path).unwrap();

    let loaded = RuntimeConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[exceptions]\non_update = \"explode\"\n").unwrap();

    assert!(RuntimeConfig::load_from(&path).is_err());
}

#[test]
fn test_environment_overrides_defaults() {
    std::env::set_var("TICKFRAME_TICK__INTERVAL_MS", "5");
    let config = RuntimeConfig::load().unwrap();
    std::env::remove_var("TICKFRAME_TICK__INTERVAL_MS");

    assert_eq!(config.tick.interval_ms, 5);
    assert_eq!(config.performance, RuntimeConfig::default().performance);
}
