use flowbox::core::{Configuration, RuntimeConfig};
use flowbox::memory::PoolConfig;
use flowbox::resilience::ErrorPolicy;
use flowbox::StatusCode;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_configuration_getters() {
    let config = Configuration::from_value(json!({
        "width": 640,
        "height": "480",
        "scale": 1.5,
        "enabled": "true",
        "name": "front"
    }))
    .unwrap();

    assert_eq!(config.get_i64("width", 0), 640);
    assert_eq!(config.get_u32("height", 0), 480);
    assert_eq!(config.get_f64("scale", 0.0), 1.5);
    assert!(config.get_bool("enabled", false));
    assert_eq!(config.get_string("name", ""), "front");

    assert_eq!(config.get_i64("missing", 7), 7);
    assert_eq!(config.get_i64("name", 3), 3);
    assert_eq!(config.get_u32("scale", 9), 9);
    assert!(!config.get_bool("missing", false));
}

#[test]
fn test_configuration_negative_u32_falls_back() {
    let config = Configuration::new().with("width", -4);
    assert_eq!(config.get_u32("width", 10), 10);
    assert_eq!(config.get_i64("width", 10), -4);
}

#[test]
fn test_configuration_requires_object() {
    let err = Configuration::from_value(json!([1, 2])).unwrap_err();
    assert_eq!(err.code(), StatusCode::BadConfig);

    let empty = Configuration::from_value(serde_json::Value::Null).unwrap();
    assert_eq!(empty.keys().count(), 0);
}

#[test]
fn test_runtime_config_defaults() {
    let config = RuntimeConfig::from_json(json!({})).unwrap();

    assert_eq!(config.max_workers, 4);
    assert_eq!(config.event_timeout(), None);
    assert_eq!(config.error_policy, ErrorPolicy::Propagate);
    assert_eq!(config.pool, PoolConfig::default());
}

#[test]
fn test_runtime_config_from_json() {
    let config = RuntimeConfig::from_json(json!({
        "max_workers": 8,
        "event_timeout_ms": 250,
        "error_policy": "mark_error",
        "pool": { "max_slab_size": 1048576, "maintenance_interval_ms": 500 }
    }))
    .unwrap();

    assert_eq!(config.max_workers, 8);
    assert_eq!(config.event_timeout(), Some(Duration::from_millis(250)));
    assert_eq!(config.error_policy, ErrorPolicy::MarkError);
    assert_eq!(config.pool.max_slab_size, 1 << 20);
    assert_eq!(config.pool.idle_timeout_ms, PoolConfig::default().idle_timeout_ms);
    assert_eq!(config.maintenance_interval(), Duration::from_millis(500));
}

#[test]
fn test_runtime_config_rejects_zero_workers() {
    assert!(RuntimeConfig::from_json(json!({"max_workers": 0})).is_err());
    assert!(RuntimeConfig::from_json(json!({"error_policy": "retry_forever"})).is_err());
}

#[tokio::test]
async fn test_runtime_config_load_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("runtime.json");
    tokio::fs::write(&path, r#"{"max_workers": 2, "error_policy": "skip_item"}"#)
        .await
        .unwrap();

    let config = RuntimeConfig::load(&path).await.unwrap();
    assert_eq!(config.max_workers, 2);
    assert_eq!(config.error_policy, ErrorPolicy::SkipItem);
}

#[tokio::test]
async fn test_runtime_config_load_errors() {
    let temp_dir = TempDir::new().unwrap();

    let missing = temp_dir.path().join("missing.json");
    let err = RuntimeConfig::load(&missing).await.unwrap_err();
    assert!(err.to_string().contains("Failed to read runtime config"));

    let broken = temp_dir.path().join("broken.json");
    tokio::fs::write(&broken, "{ not json").await.unwrap();
    assert!(RuntimeConfig::load(&broken).await.is_err());
}
