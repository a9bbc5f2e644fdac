use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::time::Duration;

use super::{FlowError, Result};
use crate::memory::PoolConfig;
use crate::resilience::ErrorPolicy;

/// Resolved options handed to `FlowUnit::open`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    values: Map<String, Value>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            Value::Null => Ok(Self::default()),
            other => Err(FlowError::bad_config(format!(
                "configuration must be an object, got {other}"
            ))),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(value) => value.as_i64().unwrap_or(default),
            None => default,
        }
    }

    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        u32::try_from(self.get_i64(key, i64::from(default))).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.values.get(key) {
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            Some(value) => value.as_f64().unwrap_or(default),
            None => default,
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => match s.as_str() {
                "true" => true,
                "false" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Process-wide runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound of concurrently executing stream invocations
    pub max_workers: usize,
    /// How long a continuing flow unit may wait for its next event
    pub event_timeout_ms: Option<u64>,
    pub error_policy: ErrorPolicy,
    pub pool: PoolConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            event_timeout_ms: None,
            error_policy: ErrorPolicy::Propagate,
            pool: PoolConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(config: Value) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_value(config)
            .context("Failed to parse runtime config")?;
        if config.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        Ok(config)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await
            .with_context(|| format!("Failed to read runtime config {}", path.display()))?;
        let value: Value = serde_json::from_str(&content)
            .context("Failed to parse runtime config JSON")?;
        Self::from_json(value)
    }

    pub fn event_timeout(&self) -> Option<Duration> {
        self.event_timeout_ms.map(Duration::from_millis)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.pool.maintenance_interval_ms)
    }
}
