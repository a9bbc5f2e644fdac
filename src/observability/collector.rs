use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::FlowUnitMetrics;

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub unit_id: String,
    pub items_processed: u64,
    pub errors_count: u64,
    pub avg_latency_us: u64,
    pub items: HashMap<String, Value>,
}

#[derive(Default)]
pub struct MetricsCollector {
    metrics: RwLock<HashMap<String, Arc<FlowUnitMetrics>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, unit_id: impl Into<String>, metrics: Arc<FlowUnitMetrics>) {
        self.metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(unit_id.into(), metrics);
    }

    /// Returns the metrics of `unit_id`, registering fresh ones if needed
    pub fn get_or_register(&self, unit_id: &str) -> Arc<FlowUnitMetrics> {
        if let Some(metrics) = self.get_unit_metrics(unit_id) {
            return metrics;
        }
        self.metrics
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(unit_id.to_string())
            .or_insert_with(|| Arc::new(FlowUnitMetrics::new(unit_id)))
            .clone()
    }

    pub fn get_unit_metrics(&self, unit_id: &str) -> Option<Arc<FlowUnitMetrics>> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(unit_id)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, MetricsSnapshot> {
        self.metrics
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, metrics)| {
                (
                    id.clone(),
                    MetricsSnapshot {
                        unit_id: metrics.unit_id().to_string(),
                        items_processed: metrics.items_processed(),
                        errors_count: metrics.errors_count(),
                        avg_latency_us: metrics.avg_latency_us(),
                        items: metrics.items(),
                    },
                )
            })
            .collect()
    }
}
