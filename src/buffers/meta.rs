use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::core::FlowError;

/// A dynamically typed metadata value tagged with its type
#[derive(Clone)]
pub struct MetaValue {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl MetaValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl fmt::Debug for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetaValue<{}>", self.type_name)
    }
}

/// String keyed map of typed values
///
/// Values are immutable once inserted; `set` replaces the entry, so a clone
/// of the map is independent of the original.
#[derive(Debug, Clone, Default)]
pub struct MetaMap {
    values: HashMap<String, MetaValue>,
}

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), MetaValue::new(value));
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: MetaValue) {
        self.values.insert(key.into(), value);
    }

    /// `None` when the key is missing or holds another type
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.get_ref::<T>(key).cloned()
    }

    pub fn get_ref<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref::<T>()
    }

    pub fn get_or<T: Any + Clone>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn value(&self, key: &str) -> Option<&MetaValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.values.remove(key)
    }

    /// Copies every entry of `other`; existing keys are kept unless `overwrite`
    pub fn merge(&mut self, other: &MetaMap, overwrite: bool) {
        for (key, value) in &other.values {
            if overwrite || !self.values.contains_key(key) {
                self.values.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Per-buffer metadata plus an optional terminal error
#[derive(Debug, Clone, Default)]
pub struct BufferMeta {
    custom: MetaMap,
    error: Option<FlowError>,
}

impl BufferMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.custom.set(key, value);
    }

    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.custom.get(key)
    }

    pub fn get_or<T: Any + Clone>(&self, key: &str, default: T) -> T {
        self.custom.get_or(key, default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.custom.contains(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<MetaValue> {
        self.custom.remove(key)
    }

    pub fn custom(&self) -> &MetaMap {
        &self.custom
    }

    pub fn set_error(&mut self, error: FlowError) {
        self.error = Some(error);
    }

    pub fn error(&self) -> Option<&FlowError> {
        self.error.as_ref()
    }

    pub fn deep_copy(&self) -> Self {
        self.clone()
    }

    pub fn copy_meta(&mut self, other: &BufferMeta, overwrite: bool) {
        self.custom.merge(&other.custom, overwrite);
    }
}

/// Stream level metadata shared by every item of one stream
#[derive(Debug, Default)]
pub struct DataMeta {
    values: RwLock<MetaMap>,
}

impl DataMeta {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set(key, value);
    }

    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    pub fn snapshot(&self) -> MetaMap {
        self.values
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
