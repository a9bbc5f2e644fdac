pub mod metadata;

pub use metadata::{
    FlowUnitDescriptor, FlowUnitDescriptorFactory, FlowUnitDescriptorFactoryWrapper,
    FlowUnitFactory, FlowUnitOption, PortDescriptor,
};

use anyhow::{anyhow, Result};
use std::collections::HashMap;

use crate::core::FlowUnit;

/// Flow unit types known to the runtime, keyed by name
#[derive(Debug, Default)]
pub struct FlowUnitRegistry {
    descriptors: HashMap<String, FlowUnitDescriptor>,
}

impl FlowUnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects every descriptor submitted by `#[derive(FlowUnitDesc)]`
    pub fn from_inventory() -> Self {
        let mut registry = Self::new();
        for wrapper in inventory::iter::<FlowUnitDescriptorFactoryWrapper> {
            registry.register((wrapper.0)());
        }
        registry
    }

    pub fn register(&mut self, descriptor: FlowUnitDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&FlowUnitDescriptor> {
        self.descriptors.get(name)
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.descriptors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn FlowUnit>> {
        let descriptor = self
            .get(name)
            .ok_or_else(|| anyhow!("Unknown flow unit: {}", name))?;
        descriptor
            .create_instance()
            .ok_or_else(|| anyhow!("Flow unit {} must be constructed explicitly", name))
    }
}
