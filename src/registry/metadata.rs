use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Configuration, FlowError, FlowType, FlowUnit, Result};

/// A named input or output port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub name: String,
    pub device_type: String,
}

/// Declaration of one configurable option
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowUnitOption {
    pub name: String,
    #[serde(rename = "type")]
    pub option_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub description: String,
}

impl FlowUnitOption {
    fn accepts(&self, value: &Value) -> bool {
        match self.option_type.as_str() {
            "int" => value.is_i64() || value.is_u64() || value.as_str().is_some_and(|s| s.trim().parse::<i64>().is_ok()),
            "float" => value.is_number() || value.as_str().is_some_and(|s| s.trim().parse::<f64>().is_ok()),
            "bool" => value.is_boolean() || matches!(value.as_str(), Some("true" | "false")),
            "string" => value.is_string(),
            _ => true,
        }
    }

    fn default_value(&self) -> Option<Value> {
        let raw = self.default.as_deref()?;
        let value = match self.option_type.as_str() {
            "int" => raw.parse::<i64>().ok().map(Value::from),
            "float" => raw.parse::<f64>().ok().map(Value::from),
            "bool" => raw.parse::<bool>().ok().map(Value::from),
            _ => None,
        };
        Some(value.unwrap_or_else(|| Value::from(raw)))
    }
}

/// Factory function type for creating flow unit instances
pub type FlowUnitFactory = fn() -> Box<dyn FlowUnit>;

/// Complete description of a flow unit type
#[derive(Clone)]
pub struct FlowUnitDescriptor {
    pub name: String,
    pub group: String,
    pub description: String,
    pub flow_type: FlowType,
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
    pub options: Vec<FlowUnitOption>,
    /// `None` for units that need constructor arguments
    pub factory: Option<FlowUnitFactory>,
}

impl FlowUnitDescriptor {
    pub fn option(&self, name: &str) -> Option<&FlowUnitOption> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn create_instance(&self) -> Option<Box<dyn FlowUnit>> {
        self.factory.map(|factory| factory())
    }

    /// Checks required options and option types
    pub fn validate(&self, config: &Configuration) -> Result<()> {
        for option in &self.options {
            match config.get_value(&option.name) {
                Some(value) if !option.accepts(value) => {
                    return Err(FlowError::bad_config(format!(
                        "{}: option `{}` expects {}, got {}",
                        self.name, option.name, option.option_type, value
                    )));
                }
                None if option.required && option.default.is_none() => {
                    return Err(FlowError::bad_config(format!(
                        "{}: required option `{}` is missing",
                        self.name, option.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validates `config` and fills in declared defaults
    pub fn resolve(&self, config: &Configuration) -> Result<Configuration> {
        self.validate(config)?;

        let mut resolved = config.clone();
        for option in &self.options {
            if resolved.contains(&option.name) {
                continue;
            }
            if let Some(value) = option.default_value() {
                resolved.set(option.name.clone(), value);
            }
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for FlowUnitDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowUnitDescriptor")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("flow_type", &self.flow_type)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("options", &self.options)
            .field("has_factory", &self.factory.is_some())
            .finish()
    }
}

// Factory type for creating descriptors at runtime
pub type FlowUnitDescriptorFactory = fn() -> FlowUnitDescriptor;

// Wrapper for inventory collection
pub struct FlowUnitDescriptorFactoryWrapper(pub FlowUnitDescriptorFactory);

inventory::collect!(FlowUnitDescriptorFactoryWrapper);
