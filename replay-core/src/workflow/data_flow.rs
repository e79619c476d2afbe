//! Explicit data flow between phases
//!
//! A phase sees only the inputs it maps from the run's data map. Declared
//! transformations and validations run on those inputs before any step, and
//! only the declared outputs are written back.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use super::conditions::{Condition, resolve};
use super::{DataMap, Result, WorkflowError};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([\w.-]+)\s*\}\}").expect("valid placeholder regex"));

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataFlowError {
    #[error("Required input {0} is missing")]
    Missing(String),

    #[error("Input {key} does not match {pattern}")]
    PatternMismatch { key: String, pattern: String },

    #[error("Input {key} is outside the allowed range")]
    OutOfRange { key: String },

    #[error("Input {0} is not a number")]
    NotNumeric(String),

    #[error("No validator registered as {0}")]
    UnknownValidator(String),

    #[error("Validator {validator} rejected {key}: {message}")]
    Rejected { validator: String, key: String, message: String },

    #[error("Transformation into {target} failed: {message}")]
    Transform { target: String, message: String },

    #[error("Placeholder {0} has no value")]
    MissingPlaceholder(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arithmetic {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Average,
    Min,
    Max,
    Count,
    Concat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transformation {
    /// Render `{{key}}` placeholders into a string
    Format { target: String, template: String },
    /// Fold numeric operands left to right; string operands name input keys
    Calculate { target: String, operation: Arithmetic, operands: Vec<Value> },
    Lookup {
        target: String,
        key: String,
        table: BTreeMap<String, Value>,
        #[serde(default)]
        default: Option<Value>,
    },
    Aggregate {
        target: String,
        source: String,
        function: Aggregation,
        #[serde(default)]
        separator: String,
    },
    /// Keep array items for which `predicate` holds, with the item bound as `item`
    Filter { target: String, source: String, predicate: Condition },
}

impl Transformation {
    pub fn target(&self) -> &str {
        match self {
            Transformation::Format { target, .. }
            | Transformation::Calculate { target, .. }
            | Transformation::Lookup { target, .. }
            | Transformation::Aggregate { target, .. }
            | Transformation::Filter { target, .. } => target,
        }
    }

    pub fn apply(&self, scope: &DataMap) -> std::result::Result<Value, DataFlowError> {
        let fail = |message: String| DataFlowError::Transform { target: self.target().to_string(), message };

        match self {
            Transformation::Format { template, .. } => render(template, scope).map(Value::String),
            Transformation::Calculate { operation, operands, .. } => {
                let mut values = operands.iter().map(|operand| match operand {
                    Value::String(key) => resolve(scope, key)
                        .and_then(Value::as_f64)
                        .ok_or_else(|| DataFlowError::NotNumeric(key.clone())),
                    other => other.as_f64().ok_or_else(|| fail(format!("{other} is not a number"))),
                });

                let mut acc = values.next().ok_or_else(|| fail("no operands".to_string()))??;
                for value in values {
                    let value = value?;
                    acc = match operation {
                        Arithmetic::Add => acc + value,
                        Arithmetic::Subtract => acc - value,
                        Arithmetic::Multiply => acc * value,
                        Arithmetic::Divide if value == 0.0 => return Err(fail("division by zero".to_string())),
                        Arithmetic::Divide => acc / value,
                    };
                }
                number(acc).ok_or_else(|| fail("result is not finite".to_string()))
            }
            Transformation::Lookup { key, table, default, .. } => {
                let needle = match resolve(scope, key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err(DataFlowError::Missing(key.clone())),
                };
                table
                    .get(&needle)
                    .or(default.as_ref())
                    .cloned()
                    .ok_or_else(|| fail(format!("no entry for {needle}")))
            }
            Transformation::Aggregate { source, function, separator, .. } => {
                let items = array(scope, source)?;
                let numbers: Vec<f64> = items.iter().filter_map(Value::as_f64).collect();
                let result = match function {
                    Aggregation::Count => return Ok(Value::from(items.len())),
                    Aggregation::Concat => {
                        let parts: Vec<String> = items
                            .iter()
                            .map(|v| match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            })
                            .collect();
                        return Ok(Value::String(parts.join(separator)));
                    }
                    Aggregation::Sum => numbers.iter().sum(),
                    Aggregation::Average if numbers.is_empty() => return Ok(Value::Null),
                    Aggregation::Average => numbers.iter().sum::<f64>() / numbers.len() as f64,
                    Aggregation::Min => match numbers.iter().copied().reduce(f64::min) {
                        Some(min) => min,
                        None => return Ok(Value::Null),
                    },
                    Aggregation::Max => match numbers.iter().copied().reduce(f64::max) {
                        Some(max) => max,
                        None => return Ok(Value::Null),
                    },
                };
                number(result).ok_or_else(|| fail("result is not finite".to_string()))
            }
            Transformation::Filter { source, predicate, .. } => {
                let items = array(scope, source)?;
                let mut item_scope = scope.clone();
                let mut kept = Vec::new();
                for item in items {
                    item_scope.insert("item".to_string(), item.clone());
                    if predicate.evaluate(&item_scope) {
                        kept.push(item.clone());
                    }
                }
                Ok(Value::Array(kept))
            }
        }
    }
}

fn array<'a>(scope: &'a DataMap, key: &str) -> std::result::Result<&'a Vec<Value>, DataFlowError> {
    match resolve(scope, key) {
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(DataFlowError::Transform { target: key.to_string(), message: "not an array".to_string() }),
        None => Err(DataFlowError::Missing(key.to_string())),
    }
}

fn number(value: f64) -> Option<Value> {
    Number::from_f64(value).map(Value::Number)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum DataValidation {
    Required { key: String },
    Pattern { key: String, regex: String },
    Range {
        key: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Named validator registered on the engine
    Custom { key: String, validator: String },
}

impl DataValidation {
    pub fn check(&self, scope: &DataMap, validators: &ValidatorRegistry) -> std::result::Result<(), DataFlowError> {
        match self {
            DataValidation::Required { key } => match resolve(scope, key) {
                Some(v) if !v.is_null() => Ok(()),
                _ => Err(DataFlowError::Missing(key.clone())),
            },
            DataValidation::Pattern { key, regex } => {
                let text = match resolve(scope, key) {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err(DataFlowError::Missing(key.clone())),
                };
                let matches = Regex::new(regex).is_ok_and(|re| re.is_match(&text));
                if matches {
                    Ok(())
                } else {
                    Err(DataFlowError::PatternMismatch { key: key.clone(), pattern: regex.clone() })
                }
            }
            DataValidation::Range { key, min, max } => {
                let value = resolve(scope, key)
                    .and_then(Value::as_f64)
                    .ok_or_else(|| DataFlowError::NotNumeric(key.clone()))?;
                let in_range = min.is_none_or(|m| value >= m) && max.is_none_or(|m| value <= m);
                if in_range { Ok(()) } else { Err(DataFlowError::OutOfRange { key: key.clone() }) }
            }
            DataValidation::Custom { key, validator } => {
                let value = resolve(scope, key).cloned().unwrap_or(Value::Null);
                validators.check(validator, &value).map_err(|e| match e {
                    DataFlowError::Rejected { validator, message, .. } => {
                        DataFlowError::Rejected { validator, key: key.clone(), message }
                    }
                    other => other,
                })
            }
        }
    }
}

/// A phase output written back to the run's data map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBinding {
    pub key: String,
    /// Path in the phase scope; defaults to `key`
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFlow {
    /// Phase input name → key (or dotted path) in the run's data map
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub transforms: Vec<Transformation>,
    #[serde(default)]
    pub validations: Vec<DataValidation>,
    #[serde(default)]
    pub outputs: Vec<OutputBinding>,
}

impl DataFlow {
    /// Build the phase scope: mapped inputs, then transformations, then validations
    pub fn prepare(&self, data: &DataMap, validators: &ValidatorRegistry) -> std::result::Result<DataMap, DataFlowError> {
        let mut scope: DataMap = self
            .inputs
            .iter()
            .filter_map(|(name, source)| resolve(data, source).map(|v| (name.clone(), v.clone())))
            .collect();

        for transform in &self.transforms {
            let value = transform.apply(&scope)?;
            scope.insert(transform.target().to_string(), value);
        }

        for validation in &self.validations {
            validation.check(&scope, validators)?;
        }

        Ok(scope)
    }

    /// Declared outputs present in the scope after the phase ran
    pub fn collect_outputs(&self, scope: &DataMap) -> DataMap {
        self.outputs
            .iter()
            .filter_map(|binding| {
                let from = binding.from.as_deref().unwrap_or(&binding.key);
                let value = resolve(scope, from);
                if value.is_none() {
                    tracing::debug!("Output {} has no value at {}", binding.key, from);
                }
                value.map(|v| (binding.key.clone(), v.clone()))
            })
            .collect()
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|b| b.key.as_str())
    }

    pub fn custom_validators(&self) -> impl Iterator<Item = &str> {
        self.validations.iter().filter_map(|v| match v {
            DataValidation::Custom { validator, .. } => Some(validator.as_str()),
            _ => None,
        })
    }

    pub fn compile_check(&self) -> Result<()> {
        for validation in &self.validations {
            if let DataValidation::Pattern { regex, .. } = validation {
                Regex::new(regex).map_err(|e| WorkflowError::InvalidRegex {
                    pattern: regex.clone(),
                    message: e.to_string(),
                })?;
            }
        }
        for transform in &self.transforms {
            if let Transformation::Filter { predicate, .. } = transform {
                predicate.compile_check()?;
            }
        }
        Ok(())
    }
}

/// Replace every `{{key}}` in `template` with the scope value
pub fn render(template: &str, scope: &DataMap) -> std::result::Result<String, DataFlowError> {
    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = resolve(scope, key.as_str())
            .ok_or_else(|| DataFlowError::MissingPlaceholder(key.as_str().to_string()))?;
        rendered.push_str(&template[last..whole.start()]);
        match value {
            Value::String(s) => rendered.push_str(s),
            other => rendered.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

/// Fill placeholders in every string inside `value`.
///
/// A string that is exactly one placeholder takes the scope value as is, so
/// numbers and objects keep their type.
pub fn fill_templates(value: &Value, scope: &DataMap) -> std::result::Result<Value, DataFlowError> {
    match value {
        Value::String(s) => {
            let whole_key = PLACEHOLDER
                .captures(s)
                .filter(|caps| caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len()))
                .and_then(|caps| caps.get(1))
                .map(|key| key.as_str());

            match whole_key {
                Some(key) => resolve(scope, key)
                    .cloned()
                    .ok_or_else(|| DataFlowError::MissingPlaceholder(key.to_string())),
                None => render(s, scope).map(Value::String),
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| fill_templates(v, scope))
            .collect::<std::result::Result<_, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| fill_templates(v, scope).map(|v| (k.clone(), v)))
            .collect::<std::result::Result<_, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

pub type ValidatorFn = Arc<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Named custom validators, shared by every run of an engine
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: Arc<DashMap<String, ValidatorFn>>,
}

impl ValidatorRegistry {
    pub fn register<F>(&self, name: impl Into<String>, validator: F)
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.validators.insert(name.into(), Arc::new(validator));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    pub fn check(&self, name: &str, value: &Value) -> std::result::Result<(), DataFlowError> {
        let validator = self
            .validators
            .get(name)
            .map(|v| Arc::clone(v.value()))
            .ok_or_else(|| DataFlowError::UnknownValidator(name.to_string()))?;

        validator(value).map_err(|message| DataFlowError::Rejected {
            validator: name.to_string(),
            key: String::new(),
            message,
        })
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.validators.iter().map(|e| e.key().clone()).collect();
        names.sort();
        f.debug_struct("ValidatorRegistry").field("validators", &names).finish()
    }
}
