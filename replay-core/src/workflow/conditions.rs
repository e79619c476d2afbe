//! Conditional rules evaluated against the running data map

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{DataMap, Result, WorkflowError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Exists { key: String },
    Equals { key: String, value: Value },
    NotEquals { key: String, value: Value },
    GreaterThan { key: String, value: f64 },
    LessThan { key: String, value: f64 },
    /// Substring, array element, or object key
    Contains { key: String, value: Value },
    Matches { key: String, regex: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn evaluate(&self, data: &DataMap) -> bool {
        match self {
            Condition::Always => true,
            Condition::Exists { key } => resolve(data, key).is_some_and(|v| !v.is_null()),
            Condition::Equals { key, value } => resolve(data, key) == Some(value),
            Condition::NotEquals { key, value } => resolve(data, key) != Some(value),
            Condition::GreaterThan { key, value } => {
                resolve(data, key).and_then(Value::as_f64).is_some_and(|v| v > *value)
            }
            Condition::LessThan { key, value } => {
                resolve(data, key).and_then(Value::as_f64).is_some_and(|v| v < *value)
            }
            Condition::Contains { key, value } => match (resolve(data, key), value) {
                (Some(Value::String(haystack)), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                (Some(Value::Object(map)), Value::String(needle)) => map.contains_key(needle),
                _ => false,
            },
            Condition::Matches { key, regex } => {
                let Some(Value::String(text)) = resolve(data, key) else {
                    return false;
                };
                Regex::new(regex).is_ok_and(|re| re.is_match(text))
            }
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(data)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(data)),
            Condition::Not { condition } => !condition.evaluate(data),
        }
    }

    /// Reject regexes that do not compile before a run starts
    pub fn compile_check(&self) -> Result<()> {
        match self {
            Condition::Matches { regex, .. } => Regex::new(regex).map(|_| ()).map_err(|e| {
                WorkflowError::InvalidRegex { pattern: regex.clone(), message: e.to_string() }
            }),
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().try_for_each(Condition::compile_check)
            }
            Condition::Not { condition } => condition.compile_check(),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Continue,
    Skip,
    JumpTo { phase: String },
    /// Run the phase again while the rule keeps answering repeat, at most `max_times` extra runs
    Repeat { max_times: u32 },
    Fail {
        #[serde(default)]
        message: Option<String>,
    },
}

fn default_otherwise() -> RuleAction {
    RuleAction::Skip
}

/// `then` applies when the condition holds, `otherwise` when it does not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub when: Condition,
    #[serde(default)]
    pub then: RuleAction,
    #[serde(default = "default_otherwise")]
    pub otherwise: RuleAction,
}

impl ConditionalRule {
    pub fn evaluate(&self, data: &DataMap) -> &RuleAction {
        if self.when.evaluate(data) { &self.then } else { &self.otherwise }
    }

    pub fn jump_targets(&self) -> impl Iterator<Item = &str> {
        [&self.then, &self.otherwise].into_iter().filter_map(|a| match a {
            RuleAction::JumpTo { phase } => Some(phase.as_str()),
            _ => None,
        })
    }
}

/// Look up a dotted path (`user.address.city`, `items.0`) in the data map
pub fn resolve<'a>(data: &'a DataMap, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = data.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data() -> DataMap {
        let mut data = DataMap::new();
        data.insert("count".to_string(), json!(3));
        data.insert("status".to_string(), json!("ready to send"));
        data.insert("user".to_string(), json!({"name": "Ada", "tags": ["admin", "beta"]}));
        data
    }

    #[test]
    fn test_resolve_paths() {
        let data = data();
        assert_eq!(resolve(&data, "user.name"), Some(&json!("Ada")));
        assert_eq!(resolve(&data, "user.tags.1"), Some(&json!("beta")));
        assert_eq!(resolve(&data, "user.missing"), None);
        assert_eq!(resolve(&data, "count.inner"), None);
    }

    #[test]
    fn test_leaf_conditions() {
        let data = data();
        assert!(Condition::Exists { key: "count".to_string() }.evaluate(&data));
        assert!(Condition::GreaterThan { key: "count".to_string(), value: 2.0 }.evaluate(&data));
        assert!(!Condition::LessThan { key: "count".to_string(), value: 2.0 }.evaluate(&data));
        assert!(Condition::Contains { key: "status".to_string(), value: json!("send") }.evaluate(&data));
        assert!(Condition::Contains { key: "user.tags".to_string(), value: json!("admin") }.evaluate(&data));
        assert!(Condition::Matches { key: "user.name".to_string(), regex: "^A".to_string() }.evaluate(&data));
        assert!(!Condition::Equals { key: "missing".to_string(), value: json!(null) }.evaluate(&data));
    }

    #[test]
    fn test_combinators() {
        let data = data();
        let ready = Condition::All {
            conditions: vec![
                Condition::Exists { key: "user".to_string() },
                Condition::Not { condition: Box::new(Condition::Equals { key: "count".to_string(), value: json!(0) }) },
            ],
        };
        assert!(ready.evaluate(&data));
        assert!(!Condition::Any { conditions: Vec::new() }.evaluate(&data));
    }

    #[test]
    fn test_rule_defaults_to_skip_when_false() {
        let rule: ConditionalRule =
            serde_json::from_value(json!({"when": {"op": "exists", "key": "absent"}})).unwrap();
        assert_eq!(rule.evaluate(&data()), &RuleAction::Skip);
        assert_eq!(rule.then, RuleAction::Continue);
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let bad = Condition::Any {
            conditions: vec![Condition::Matches { key: "a".to_string(), regex: "(".to_string() }],
        };
        assert!(matches!(bad.compile_check(), Err(WorkflowError::InvalidRegex { .. })));
    }
}
