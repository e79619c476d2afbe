//! Inbound automation requests and the typed actions they resolve to

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Key/value parameters of a request or a learned pattern
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Payload keys that carry a locator rather than a plain value
pub const LOCATOR_KEYS: &[&str] = &["selector", "locator", "target", "element"];

#[derive(Debug, Error, PartialEq)]
pub enum ActionError {
    #[error("Unknown request kind: {0}")]
    UnknownKind(String),

    #[error("{kind} requires field '{field}'")]
    MissingField { kind: ActionKind, field: &'static str },

    #[error("{kind} field '{field}' must be a string")]
    InvalidField { kind: ActionKind, field: &'static str },
}

/// Category of action a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ActionKind {
    FillText,
    Click,
    SelectProject,
    SelectOption,
    Navigate,
    Submit,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::FillText,
        ActionKind::Click,
        ActionKind::SelectProject,
        ActionKind::SelectOption,
        ActionKind::Navigate,
        ActionKind::Submit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::FillText => "fill-text",
            ActionKind::Click => "click",
            ActionKind::SelectProject => "select-project",
            ActionKind::SelectOption => "select-option",
            ActionKind::Navigate => "navigate",
            ActionKind::Submit => "submit",
        }
    }

    /// Payload fields (besides the target locator) the action cannot run without
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ActionKind::FillText => &["value"],
            ActionKind::SelectOption => &["option"],
            ActionKind::Navigate => &["url"],
            ActionKind::Click | ActionKind::SelectProject | ActionKind::Submit => &[],
        }
    }

    /// Whether the action addresses a page element
    pub fn targets_element(&self) -> bool {
        !matches!(self, ActionKind::Navigate)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");

        match normalized.as_str() {
            "fill-text" | "fill" | "fill-prompt" | "type" => Ok(ActionKind::FillText),
            "click" => Ok(ActionKind::Click),
            "select-project" => Ok(ActionKind::SelectProject),
            "select-option" | "select" => Ok(ActionKind::SelectOption),
            "navigate" | "goto" => Ok(ActionKind::Navigate),
            "submit" => Ok(ActionKind::Submit),
            _ => Err(ActionError::UnknownKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for ActionKind {
    type Error = ActionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A fully typed action, ready to hand to a capability adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AutomationAction {
    FillText { target: String, value: String },
    Click { target: String },
    SelectProject { target: String },
    SelectOption { target: String, option: String },
    Navigate { url: String },
    Submit { target: String },
}

impl AutomationAction {
    /// Build the typed action for `kind` from a payload map.
    ///
    /// `default_target` is used when the payload names no locator itself, which
    /// is the normal case when replaying a learned pattern.
    pub fn from_payload(
        kind: ActionKind,
        payload: &Payload,
        default_target: Option<&str>,
    ) -> Result<Self, ActionError> {
        let target = || -> Result<String, ActionError> {
            for key in LOCATOR_KEYS {
                if let Some(value) = payload.get(*key) {
                    return value
                        .as_str()
                        .map(str::to_string)
                        .ok_or(ActionError::InvalidField { kind, field: "selector" });
                }
            }
            default_target
                .map(str::to_string)
                .ok_or(ActionError::MissingField { kind, field: "selector" })
        };

        let action = match kind {
            ActionKind::FillText => AutomationAction::FillText {
                target: target()?,
                value: string_field(kind, payload, &["value", "text"], "value")?,
            },
            ActionKind::Click => AutomationAction::Click { target: target()? },
            ActionKind::SelectProject => AutomationAction::SelectProject { target: target()? },
            ActionKind::SelectOption => AutomationAction::SelectOption {
                target: target()?,
                option: string_field(kind, payload, &["option", "value"], "option")?,
            },
            ActionKind::Navigate => AutomationAction::Navigate {
                url: string_field(kind, payload, &["url", "href"], "url")?,
            },
            ActionKind::Submit => AutomationAction::Submit { target: target()? },
        };

        Ok(action)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            AutomationAction::FillText { .. } => ActionKind::FillText,
            AutomationAction::Click { .. } => ActionKind::Click,
            AutomationAction::SelectProject { .. } => ActionKind::SelectProject,
            AutomationAction::SelectOption { .. } => ActionKind::SelectOption,
            AutomationAction::Navigate { .. } => ActionKind::Navigate,
            AutomationAction::Submit { .. } => ActionKind::Submit,
        }
    }

    /// Element locator the action addresses, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            AutomationAction::FillText { target, .. }
            | AutomationAction::Click { target }
            | AutomationAction::SelectProject { target }
            | AutomationAction::SelectOption { target, .. }
            | AutomationAction::Submit { target } => Some(target),
            AutomationAction::Navigate { .. } => None,
        }
    }

    /// Same action pointed at a different locator (used when walking fallbacks)
    pub fn retarget(&self, locator: &str) -> Self {
        let mut action = self.clone();
        match &mut action {
            AutomationAction::FillText { target, .. }
            | AutomationAction::Click { target }
            | AutomationAction::SelectProject { target }
            | AutomationAction::SelectOption { target, .. }
            | AutomationAction::Submit { target } => *target = locator.to_string(),
            AutomationAction::Navigate { .. } => {}
        }
        action
    }
}

fn string_field(
    kind: ActionKind,
    payload: &Payload,
    keys: &[&str],
    field: &'static str,
) -> Result<String, ActionError> {
    for key in keys {
        if let Some(value) = payload.get(*key) {
            return match value {
                serde_json::Value::String(s) => Ok(s.clone()),
                serde_json::Value::Number(n) => Ok(n.to_string()),
                serde_json::Value::Bool(b) => Ok(b.to_string()),
                _ => Err(ActionError::InvalidField { kind, field }),
            };
        }
    }
    Err(ActionError::MissingField { kind, field })
}

/// Page identity a request originates from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub url: String,
    pub hostname: String,
    #[serde(default = "root_path")]
    pub pathname: String,
    #[serde(default)]
    pub title: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub structural_fingerprint: Option<String>,
}

fn root_path() -> String {
    "/".to_string()
}

/// Request to perform an automation, as received from a remote requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRequest {
    pub request_kind: ActionKind,
    #[serde(default)]
    pub payload: Payload,
    pub context: RequestContext,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Caller's own confidence in the request; the match score stands in when absent
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl AutomationRequest {
    pub fn new(request_kind: ActionKind, payload: Payload, context: RequestContext) -> Self {
        Self { request_kind, payload, context, correlation_id: None, confidence: None }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Typed action for this request on its own, without a learned locator
    pub fn action(&self) -> Result<AutomationAction, ActionError> {
        AutomationAction::from_payload(self.request_kind, &self.payload, None)
    }
}
