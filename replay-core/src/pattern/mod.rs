//! Learned automation patterns
//!
//! A pattern is created from a single confirmed demonstration and afterwards
//! only changes through execution outcomes. The bounds on confidence, the
//! history length and the counter relationship are enforced here so that no
//! caller can break them.

pub mod request;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::error::FailureReason;

pub use request::{
    ActionError, ActionKind, AutomationAction, AutomationRequest, LOCATOR_KEYS, Payload,
    RequestContext,
};

pub type PatternId = Uuid;

pub const MIN_CONFIDENCE: f64 = 0.1;
pub const MAX_CONFIDENCE: f64 = 2.0;
pub const INITIAL_CONFIDENCE: f64 = 1.0;
pub const SUCCESS_STEP: f64 = 0.05;
pub const FAILURE_STEP: f64 = 0.1;
pub const HISTORY_LIMIT: usize = 10;

/// Host-interpretable locator plus ordered fallbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LocatorHint {
    pub primary: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl LocatorHint {
    pub fn new(primary: impl Into<String>) -> Self {
        Self { primary: primary.into(), fallbacks: Vec::new() }
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Primary locator followed by each fallback, in order
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// Origin/page identity the pattern was learned against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginContext {
    pub hostname: String,
    pub path: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub structural_fingerprint: Option<String>,
    pub learned_at: DateTime<Utc>,
}

impl OriginContext {
    pub fn from_request(context: &RequestContext) -> Self {
        Self {
            hostname: context.hostname.clone(),
            path: context.pathname.clone(),
            url: (!context.url.is_empty()).then(|| context.url.clone()),
            title: (!context.title.is_empty()).then(|| context.title.clone()),
            structural_fingerprint: context.structural_fingerprint.clone(),
            learned_at: context.timestamp,
        }
    }
}

/// One recorded execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<FailureReason>,
    #[serde(default)]
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionRecord {
    pub fn success(at: DateTime<Utc>, duration_ms: u64) -> Self {
        Self { at, success: true, reason: None, message: None, duration_ms }
    }

    pub fn failure(
        at: DateTime<Utc>,
        reason: FailureReason,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self { at, success: false, reason: Some(reason), message: Some(message.into()), duration_ms }
    }
}

/// Everything needed to create a pattern from a confirmed demonstration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub request_kind: ActionKind,
    #[serde(default)]
    pub payload: Payload,
    pub locator: LocatorHint,
    pub origin: OriginContext,
}

impl PatternDefinition {
    /// Definition learned from `request` with the element the human pointed at
    pub fn from_request(request: &AutomationRequest, locator: LocatorHint) -> Self {
        Self {
            name: None,
            request_kind: request.request_kind,
            payload: request.payload.clone(),
            locator,
            origin: OriginContext::from_request(&request.context),
        }
    }
}

/// The unit of learned automation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub name: String,
    pub request_kind: ActionKind,
    pub payload_shape: Payload,
    pub locator: LocatorHint,
    pub origin: OriginContext,
    pub(crate) confidence: f64,
    pub(crate) usage_count: u64,
    pub(crate) success_count: u64,
    pub(crate) execution_history: VecDeque<ExecutionRecord>,
    pub(crate) last_executed_at: Option<DateTime<Utc>>,
    pub(crate) version: u32,
    pub updated_at: DateTime<Utc>,
    /// Consecutive audits that flagged this pattern for retraining
    #[serde(default)]
    pub(crate) retraining_flags: u32,
    /// Set on copies received through a share; the copy is purged afterwards
    #[serde(default)]
    pub share_expires_at: Option<DateTime<Utc>>,
}

impl Pattern {
    pub fn new(definition: PatternDefinition, now: DateTime<Utc>) -> Self {
        let name = definition.name.unwrap_or_else(|| {
            format!("{} on {}{}", definition.request_kind, definition.origin.hostname, definition.origin.path)
        });

        Self {
            id: Uuid::new_v4(),
            name,
            request_kind: definition.request_kind,
            payload_shape: definition.payload,
            locator: definition.locator,
            origin: definition.origin,
            confidence: INITIAL_CONFIDENCE,
            usage_count: 0,
            success_count: 0,
            execution_history: VecDeque::new(),
            last_executed_at: None,
            version: 1,
            updated_at: now,
            retraining_flags: 0,
            share_expires_at: None,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn execution_history(&self) -> &VecDeque<ExecutionRecord> {
        &self.execution_history
    }

    pub fn last_executed_at(&self) -> Option<DateTime<Utc>> {
        self.last_executed_at
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn retraining_flags(&self) -> u32 {
        self.retraining_flags
    }

    /// successCount / usageCount, 0 for an unused pattern
    pub fn success_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.success_count as f64 / self.usage_count as f64
        }
    }

    /// Days since the pattern was learned, measured at `now`
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        days_between(self.origin.learned_at, now)
    }

    /// Days since the last execution, or since learning when never executed
    pub fn days_since_last_execution(&self, now: DateTime<Utc>) -> f64 {
        days_between(self.last_executed_at.unwrap_or(self.origin.learned_at), now)
    }

    /// Apply the outcome of one execution attempt.
    ///
    /// Counts the use, moves confidence by the fixed step within its bounds,
    /// and appends to the bounded history (oldest entries evicted first).
    pub(crate) fn record_execution(&mut self, record: ExecutionRecord) {
        self.usage_count += 1;

        if record.success {
            self.success_count += 1;
            self.confidence = (self.confidence + SUCCESS_STEP).min(MAX_CONFIDENCE);
        } else {
            self.confidence = (self.confidence - FAILURE_STEP).max(MIN_CONFIDENCE);
        }

        self.last_executed_at = Some(record.at);
        self.execution_history.push_back(record);
        while self.execution_history.len() > HISTORY_LIMIT {
            self.execution_history.pop_front();
        }
    }

    /// Bring externally supplied state back inside the entity invariants
    pub(crate) fn normalize(&mut self) {
        if !self.confidence.is_finite() {
            self.confidence = INITIAL_CONFIDENCE;
        }
        self.confidence = self.confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
        self.success_count = self.success_count.min(self.usage_count);
        while self.execution_history.len() > HISTORY_LIMIT {
            self.execution_history.pop_front();
        }
        self.version = self.version.max(1);
    }

    pub fn is_shared_copy(&self) -> bool {
        self.share_expires_at.is_some()
    }
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = (to - from).num_milliseconds().max(0);
    millis as f64 / 86_400_000.0
}
