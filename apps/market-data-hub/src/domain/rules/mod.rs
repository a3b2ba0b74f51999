//! Notification Rules
//!
//! User-defined rules evaluated against the latest market snapshot.
//!
//! # Evaluation
//!
//! Conditions are folded left to right with no operator precedence: the
//! first condition seeds the result and each later condition combines with
//! the running result through its own `logic`. The first condition's
//! `logic` is ignored. A rule without conditions never fires.
//!
//! ```text
//! [a > 5, b < 2 (OR), c == "x" (AND)]  =>  ((a > 5) OR (b < 2)) AND (c == "x")
//! ```

mod field_path;
mod operator;

pub use field_path::{FieldPath, Segment};
pub use operator::Operator;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Errors
// =============================================================================

/// Errors raised while loading or validating rules.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// Field path could not be parsed.
    #[error("invalid field path '{path}': {reason}")]
    InvalidFieldPath {
        /// Offending path.
        path: String,
        /// Parse failure.
        reason: String,
    },

    /// Rule failed validation.
    #[error("invalid rule '{id}': {reason}")]
    InvalidRule {
        /// Rule id.
        id: String,
        /// Validation failure.
        reason: String,
    },

    /// Rule does not exist.
    #[error("rule not found: {0}")]
    NotFound(String),

    /// Rule file could not be read.
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),

    /// Rule file is not valid JSON.
    #[error("failed to parse rules: {0}")]
    Parse(#[from] serde_json::Error),
}

// =============================================================================
// Rule Definition
// =============================================================================

/// How a condition combines with the running result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    /// Running result AND this condition.
    #[default]
    And,
    /// Running result OR this condition.
    Or,
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => f.write_str("AND"),
            Self::Or => f.write_str("OR"),
        }
    }
}

/// One condition of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Path into the snapshot.
    pub field: FieldPath,
    /// Comparison operator.
    pub operator: Operator,
    /// Value to compare against.
    pub value: Value,
    /// Connective with the running result.
    #[serde(default)]
    pub logic: Logic,
}

impl Condition {
    /// Build a condition with `AND` logic.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidFieldPath`] if `field` is malformed.
    pub fn new(field: &str, operator: Operator, value: Value) -> Result<Self, RuleError> {
        Ok(Self {
            field: FieldPath::parse(field)?,
            operator,
            value,
            logic: Logic::And,
        })
    }

    /// Set the connective.
    #[must_use]
    pub const fn with_logic(mut self, logic: Logic) -> Self {
        self.logic = logic;
        self
    }

    /// Evaluate against a snapshot. Unresolved fields are false.
    #[must_use]
    pub fn evaluate(&self, snapshot: &Value) -> bool {
        self.field
            .resolve(snapshot)
            .is_some_and(|field| self.operator.apply(field, &self.value))
    }
}

/// Delivery channel of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// In-app toast, published on `ui:notification`.
    Visual,
    /// Sound cue, published on `ui:sound`.
    Audio,
    /// Email dispatch.
    Email,
    /// SMS dispatch.
    Sms,
    /// HTTP webhook.
    Webhook,
    /// Push notification.
    Push,
}

impl ActionType {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Audio => "audio",
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Webhook => "webhook",
            Self::Push => "push",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An action executed when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Channel.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Disabled actions are skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Channel-specific configuration (recipient, URL, sound name...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl Action {
    /// An enabled action without configuration.
    #[must_use]
    pub const fn new(action_type: ActionType) -> Self {
        Self {
            action_type,
            enabled: true,
            config: None,
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Default.
    #[default]
    Medium,
    /// Needs attention.
    High,
    /// Needs immediate attention.
    Critical,
}

impl Severity {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const fn default_enabled() -> bool {
    true
}

/// A user-defined notification rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRule {
    /// Unique rule id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Ordered conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Actions executed when the rule fires.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Severity of raised alerts.
    #[serde(default)]
    pub severity: Severity,
    /// Disabled rules are never evaluated.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// When the rule last fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
}

impl NotificationRule {
    /// Create an enabled rule with no conditions or actions.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
            severity: Severity::default(),
            enabled: true,
            last_triggered: None,
        }
    }

    /// Append a condition.
    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Append an action.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Set the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Check structural validity.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::InvalidRule`] if the id or name is blank.
    pub fn validate(&self) -> Result<(), RuleError> {
        let invalid = |reason: &str| RuleError::InvalidRule {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id is empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        Ok(())
    }

    /// Fold the conditions over a snapshot.
    #[must_use]
    pub fn matches(&self, snapshot: &Value) -> bool {
        let mut conditions = self.conditions.iter();
        let Some(first) = conditions.next() else {
            return false;
        };

        conditions.fold(first.evaluate(snapshot), |result, condition| {
            match condition.logic {
                Logic::And => result && condition.evaluate(snapshot),
                Logic::Or => result || condition.evaluate(snapshot),
            }
        })
    }

    /// Whether the rule may fire at `now` given the minimum re-fire interval.
    #[must_use]
    pub fn can_fire(&self, now: DateTime<Utc>, refire_interval: Duration) -> bool {
        let Some(last) = self.last_triggered else {
            return true;
        };
        let elapsed = now.signed_duration_since(last);
        elapsed
            .to_std()
            .is_ok_and(|elapsed| elapsed >= refire_interval)
    }

    /// Human-readable alert message including the observed values.
    #[must_use]
    pub fn render_message(&self, snapshot: &Value) -> String {
        let mut message = format!("{}:", self.name);
        for (index, condition) in self.conditions.iter().enumerate() {
            if index > 0 {
                message.push_str(&format!(" {}", condition.logic));
            }
            let actual = condition
                .field
                .resolve(snapshot)
                .map_or_else(|| "missing".to_string(), Value::to_string);
            message.push_str(&format!(
                " {} {} {} (actual {actual})",
                condition.field, condition.operator, condition.value
            ));
        }
        message
    }
}

// =============================================================================
// Alert
// =============================================================================

/// An alert raised by a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Alert id (UUID v4).
    pub id: String,
    /// Rule that fired.
    pub rule_id: String,
    /// Rule name at firing time.
    pub rule_name: String,
    /// Rendered message.
    pub message: String,
    /// Severity copied from the rule.
    pub severity: Severity,
    /// Firing time.
    pub timestamp: DateTime<Utc>,
    /// Whether a user acknowledged the alert.
    #[serde(default)]
    pub acknowledged: bool,
    /// Acknowledgement time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Raise an alert for a rule that matched `snapshot`.
    #[must_use]
    pub fn raise(rule: &NotificationRule, snapshot: &Value, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            message: rule.render_message(snapshot),
            severity: rule.severity,
            timestamp: now,
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    /// Mark acknowledged. Returns false if already acknowledged.
    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> bool {
        if self.acknowledged {
            return false;
        }
        self.acknowledged = true;
        self.acknowledged_at = Some(at);
        true
    }
}

// =============================================================================
// Tests
// =============================================================================
