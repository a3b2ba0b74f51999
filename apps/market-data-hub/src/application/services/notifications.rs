//! Notification Rule Engine
//!
//! Evaluates user-defined rules against the latest market snapshot on a
//! fixed cadence and raises alerts.
//!
//! # Firing
//!
//! An enabled rule fires when its conditions match and it has not fired
//! within the re-fire interval. Firing:
//!
//! 1. creates an [`Alert`] and appends it to the history
//! 2. stamps the rule's `last_triggered`
//! 3. publishes `notification:triggered`
//! 4. runs each enabled action; a failed action is logged and skipped
//!
//! The history is kept in memory until cleared.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::application::ports::SnapshotSource;
use crate::domain::rules::{Action, Alert, NotificationRule, RuleError};
use crate::infrastructure::actions::ActionRegistry;
use crate::infrastructure::bus::{EventBus, topics};
use crate::infrastructure::config::RuleSettings;
use crate::infrastructure::metrics;

const SOURCE: &str = "notifications";

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleEngineConfig {
    /// Evaluation cadence.
    pub tick_interval: Duration,
    /// Minimum time between two alerts of one rule.
    pub refire_interval: Duration,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            refire_interval: Duration::from_secs(5),
        }
    }
}

impl RuleEngineConfig {
    /// Create configuration from `RuleSettings`.
    #[must_use]
    pub const fn from_rule_settings(settings: &RuleSettings) -> Self {
        Self {
            tick_interval: settings.tick_interval,
            refire_interval: settings.refire_interval,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    rules: Vec<NotificationRule>,
    history: Vec<Alert>,
}

/// Rule store, evaluator and alert history.
#[derive(Debug)]
pub struct NotificationRuleEngine {
    state: Mutex<EngineState>,
    bus: EventBus,
    actions: ActionRegistry,
    config: RuleEngineConfig,
}

impl NotificationRuleEngine {
    /// Create an engine without rules.
    #[must_use]
    pub fn new(config: RuleEngineConfig, bus: EventBus, actions: ActionRegistry) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            bus,
            actions,
            config,
        }
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> RuleEngineConfig {
        self.config
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate every enabled rule against the sources' snapshot each tick
    /// until cancelled.
    pub async fn run(&self, source: Arc<dyn SnapshotSource>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            tick_ms = self.config.tick_interval.as_millis(),
            rules = self.state.lock().rules.len(),
            "Notification engine started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = source.snapshot().await;
                    self.evaluate(&snapshot, Utc::now());
                }
            }
        }
        tracing::info!("Notification engine stopped");
    }

    /// Evaluate every enabled rule against `snapshot` at `now`.
    ///
    /// Returns the alerts raised, in rule order.
    pub fn evaluate(&self, snapshot: &Value, now: DateTime<Utc>) -> Vec<Alert> {
        let fired: Vec<(Alert, Vec<Action>)> = {
            let mut state = self.state.lock();
            let EngineState { rules, history } = &mut *state;

            let mut fired = Vec::new();
            for rule in rules.iter_mut().filter(|r| r.enabled) {
                if !rule.can_fire(now, self.config.refire_interval) || !rule.matches(snapshot) {
                    continue;
                }

                let alert = Alert::raise(rule, snapshot, now);
                rule.last_triggered = Some(now);
                history.push(alert.clone());
                fired.push((alert, rule.actions.clone()));
            }
            fired
        };

        let mut alerts = Vec::with_capacity(fired.len());
        for (alert, actions) in fired {
            self.announce(&alert, &actions);
            alerts.push(alert);
        }
        alerts
    }

    fn announce(&self, alert: &Alert, actions: &[Action]) {
        tracing::info!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            severity = %alert.severity,
            message = %alert.message,
            "Notification rule triggered"
        );
        metrics::record_alert_triggered(alert.severity);

        match serde_json::to_value(alert) {
            Ok(payload) => {
                self.bus
                    .publish(topics::NOTIFICATION_TRIGGERED, payload, Some(SOURCE));
            }
            Err(e) => tracing::error!(alert_id = %alert.id, error = %e, "Failed to encode alert"),
        }

        for action in actions.iter().filter(|a| a.enabled) {
            if let Err(e) = self.actions.execute(alert, action) {
                tracing::warn!(
                    alert_id = %alert.id,
                    channel = %action.action_type,
                    error = %e,
                    "Notification action failed"
                );
                metrics::record_action_failure(action.action_type);
            }
        }
    }

    // =========================================================================
    // Rules
    // =========================================================================

    /// Insert a rule, replacing any rule with the same id in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule is invalid.
    pub fn add_rule(&self, rule: NotificationRule) -> Result<(), RuleError> {
        rule.validate()?;
        let mut state = self.state.lock();
        match state.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => state.rules.push(rule),
        }
        Ok(())
    }

    /// Replace an existing rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] if no rule has the id, or a
    /// validation error.
    pub fn update_rule(&self, rule: NotificationRule) -> Result<(), RuleError> {
        rule.validate()?;
        let mut state = self.state.lock();
        let existing = state
            .rules
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or_else(|| RuleError::NotFound(rule.id.clone()))?;
        *existing = rule;
        Ok(())
    }

    /// Remove a rule. Returns whether it existed.
    pub fn remove_rule(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.rules.len();
        state.rules.retain(|r| r.id != id);
        state.rules.len() != before
    }

    /// A rule by id.
    #[must_use]
    pub fn rule(&self, id: &str) -> Option<NotificationRule> {
        self.state.lock().rules.iter().find(|r| r.id == id).cloned()
    }

    /// Every rule, in insertion order.
    #[must_use]
    pub fn rules(&self) -> Vec<NotificationRule> {
        self.state.lock().rules.clone()
    }

    /// Enable or disable a rule.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::NotFound`] if no rule has the id.
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut state = self.state.lock();
        let rule = state
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    /// Replace every rule. Nothing changes if any rule is invalid.
    ///
    /// # Errors
    ///
    /// Returns an error on an invalid rule or a duplicate id.
    pub fn load_rules(&self, rules: Vec<NotificationRule>) -> Result<usize, RuleError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.as_str()) {
                return Err(RuleError::InvalidRule {
                    id: rule.id.clone(),
                    reason: "duplicate id".to_string(),
                });
            }
        }

        let count = rules.len();
        self.state.lock().rules = rules;
        Ok(count)
    }

    /// Replace every rule with the JSON array in `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds an
    /// invalid rule.
    pub async fn load_rules_file(&self, path: &Path) -> Result<usize, RuleError> {
        let text = tokio::fs::read_to_string(path).await?;
        let rules: Vec<NotificationRule> = serde_json::from_str(&text)?;
        let count = self.load_rules(rules)?;
        tracing::info!(path = %path.display(), count, "Loaded notification rules");
        Ok(count)
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Alerts raised so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Alert> {
        self.state.lock().history.clone()
    }

    /// Acknowledge one alert. Returns false if unknown or already acknowledged.
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let now = Utc::now();
        self.state
            .lock()
            .history
            .iter_mut()
            .find(|a| a.id == alert_id)
            .is_some_and(|alert| alert.acknowledge(now))
    }

    /// Acknowledge every alert. Returns how many changed.
    pub fn acknowledge_all(&self) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .history
            .iter_mut()
            .map(|alert| alert.acknowledge(now))
            .filter(|changed| *changed)
            .count()
    }

    /// Drop the alert history.
    pub fn clear_history(&self) {
        self.state.lock().history.clear();
    }

    /// Alerts not yet acknowledged.
    #[must_use]
    pub fn unacknowledged_count(&self) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|a| !a.acknowledged)
            .count()
    }
}
