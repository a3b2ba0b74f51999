//! Notification Action Channels
//!
//! [`ActionChannel`] adapters executed when a rule fires:
//!
//! - **visual**: publishes the alert on `ui:notification`
//! - **audio**: publishes a sound cue on `ui:sound`
//! - **email**, **sms**, **webhook**, **push**: hand-off points for external
//!   dispatchers. They validate their configuration and log the dispatch.
//!
//! [`ActionRegistry`] maps each [`ActionType`] to its channel.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::application::ports::{ActionChannel, ActionError};
use crate::domain::rules::{Action, ActionType, Alert, Severity};
use crate::infrastructure::bus::{EventBus, topics};

const SOURCE: &str = "notifications";

fn config_str<'a>(config: Option<&'a Value>, key: &str) -> Option<&'a str> {
    config
        .and_then(|c| c.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn require_str<'a>(
    channel: ActionType,
    config: Option<&'a Value>,
    key: &str,
) -> Result<&'a str, ActionError> {
    config_str(config, key).ok_or_else(|| ActionError::InvalidConfig {
        channel,
        reason: format!("missing `{key}`"),
    })
}

// =============================================================================
// In-App Channels
// =============================================================================

/// Publishes alerts as UI notifications.
#[derive(Debug, Clone)]
pub struct VisualChannel {
    bus: EventBus,
}

impl VisualChannel {
    /// Create a channel publishing on `bus`.
    #[must_use]
    pub const fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ActionChannel for VisualChannel {
    fn action_type(&self) -> ActionType {
        ActionType::Visual
    }

    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError> {
        let payload = json!({
            "alertId": alert.id,
            "ruleId": alert.rule_id,
            "title": alert.rule_name,
            "message": alert.message,
            "severity": alert.severity,
            "timestamp": alert.timestamp,
            "config": config,
        });
        self.bus.publish(topics::UI_NOTIFICATION, payload, Some(SOURCE));
        Ok(())
    }
}

/// Publishes sound cues.
#[derive(Debug, Clone)]
pub struct AudioChannel {
    bus: EventBus,
}

impl AudioChannel {
    /// Create a channel publishing on `bus`.
    #[must_use]
    pub const fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Sound played when the action does not name one.
    #[must_use]
    pub const fn default_sound(severity: Severity) -> &'static str {
        match severity {
            Severity::Low => "chime",
            Severity::Medium => "notify",
            Severity::High => "alert",
            Severity::Critical => "alarm",
        }
    }
}

impl ActionChannel for AudioChannel {
    fn action_type(&self) -> ActionType {
        ActionType::Audio
    }

    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError> {
        let sound = config_str(config, "sound").unwrap_or(Self::default_sound(alert.severity));
        let volume = config
            .and_then(|c| c.get("volume"))
            .and_then(Value::as_f64)
            .unwrap_or(1.0);
        if !(0.0..=1.0).contains(&volume) {
            return Err(ActionError::InvalidConfig {
                channel: ActionType::Audio,
                reason: format!("volume {volume} outside 0..=1"),
            });
        }

        let payload = json!({
            "alertId": alert.id,
            "sound": sound,
            "volume": volume,
            "severity": alert.severity,
        });
        self.bus.publish(topics::UI_SOUND, payload, Some(SOURCE));
        Ok(())
    }
}

// =============================================================================
// External Dispatch Channels
// =============================================================================

/// Email hand-off. Requires `to`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailChannel;

impl ActionChannel for EmailChannel {
    fn action_type(&self) -> ActionType {
        ActionType::Email
    }

    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError> {
        let to = require_str(ActionType::Email, config, "to")?;
        if !to.contains('@') {
            return Err(ActionError::InvalidConfig {
                channel: ActionType::Email,
                reason: format!("`{to}` is not an email address"),
            });
        }

        tracing::info!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            to = %to,
            subject = %alert.rule_name,
            "Dispatching email alert"
        );
        Ok(())
    }
}

/// SMS hand-off. Requires `to` as an E.164-style number.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmsChannel;

impl ActionChannel for SmsChannel {
    fn action_type(&self) -> ActionType {
        ActionType::Sms
    }

    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError> {
        let to = require_str(ActionType::Sms, config, "to")?;
        let digits = to.strip_prefix('+').unwrap_or(to);
        if digits.len() < 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ActionError::InvalidConfig {
                channel: ActionType::Sms,
                reason: format!("`{to}` is not a phone number"),
            });
        }

        tracing::info!(alert_id = %alert.id, rule_id = %alert.rule_id, to = %to, "Dispatching SMS alert");
        Ok(())
    }
}

/// Webhook hand-off. Requires an http(s) `url`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookChannel;

impl ActionChannel for WebhookChannel {
    fn action_type(&self) -> ActionType {
        ActionType::Webhook
    }

    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError> {
        let url = require_str(ActionType::Webhook, config, "url")?;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(ActionError::InvalidConfig {
                channel: ActionType::Webhook,
                reason: format!("`{url}` is not an http(s) URL"),
            });
        }

        let body = serde_json::to_string(alert).map_err(|e| ActionError::DeliveryFailed {
            channel: ActionType::Webhook,
            reason: e.to_string(),
        })?;
        tracing::info!(
            alert_id = %alert.id,
            url = %url,
            body_len = body.len(),
            "Dispatching webhook alert"
        );
        Ok(())
    }
}

/// Push notification hand-off.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushChannel;

impl ActionChannel for PushChannel {
    fn action_type(&self) -> ActionType {
        ActionType::Push
    }

    fn deliver(&self, alert: &Alert, config: Option<&Value>) -> Result<(), ActionError> {
        let topic = config_str(config, "topic").unwrap_or("alerts");
        tracing::info!(
            alert_id = %alert.id,
            topic = %topic,
            severity = %alert.severity,
            "Dispatching push alert"
        );
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Channel lookup by action type.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    channels: HashMap<ActionType, Arc<dyn ActionChannel>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.channels.keys().map(|t| t.as_str()).collect();
        types.sort_unstable();
        f.debug_struct("ActionRegistry").field("channels", &types).finish()
    }
}

impl ActionRegistry {
    /// Registry without channels.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in channel; in-app channels publish on `bus`.
    #[must_use]
    pub fn with_defaults(bus: &EventBus) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(VisualChannel::new(bus.clone())));
        registry.register(Arc::new(AudioChannel::new(bus.clone())));
        registry.register(Arc::new(EmailChannel));
        registry.register(Arc::new(SmsChannel));
        registry.register(Arc::new(WebhookChannel));
        registry.register(Arc::new(PushChannel));
        registry
    }

    /// Register or replace the channel for its type.
    pub fn register(&mut self, channel: Arc<dyn ActionChannel>) {
        self.channels.insert(channel.action_type(), channel);
    }

    /// Run one action for an alert.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Unsupported`] when no channel serves the
    /// type, or the channel's error.
    pub fn execute(&self, alert: &Alert, action: &Action) -> Result<(), ActionError> {
        let channel = self
            .channels
            .get(&action.action_type)
            .ok_or(ActionError::Unsupported(action.action_type))?;
        channel.deliver(alert, action.config.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use test_case::test_case;

    use super::*;
    use crate::infrastructure::bus::BusEvent;

    fn alert(severity: Severity) -> Alert {
        Alert {
            id: "a-1".to_string(),
            rule_id: "r-1".to_string(),
            rule_name: "EURUSD breakout".to_string(),
            message: "EURUSD breakout: prices.EURUSD.bid greater_than 1.1".to_string(),
            severity,
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
        }
    }

    fn capture(bus: &EventBus, pattern: &str) -> Arc<Mutex<Vec<BusEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = bus.subscribe(pattern, move |event| {
            sink.lock().unwrap().push(event.clone());
        });
        seen
    }

    #[test]
    fn visual_publishes_ui_notification() {
        let bus = EventBus::new();
        let seen = capture(&bus, "ui:*");

        VisualChannel::new(bus)
            .deliver(&alert(Severity::High), None)
            .unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, topics::UI_NOTIFICATION);
        assert_eq!(events[0].payload["severity"], "high");
        assert_eq!(events[0].payload["title"], "EURUSD breakout");
    }

    #[test]
    fn audio_uses_configured_or_default_sound() {
        let bus = EventBus::new();
        let seen = capture(&bus, topics::UI_SOUND);
        let channel = AudioChannel::new(bus);

        channel.deliver(&alert(Severity::Critical), None).unwrap();
        channel
            .deliver(&alert(Severity::Low), Some(&json!({ "sound": "bell", "volume": 0.5 })))
            .unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events[0].payload["sound"], "alarm");
        assert_eq!(events[1].payload["sound"], "bell");
        assert_eq!(events[1].payload["volume"], 0.5);
    }

    #[test]
    fn audio_rejects_bad_volume() {
        let channel = AudioChannel::new(EventBus::new());
        let result = channel.deliver(&alert(Severity::Low), Some(&json!({ "volume": 3.0 })));
        assert!(matches!(result, Err(ActionError::InvalidConfig { .. })));
    }

    #[test_case(&EmailChannel, None, false ; "email without recipient")]
    #[test_case(&EmailChannel, Some(json!({ "to": "ops" })), false ; "email bad address")]
    #[test_case(&EmailChannel, Some(json!({ "to": "ops@example.com" })), true ; "email ok")]
    #[test_case(&SmsChannel, Some(json!({ "to": "+447700900123" })), true ; "sms ok")]
    #[test_case(&SmsChannel, Some(json!({ "to": "call me" })), false ; "sms bad number")]
    #[test_case(&WebhookChannel, Some(json!({ "url": "https://hooks.example/x" })), true ; "webhook ok")]
    #[test_case(&WebhookChannel, Some(json!({ "url": "ftp://x" })), false ; "webhook bad scheme")]
    #[test_case(&PushChannel, None, true ; "push without config")]
    fn external_channels_validate(channel: &dyn ActionChannel, config: Option<Value>, ok: bool) {
        let result = channel.deliver(&alert(Severity::Medium), config.as_ref());
        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[test]
    fn registry_routes_by_type() {
        let bus = EventBus::new();
        let seen = capture(&bus, "*");
        let registry = ActionRegistry::with_defaults(&bus);

        registry
            .execute(&alert(Severity::Low), &Action::new(ActionType::Visual))
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn empty_registry_reports_unsupported() {
        let result = ActionRegistry::empty().execute(&alert(Severity::Low), &Action::new(ActionType::Sms));
        assert_eq!(result, Err(ActionError::Unsupported(ActionType::Sms)));
    }
}
