//! Core notification types
//!
//! These types match the JSON format used by both the REST notification endpoints
//! and the push endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Notification priority, ordered `Info < Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Convert to wire string
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Info => "info",
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Priority::Critical)
    }

    /// Parse a wire string, case-insensitively
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "info" => Some(Priority::Info),
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    TradeSignal,
    PriceAlert,
    RiskAlert,
    PositionUpdate,
    OrderUpdate,
    MarketNews,
    AiInsight,
    System,
}

/// Which backend component produced the notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationSource {
    Strategy,
    RiskEngine,
    MarketData,
    Broker,
    Ai,
    System,
}

/// Notification as delivered by the REST snapshot or the push stream
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Notification {
    /// Opaque unique identity
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub source: NotificationSource,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    /// Model confidence in the signal (0-1), when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promise: Option<f64>,
    /// Free-form extra fields (symbol, price, strategy name, ...)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Allowed response identifiers, in display order
    #[serde(default)]
    pub actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub responded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Check if the notification has passed its expiry time
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Check if `action` is one of the allowed responses
    pub fn allows_action(&self, action: &str) -> bool {
        self.actions.iter().any(|allowed| allowed == action)
    }

    /// Text spoken for this notification by the voice queue
    pub fn spoken_text(&self) -> String {
        match (self.title.trim(), self.message.trim()) {
            ("", message) => message.to_string(),
            (title, "") => title.to_string(),
            (title, message) => format!("{title}. {message}"),
        }
    }
}

/// Body of a notification creation request
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NewNotification {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub source: NotificationSource,
    pub priority: Priority,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub promise: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Filter for the notification listing endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationQuery {
    pub limit: Option<u32>,
    pub unread_only: bool,
}

impl NotificationQuery {
    /// Query string pairs, omitting defaults
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(("limit", limit.to_string()));
        }
        if self.unread_only {
            pairs.push(("unread_only", "true".to_string()));
        }
        pairs
    }
}

/// Summary returned by the statistics endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotificationStats {
    pub total: u64,
    pub unread: u64,
    #[serde(default)]
    pub by_priority: HashMap<Priority, u64>,
    #[serde(default)]
    pub by_type: HashMap<NotificationType, u64>,
}

/// Push frame shapes carrying a notification
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PushEnvelope {
    Notification { data: Notification },
}

/// Extract a notification from a structured push payload.
///
/// Accepts `{"type": "notification", "data": {...}}` envelopes and bare notification objects.
pub fn parse_push_notification(value: &serde_json::Value) -> Option<Notification> {
    if let Ok(PushEnvelope::Notification { data }) =
        serde_json::from_value::<PushEnvelope>(value.clone())
    {
        return Some(data);
    }
    serde_json::from_value::<Notification>(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> serde_json::Value {
        json!({
            "id": "n1",
            "type": "risk_alert",
            "source": "risk_engine",
            "priority": "critical",
            "title": "Margin call",
            "message": "Account margin below 20%",
            "urgency": 0.9,
            "metadata": {"account": "main"},
            "actions": ["acknowledge", "reduce_exposure"],
            "created_at": "2026-03-01T12:00:00Z"
        })
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Low > Priority::Info);
        assert!(Priority::Critical.is_critical());
        assert!(!Priority::High.is_critical());
    }

    #[test]
    fn test_priority_parse_display() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Priority::parse(" info "), Some(Priority::Info));
        assert_eq!(Priority::parse("urgent"), None);
        assert_eq!(Priority::Critical.to_string(), "critical");
    }

    #[test]
    fn test_notification_deserialize_defaults() {
        let notification: Notification = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(notification.kind, NotificationType::RiskAlert);
        assert_eq!(notification.source, NotificationSource::RiskEngine);
        assert_eq!(notification.priority, Priority::Critical);
        assert!(!notification.read);
        assert!(!notification.responded);
        assert!(notification.response_action.is_none());
        assert!(notification.allows_action("acknowledge"));
        assert!(!notification.allows_action("ignore"));
        assert_eq!(
            notification.spoken_text(),
            "Margin call. Account margin below 20%"
        );
    }

    #[test]
    fn test_parse_push_notification_shapes() {
        let bare = sample_json();
        let envelope = json!({"type": "notification", "data": sample_json()});
        let other = json!({"type": "heartbeat", "ts": 1});

        assert_eq!(parse_push_notification(&bare).map(|n| n.id), Some("n1".to_string()));
        assert_eq!(
            parse_push_notification(&envelope).map(|n| n.id),
            Some("n1".to_string())
        );
        assert!(parse_push_notification(&other).is_none());
    }

    #[test]
    fn test_query_pairs() {
        let query = NotificationQuery {
            limit: Some(50),
            unread_only: true,
        };
        assert_eq!(
            query.to_pairs(),
            vec![("limit", "50".to_string()), ("unread_only", "true".to_string())]
        );
        assert!(NotificationQuery::default().to_pairs().is_empty());
    }

    #[test]
    fn test_is_expired() {
        let mut notification: Notification = serde_json::from_value(sample_json()).unwrap();
        let now = notification.created_at;
        assert!(!notification.is_expired(now));
        notification.expires_at = Some(now);
        assert!(notification.is_expired(now));
    }
}
