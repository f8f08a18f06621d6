//! Diesel model structs for subscribers, devices and the alerting audit trail.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::schema;

// String constants for enum-ish columns, standardized here so the service
// code and queries never disagree on spelling.
pub mod run_status {
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const PARTIAL: &str = "partial";
}

pub mod attempt_status {
    pub const PENDING: &str = "pending";
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";
    pub const DELIVERED: &str = "delivered";
    pub const DELIVERY_ERROR: &str = "delivery_error";
}

pub mod channel {
    pub const EMAIL: &str = "email";
    pub const PUSH: &str = "push";
}

pub mod trigger_type {
    pub const HTTP: &str = "http";
    pub const SCHEDULED: &str = "scheduled";
    pub const TEST: &str = "test";
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::subscribers)]
pub struct Subscriber {
    pub id: i64,
    pub email: String,
    pub location: String,
    pub subscribed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::subscribers)]
pub struct NewSubscriber {
    pub email: String,
    pub location: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::devices)]
pub struct Device {
    pub id: i64,
    pub push_token: String,
    pub platform: Option<String>,
    pub device_type: Option<String>,
    pub location: String,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::devices)]
pub struct NewDevice {
    pub push_token: String,
    pub platform: Option<String>,
    pub device_type: Option<String>,
    pub location: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::evaluation_runs)]
pub struct EvaluationRun {
    pub id: i64,
    pub trigger_type: String,
    pub locations_checked: serde_json::Value,
    pub temperatures_found: serde_json::Value,
    pub alerts_triggered: i32,
    pub threshold_used: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::evaluation_runs)]
pub struct NewEvaluationRun {
    pub trigger_type: String,
    pub locations_checked: serde_json::Value,
    pub temperatures_found: serde_json::Value,
    pub alerts_triggered: i32,
    pub threshold_used: f64,
    pub status: String,
    pub error_message: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Queryable, Identifiable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = schema::notification_attempts)]
pub struct NotificationAttempt {
    pub id: i64,
    pub recipient: String,
    pub channel: String,
    pub payload_summary: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub push_ticket_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::notification_attempts)]
pub struct NewNotificationAttempt {
    pub recipient: String,
    pub channel: String,
    pub payload_summary: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub push_ticket_id: Option<String>,
}

impl NewNotificationAttempt {
    pub fn email(recipient: &str, summary: &str) -> Self {
        NewNotificationAttempt {
            recipient: recipient.to_string(),
            channel: channel::EMAIL.to_string(),
            payload_summary: Some(summary.to_string()),
            status: attempt_status::PENDING.to_string(),
            error: None,
            push_ticket_id: None,
        }
    }

    pub fn push(recipient: &str, summary: &str) -> Self {
        NewNotificationAttempt {
            recipient: recipient.to_string(),
            channel: channel::PUSH.to_string(),
            payload_summary: Some(summary.to_string()),
            status: attempt_status::PENDING.to_string(),
            error: None,
            push_ticket_id: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.status = attempt_status::SUCCESS.to_string();
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = attempt_status::FAILURE.to_string();
        self.error = Some(error.into());
        self
    }

    pub fn with_ticket(mut self, ticket_id: impl Into<String>) -> Self {
        self.push_ticket_id = Some(ticket_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_attempt_builder_terminal_states() {
        let ok = NewNotificationAttempt::email("a@example.com", "alert").succeeded();
        assert_eq!(ok.status, attempt_status::SUCCESS);
        assert_eq!(ok.channel, channel::EMAIL);
        assert!(ok.error.is_none());

        let bad = NewNotificationAttempt::email("a@example.com", "alert").failed("smtp down");
        assert_eq!(bad.status, attempt_status::FAILURE);
        assert_eq!(bad.error.as_deref(), Some("smtp down"));
    }

    #[test]
    fn push_attempt_keeps_pending_until_receipt() {
        let row = NewNotificationAttempt::push("ExponentPushToken[x]", "alert").with_ticket("t-1");
        assert_eq!(row.status, attempt_status::PENDING);
        assert_eq!(row.push_ticket_id.as_deref(), Some("t-1"));
    }
}
