use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Insurance policy as stored by the CRUD surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Policy {
    pub id: i64,
    pub client_id: i64,
    pub policy_number: String,
    pub insurer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,
    pub expiry_date: NaiveDate,
}

/// Client owning one or more policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Row returned by an expiry-window query, joined to the owning client.
///
/// `client_name` is `None` when the policy points at a client that no longer
/// exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiringPolicy {
    pub policy_id: i64,
    pub policy_number: String,
    pub client_id: i64,
    pub client_name: Option<String>,
    pub expiry_date: NaiveDate,
}

/// Policy eligible for a reminder during the current tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryCandidate {
    pub policy_number: String,
    pub client_name: String,
    pub expiry_date: NaiveDate,
}

impl ExpiryCandidate {
    /// Key used to recognise reminders already emitted for this policy expiry.
    pub fn dedup_key(&self) -> ReminderKey<'_> {
        ReminderKey {
            policy_number: &self.policy_number,
            expiry_date: self.expiry_date,
        }
    }
}

/// Identifies the policy expiry a reminder was generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReminderKey<'a> {
    pub policy_number: &'a str,
    pub expiry_date: NaiveDate,
}

/// Persisted, fully rendered reminder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reminder {
    pub id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<NaiveDate>,
}

/// Reminder about to be appended to a [`ReminderStore`](crate::store::ReminderStore).
#[derive(Debug, Clone)]
pub struct NewReminder<'a> {
    pub message: &'a str,
    pub policy_number: &'a str,
    pub expiry_date: NaiveDate,
    pub created_at: DateTime<Utc>,
}
