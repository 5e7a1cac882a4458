use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::store::{PolicyStore, ReminderStore, StoreError};
use crate::types::{Client, ExpiringPolicy, NewReminder, Policy, Reminder, ReminderKey};

/// In-process implementation of both store traits.
///
/// Failures can be injected per operation so callers can exercise their
/// isolation paths without a real database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    clients: BTreeMap<i64, Client>,
    policies: BTreeMap<i64, Policy>,
    reminders: Vec<Reminder>,
    fail_queries: bool,
    fail_inserts_for: HashSet<String>,
    fail_lookups_for: HashSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self, id: i64, name: &str) {
        let mut inner = self.lock();
        inner.clients.insert(
            id,
            Client {
                id,
                name: name.to_string(),
                email: format!("client-{id}@example.com"),
                phone: None,
            },
        );
    }

    pub fn remove_client(&self, id: i64) {
        self.lock().clients.remove(&id);
    }

    pub fn add_policy(&self, id: i64, client_id: i64, policy_number: &str, expiry_date: NaiveDate) {
        let mut inner = self.lock();
        inner.policies.insert(
            id,
            Policy {
                id,
                client_id,
                policy_number: policy_number.to_string(),
                insurer: "Acme Mutual".to_string(),
                policy_type: None,
                expiry_date,
            },
        );
    }

    /// Makes every subsequent policy query fail until reset.
    pub fn fail_queries(&self, fail: bool) {
        self.lock().fail_queries = fail;
    }

    /// Makes inserts for `policy_number` fail.
    pub fn fail_inserts_for(&self, policy_number: &str) {
        self.lock()
            .fail_inserts_for
            .insert(policy_number.to_string());
    }

    /// Makes dedup lookups for `policy_number` fail.
    pub fn fail_lookups_for(&self, policy_number: &str) {
        self.lock()
            .fail_lookups_for
            .insert(policy_number.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.lock();
        inner.fail_queries = false;
        inner.fail_inserts_for.clear();
        inner.fail_lookups_for.clear();
    }

    /// Snapshot of stored reminders in insertion order.
    pub fn reminders(&self) -> Vec<Reminder> {
        self.lock().reminders.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn expiring_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpiringPolicy>, StoreError> {
        let inner = self.lock();
        if inner.fail_queries {
            return Err(StoreError::unavailable("memory store offline"));
        }

        Ok(inner
            .policies
            .values()
            .filter(|policy| policy.expiry_date >= start && policy.expiry_date <= end)
            .map(|policy| ExpiringPolicy {
                policy_id: policy.id,
                policy_number: policy.policy_number.clone(),
                client_id: policy.client_id,
                client_name: inner
                    .clients
                    .get(&policy.client_id)
                    .map(|client| client.name.clone()),
                expiry_date: policy.expiry_date,
            })
            .collect())
    }
}

#[async_trait]
impl ReminderStore for MemoryStore {
    async fn insert_reminder(&self, reminder: NewReminder<'_>) -> Result<Reminder, StoreError> {
        let mut inner = self.lock();
        if inner.fail_inserts_for.contains(reminder.policy_number) {
            return Err(StoreError::write_rejected(format!(
                "insert rejected for policy {}",
                reminder.policy_number
            )));
        }

        let created_at = match inner.reminders.last() {
            Some(last) if last.created_at > reminder.created_at => last.created_at,
            _ => reminder.created_at,
        };
        let stored = Reminder {
            id: inner.reminders.len() as i64 + 1,
            message: reminder.message.to_string(),
            created_at,
            policy_number: Some(reminder.policy_number.to_string()),
            expiry_date: Some(reminder.expiry_date),
        };
        inner.reminders.push(stored.clone());
        Ok(stored)
    }

    async fn latest_for(&self, key: ReminderKey<'_>) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.lock();
        if inner.fail_lookups_for.contains(key.policy_number) {
            return Err(StoreError::unavailable(format!(
                "lookup failed for policy {}",
                key.policy_number
            )));
        }

        Ok(inner
            .reminders
            .iter()
            .filter(|reminder| {
                reminder.policy_number.as_deref() == Some(key.policy_number)
                    && reminder.expiry_date == Some(key.expiry_date)
            })
            .map(|reminder| reminder.created_at)
            .max())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<Reminder>, StoreError> {
        let inner = self.lock();
        let mut reminders = inner.reminders.clone();
        reminders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        reminders.truncate(limit as usize);
        Ok(reminders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn insert_clamps_created_at_to_latest() {
        let store = MemoryStore::new();
        let later = ts("2024-01-02T00:00:00Z");
        let first = store
            .insert_reminder(NewReminder {
                message: "first",
                policy_number: "P1",
                expiry_date: date("2024-01-10"),
                created_at: later,
            })
            .await
            .unwrap();
        let second = store
            .insert_reminder(NewReminder {
                message: "second",
                policy_number: "P2",
                expiry_date: date("2024-01-10"),
                created_at: later - Duration::hours(1),
            })
            .await
            .unwrap();

        assert_eq!(first.created_at, later);
        assert_eq!(second.created_at, later);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn list_recent_returns_newest_first() {
        let store = MemoryStore::new();
        let base = ts("2024-01-01T00:00:00Z");
        for (idx, number) in ["P1", "P2", "P3"].into_iter().enumerate() {
            store
                .insert_reminder(NewReminder {
                    message: number,
                    policy_number: number,
                    expiry_date: date("2024-01-10"),
                    created_at: base + Duration::minutes(idx as i64),
                })
                .await
                .unwrap();
        }

        let recent = store.list_recent(2).await.unwrap();
        let messages: Vec<_> = recent.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["P3", "P2"]);
    }

    #[tokio::test]
    async fn expiring_between_reports_missing_clients() {
        let store = MemoryStore::new();
        store.add_client(1, "Alice");
        store.add_policy(10, 1, "P1", date("2024-01-05"));
        store.add_policy(11, 2, "P2", date("2024-01-06"));

        let rows = store
            .expiring_between(date("2024-01-01"), date("2024-01-31"))
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].client_name.as_deref(), Some("Alice"));
        assert_eq!(rows[1].client_name, None);
    }
}
