use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::types::{ExpiringPolicy, NewReminder, Reminder, ReminderKey};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Read access to policies joined with their clients.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Lists policies whose expiry date lies in `[start, end]`, both ends inclusive.
    async fn expiring_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ExpiringPolicy>, StoreError>;
}

/// Append-only access to generated reminders.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// Appends a reminder and returns the stored row.
    ///
    /// Implementations keep `created_at` non-decreasing in insertion order.
    async fn insert_reminder(&self, reminder: NewReminder<'_>) -> Result<Reminder, StoreError>;

    /// Returns the creation time of the newest reminder stored for `key`.
    async fn latest_for(&self, key: ReminderKey<'_>) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Lists up to `limit` reminders, newest first.
    async fn list_recent(&self, limit: u32) -> Result<Vec<Reminder>, StoreError>;
}

/// Failures reported by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] BoxError),
    #[error("store rejected write: {0}")]
    WriteRejected(#[source] BoxError),
}

impl StoreError {
    pub fn unavailable(err: impl Into<BoxError>) -> Self {
        Self::Unavailable(err.into())
    }

    pub fn write_rejected(err: impl Into<BoxError>) -> Self {
        Self::WriteRejected(err.into())
    }
}
