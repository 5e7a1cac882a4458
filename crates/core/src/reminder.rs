use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::store::{ReminderStore, StoreError};
use crate::types::{ExpiryCandidate, NewReminder, Reminder};

/// Renders the dashboard text for a candidate.
pub fn format_message(candidate: &ExpiryCandidate) -> String {
    format!(
        "Reminder: Policy #{} for client {} is nearing expiration.",
        candidate.policy_number, candidate.client_name
    )
}

/// Controls whether a candidate already reminded about is emitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Emit on every tick while the policy stays inside the window.
    EveryTick,
    /// Suppress a candidate when a reminder for the same policy number and
    /// expiry date was created within the horizon.
    WithinHorizon(Duration),
}

impl DedupPolicy {
    pub fn within_days(days: u32) -> Self {
        Self::WithinHorizon(Duration::days(i64::from(days)))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EveryTick => "every_tick",
            Self::WithinHorizon(_) => "within_horizon",
        }
    }
}

/// Candidate dropped because its lookup or append failed.
#[derive(Debug)]
pub struct EmitFailure {
    pub policy_number: String,
    pub error: StoreError,
}

/// Per-tick emission summary.
#[derive(Debug, Default)]
pub struct EmitReport {
    pub inserted: Vec<Reminder>,
    pub suppressed: Vec<String>,
    pub failed: Vec<EmitFailure>,
}

/// Persists candidates as reminders, one append per accepted candidate.
#[derive(Clone)]
pub struct ReminderEmitter {
    reminders: Arc<dyn ReminderStore>,
    dedup: DedupPolicy,
}

impl ReminderEmitter {
    pub fn new(reminders: Arc<dyn ReminderStore>, dedup: DedupPolicy) -> Self {
        Self { reminders, dedup }
    }

    pub fn dedup(&self) -> DedupPolicy {
        self.dedup
    }

    /// Emits every candidate independently; a failure only drops that candidate.
    pub async fn emit_all(&self, candidates: &[ExpiryCandidate], now: DateTime<Utc>) -> EmitReport {
        let mut report = EmitReport::default();
        for candidate in candidates {
            match self.emit(candidate, now).await {
                Ok(Some(reminder)) => report.inserted.push(reminder),
                Ok(None) => report.suppressed.push(candidate.policy_number.clone()),
                Err(error) => report.failed.push(EmitFailure {
                    policy_number: candidate.policy_number.clone(),
                    error,
                }),
            }
        }
        report
    }

    /// Emits one candidate, returning `None` when the dedup policy suppresses it.
    pub async fn emit(
        &self,
        candidate: &ExpiryCandidate,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, StoreError> {
        if let DedupPolicy::WithinHorizon(horizon) = self.dedup {
            let since = now
                .checked_sub_signed(horizon)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let latest = self.reminders.latest_for(candidate.dedup_key()).await?;
            if latest.is_some_and(|created_at| created_at >= since) {
                return Ok(None);
            }
        }

        let message = format_message(candidate);
        let reminder = self
            .reminders
            .insert_reminder(NewReminder {
                message: &message,
                policy_number: &candidate.policy_number,
                expiry_date: candidate.expiry_date,
                created_at: now,
            })
            .await?;

        Ok(Some(reminder))
    }
}
