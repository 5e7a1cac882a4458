use std::sync::Arc;

use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::store::{PolicyStore, StoreError};
use crate::types::ExpiryCandidate;

/// Closed date interval `[start, end]` of expiries considered "nearing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ExpiryWindow {
    /// Builds the window starting at `today` and spanning `lookahead_days` more days.
    ///
    /// `lookahead_days == 0` yields a window containing only `today`. The end
    /// saturates at [`NaiveDate::MAX`].
    pub fn starting(today: NaiveDate, lookahead_days: u32) -> Self {
        let end = today
            .checked_add_days(Days::new(u64::from(lookahead_days)))
            .unwrap_or(NaiveDate::MAX);
        Self { start: today, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Policy skipped because its client could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub policy_id: i64,
    pub policy_number: String,
    pub client_id: i64,
}

/// Result of a successful scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub candidates: Vec<ExpiryCandidate>,
    pub dangling: Vec<DanglingReference>,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("policy store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
}

/// Finds policies nearing expiration and projects them into candidates.
#[derive(Clone)]
pub struct ExpiryScanner {
    policies: Arc<dyn PolicyStore>,
    lookahead_days: u32,
}

impl ExpiryScanner {
    pub fn new(policies: Arc<dyn PolicyStore>, lookahead_days: u32) -> Self {
        Self {
            policies,
            lookahead_days,
        }
    }

    pub fn lookahead_days(&self) -> u32 {
        self.lookahead_days
    }

    pub fn window(&self, today: NaiveDate) -> ExpiryWindow {
        ExpiryWindow::starting(today, self.lookahead_days)
    }

    /// Queries the store once and returns candidates sorted by expiry date, then policy number.
    ///
    /// A query failure fails the whole scan; rows whose client is missing are
    /// reported in [`ScanOutcome::dangling`] and left out of the candidates.
    pub async fn scan(&self, today: NaiveDate) -> Result<ScanOutcome, ScanError> {
        let window = self.window(today);
        let rows = self
            .policies
            .expiring_between(window.start, window.end)
            .await
            .map_err(ScanError::StoreUnavailable)?;

        let mut outcome = ScanOutcome::default();
        for row in rows {
            // Stores may filter loosely.
            if !window.contains(row.expiry_date) {
                continue;
            }
            match row.client_name {
                Some(client_name) => outcome.candidates.push(ExpiryCandidate {
                    policy_number: row.policy_number,
                    client_name,
                    expiry_date: row.expiry_date,
                }),
                None => outcome.dangling.push(DanglingReference {
                    policy_id: row.policy_id,
                    policy_number: row.policy_number,
                    client_id: row.client_id,
                }),
            }
        }

        outcome.candidates.sort_by(|a, b| {
            a.expiry_date
                .cmp(&b.expiry_date)
                .then_with(|| a.policy_number.cmp(&b.policy_number))
        });

        Ok(outcome)
    }
}
