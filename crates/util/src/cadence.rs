use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// How often the expiry monitor fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    /// Fixed period between ticks, first tick immediately.
    Every(Duration),
    /// Once a day at the given wall-clock time in the monitor's timezone.
    DailyAt(NaiveTime),
}

impl Cadence {
    /// First daily trigger strictly after `after`, as an instant.
    ///
    /// Returns `None` for [`Cadence::Every`], which is driven by an interval
    /// timer instead.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let Self::DailyAt(at) = *self else {
            return None;
        };

        let local_day = after.with_timezone(&tz).date_naive();
        [local_day, local_day + Days::new(1), local_day + Days::new(2)]
            .into_iter()
            .filter_map(|day| tz.from_local_datetime(&day.and_time(at)).earliest())
            .map(|local| local.with_timezone(&Utc))
            .find(|candidate| *candidate > after)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Every(period) => format!("every {}s", period.as_secs()),
            Self::DailyAt(at) => format!("daily at {}", at.format("%H:%M")),
        }
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    /// Parses `every:<n><s|m|h>` or `daily@HH:MM`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if let Some(period) = value.strip_prefix("every:") {
            let unit_at = period.len() - period.chars().last().map_or(0, char::len_utf8);
            let (amount, unit) = period.split_at(unit_at);
            let amount: u64 = amount
                .parse()
                .map_err(|_| CadenceError::Invalid(value.to_string()))?;
            let seconds = match unit {
                "s" => amount,
                "m" => amount.saturating_mul(60),
                "h" => amount.saturating_mul(3600),
                _ => return Err(CadenceError::Invalid(value.to_string())),
            };
            if seconds == 0 {
                return Err(CadenceError::ZeroPeriod);
            }
            return Ok(Self::Every(Duration::from_secs(seconds)));
        }

        if let Some(at) = value.strip_prefix("daily@") {
            let at = NaiveTime::parse_from_str(at, "%H:%M")
                .map_err(|_| CadenceError::Invalid(value.to_string()))?;
            return Ok(Self::DailyAt(at));
        }

        Err(CadenceError::Invalid(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CadenceError {
    Invalid(String),
    ZeroPeriod,
}

impl fmt::Display for CadenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(value) => write!(
                f,
                "cadence must look like 'every:<n>s|m|h' or 'daily@HH:MM' (got {value})"
            ),
            Self::ZeroPeriod => write!(f, "cadence period must be greater than zero"),
        }
    }
}

impl std::error::Error for CadenceError {}
