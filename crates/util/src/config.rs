use std::{env, fmt, net::SocketAddr, time::Duration};

use chrono::NaiveTime;
use chrono_tz::Tz;

use super::{env_or, server_bind_address};
use crate::cadence::{Cadence, CadenceError};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/agency.sqlite?mode=rwc";
pub const DEFAULT_LOOKAHEAD_DAYS: u32 = 30;
pub const DEFAULT_TICK_TIMEOUT_SECS: u64 = 10;

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Settings for the expiry monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct ReminderConfig {
    pub cadence: Cadence,
    pub timezone: Tz,
    pub lookahead_days: u32,
    /// `None` disables deduplication and emits a reminder on every tick.
    pub dedup_horizon_days: Option<u32>,
    pub tick_timeout: Duration,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            cadence: Cadence::DailyAt(NaiveTime::from_hms_opt(9, 0, 0).expect("09:00 is a valid time")),
            timezone: chrono_tz::UTC,
            lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
            dedup_horizon_days: Some(default_dedup_horizon(DEFAULT_LOOKAHEAD_DAYS)),
            tick_timeout: Duration::from_secs(DEFAULT_TICK_TIMEOUT_SECS),
        }
    }
}

impl ReminderConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let cadence = match env::var("REMINDER_CADENCE") {
            Ok(value) => value.parse().map_err(ConfigError::Cadence)?,
            Err(_) => defaults.cadence,
        };

        let timezone = match env::var("REMINDER_TIMEZONE") {
            Ok(value) => value
                .parse::<Tz>()
                .map_err(|_| ConfigError::InvalidTimezone(value.clone()))?,
            Err(_) => defaults.timezone,
        };

        let lookahead_days = match env::var("REMINDER_LOOKAHEAD_DAYS") {
            Ok(value) => value
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidNumber("REMINDER_LOOKAHEAD_DAYS", value))?,
            Err(_) => defaults.lookahead_days,
        };

        let dedup_horizon_days = match env::var("REMINDER_DEDUP_HORIZON_DAYS") {
            Ok(value) if value.eq_ignore_ascii_case("off") => None,
            Ok(value) => Some(
                value
                    .parse::<u32>()
                    .map_err(|_| ConfigError::InvalidNumber("REMINDER_DEDUP_HORIZON_DAYS", value))?,
            ),
            Err(_) => Some(default_dedup_horizon(lookahead_days)),
        };

        let tick_timeout = match env::var("REMINDER_TICK_TIMEOUT_SECS") {
            Ok(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err(ConfigError::InvalidNumber("REMINDER_TICK_TIMEOUT_SECS", value)),
            },
            Err(_) => defaults.tick_timeout,
        };

        Ok(Self {
            cadence,
            timezone,
            lookahead_days,
            dedup_horizon_days,
            tick_timeout,
        })
    }
}

/// Horizon covering every calendar day of a `[today, today + W]` window.
fn default_dedup_horizon(lookahead_days: u32) -> u32 {
    lookahead_days.saturating_add(1)
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub reminders: ReminderConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = Environment::from_str(&env_or("APP_ENV", "development"))?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;
        let database_url = env_or("DATABASE_URL", DEFAULT_DATABASE_URL);
        let reminders = ReminderConfig::from_env()?;

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            reminders,
        })
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    Cadence(CadenceError),
    InvalidTimezone(String),
    InvalidNumber(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::Cadence(err) => write!(f, "invalid REMINDER_CADENCE value: {err}"),
            Self::InvalidTimezone(value) => {
                write!(f, "REMINDER_TIMEZONE must be an IANA timezone name (got {value})")
            }
            Self::InvalidNumber(var, value) => {
                write!(f, "{var} must be a non-negative integer (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
