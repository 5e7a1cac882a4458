//! Configuration and scheduling primitives shared by the agency binaries.

pub mod cadence;
pub mod config;

use std::{env, net::SocketAddr, path::PathBuf};

pub use cadence::{Cadence, CadenceError};
pub use config::{AppConfig, ConfigError, Environment, ReminderConfig};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Reads `.env` into the process environment, returning the file that was used.
///
/// A missing file is not an error; deployed builds configure through the
/// real environment instead.
pub fn load_env_file() -> Option<PathBuf> {
    dotenvy::dotenv().ok()
}

/// Value of `var`, or `default` when it is unset or not valid unicode.
pub(crate) fn env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

/// Socket address for the HTTP listener, from `APP_BIND_ADDR`.
pub fn server_bind_address() -> Result<SocketAddr, std::net::AddrParseError> {
    env_or("APP_BIND_ADDR", DEFAULT_BIND_ADDR).parse()
}
