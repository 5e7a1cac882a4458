//! Domain layer for policy expiry monitoring.
//!
//! Holds the storage-agnostic pieces of the reminder pipeline: the scanner
//! that selects policies nearing expiration, the emitter that turns them into
//! reminders, and the store traits both depend on.

pub mod expiry;
pub mod memory;
pub mod reminder;
pub mod store;
pub mod types;

pub use expiry::{DanglingReference, ExpiryScanner, ExpiryWindow, ScanError, ScanOutcome};
pub use reminder::{format_message, DedupPolicy, EmitFailure, EmitReport, ReminderEmitter};
pub use store::{PolicyStore, ReminderStore, StoreError};
