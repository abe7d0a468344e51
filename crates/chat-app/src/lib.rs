#![deny(unsafe_code)]

/// Conversation-scoped message synchronization.
pub mod chat;
pub mod error;
/// Settings persistence.
pub mod settings;
pub mod telemetry;

pub use error::{SyncError, SyncResult};
