//! Error types for the db-event library.

use thiserror::Error;

use crate::consumer::ConsumerState;

/// Result type alias for event log operations.
pub type DbEventResult<T> = Result<T, DbEventError>;

/// Errors that can occur while producing, fetching or committing events.
#[derive(Error, Debug)]
pub enum DbEventError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The event handler rejected the event; the cursor was not advanced
    #[error("Event handler failed for event {event_id}: {source}")]
    Handler {
        event_id: i64,
        #[source]
        source: anyhow::Error,
    },

    /// `consume` was called on a consumer that already left the idle state
    #[error("Consumer is not idle (state: {0:?})")]
    ConsumerNotIdle(ConsumerState),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("Event log error: {0}")]
    Other(#[from] anyhow::Error),
}

impl DbEventError {
    /// Check if error is transient (connection or pool pressure) rather than a logic failure
    pub fn is_transient(&self) -> bool {
        match self {
            DbEventError::Database(sqlx_err) => matches!(
                sqlx_err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}
