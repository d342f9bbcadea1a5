use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DbEventResult;

/// Represents an immutable record in the event log.
///
/// Events are appended once by a producer and never updated or deleted.
/// The `id` is assigned by the store on insert and is strictly increasing,
/// which is what read-group cursors are measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-assigned sequence id (0 until the event has been inserted)
    pub id: i64,

    /// Event type (e.g., "order.placed")
    pub event_type: String,

    /// Type of aggregate this event relates to (empty when unused)
    pub aggregate_type: String,

    /// ID of the aggregate this event relates to (empty when unused)
    pub aggregate_id: String,

    /// Event payload as JSON
    pub data: Option<serde_json::Value>,

    /// Timestamp when event was built
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event with no aggregate keys and no payload
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: 0,
            event_type: event_type.into(),
            aggregate_type: String::new(),
            aggregate_id: String::new(),
            data: None,
            created_at: Utc::now(),
        }
    }

    /// Decode the payload into a typed value
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> DbEventResult<Option<T>> {
        match &self.data {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Fluent builder for [`Event`].
///
/// ```
/// use db_event::EventBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let event = EventBuilder::new("order.placed")
///     .aggregate("order", "order-42")
///     .data(&serde_json::json!({ "total": 120 }))?
///     .build();
///
/// assert_eq!(event.event_type, "order.placed");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event: Event::new(event_type),
        }
    }

    /// Set the aggregate grouping keys
    pub fn aggregate(
        mut self,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        self.event.aggregate_type = aggregate_type.into();
        self.event.aggregate_id = aggregate_id.into();
        self
    }

    /// Serialize `data` to JSON and attach it as the payload
    pub fn data<T: Serialize + ?Sized>(mut self, data: &T) -> DbEventResult<Self> {
        self.event.data = Some(serde_json::to_value(data)?);
        Ok(self)
    }

    /// Finish the event, stamping `created_at` with the current time
    pub fn build(mut self) -> Event {
        self.event.created_at = Utc::now();
        self.event
    }
}

// Database row representation
#[derive(sqlx::FromRow)]
pub(crate) struct EventRow {
    id: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    aggregate_type: Option<String>,
    aggregate_id: Option<String>,
    data: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            event_type: row.event_type,
            aggregate_type: row.aggregate_type.unwrap_or_default(),
            aggregate_id: row.aggregate_id.unwrap_or_default(),
            data: row.data,
            created_at: row.created_at,
        }
    }
}
