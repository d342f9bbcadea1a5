//! Capabilities a backing store must expose to the consumer engine.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;

use crate::error::DbEventResult;
use crate::event::Event;

/// A not-yet-run handler invocation.
///
/// The driver decides when (and whether) to poll it; polling it is what runs
/// the user handler for one event.
pub type HandlerFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

/// Driver used by [`crate::Consumer`] to drain a read group.
#[async_trait]
pub trait ConsumerDriver: Send + Sync {
    /// Fetch up to `limit` events past the read group's cursor.
    ///
    /// Returns an empty batch (not an error) when another live node holds the
    /// read group's lease.
    async fn fetch(&self, read_group: &str, limit: i64) -> DbEventResult<Vec<Event>>;

    /// Run `handler` and advance the cursor of `read_group` to `event.id` as
    /// one atomic unit. If either fails the cursor is left unchanged.
    async fn commit_in_trans(
        &self,
        read_group: &str,
        event: &Event,
        handler: HandlerFuture<'_>,
    ) -> DbEventResult<()>;

    /// Block until a write to the event log is observed or `timeout` elapses.
    async fn wait_change(&self, timeout: Duration);
}

/// Full store driver: consumer capabilities plus producer and lifecycle hooks.
#[async_trait]
pub trait StoreDriver: ConsumerDriver {
    /// Create tables, triggers and anything else the driver needs.
    async fn provision(&self) -> DbEventResult<()>;

    /// Append events as a single atomic batch.
    async fn create(&self, events: &[Event]) -> DbEventResult<()>;

    /// Release connections and stop background listeners.
    async fn close(&self) -> DbEventResult<()>;
}
