//! # Durable Event Log on PostgreSQL
//!
//! Producers append immutable events to an `events` table. Consumers drain a
//! named **read group** from that log with at-least-once delivery:
//!
//! 1. A consumer fetches a batch past the read group's cursor, but only while
//!    it holds the read group's **lease** (a time-boxed row in `event_locks`)
//! 2. Each event is handed to the handler inside a transaction that also
//!    advances the cursor in `event_offsets`
//! 3. A failed handler rolls the cursor back; the event is refetched after a
//!    backoff
//! 4. When there is nothing to fetch, the consumer sleeps on the change feed
//!    (`LISTEN`/`NOTIFY` from an insert trigger) instead of polling
//!
//! Any number of nodes can run a consumer for the same read group. Only the
//! lease holder makes progress; the others see empty batches and wait. If the
//! holder dies, its lease goes stale after `lease_timeout` and another node
//! takes over from the committed cursor.
//!
//! Handlers may see an event more than once (a crash between handling and
//! commit, or side effects outside the transaction), so they must be
//! idempotent.
//!
//! ## Usage Example
//!
//! ### 1. Produce events
//!
//! ```rust,no_run
//! use db_event::{DbConfig, EventBuilder, EventStore, PgDriverConfig, PgEventDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = PgEventDriver::connect(
//!         &DbConfig::new("postgresql://localhost/mydb"),
//!         PgDriverConfig::default(),
//!     )
//!     .await?;
//!     let store = EventStore::new(driver).await?;
//!
//!     let event = EventBuilder::new("order.placed")
//!         .aggregate("order", "order-42")
//!         .data(&serde_json::json!({ "total": 120 }))?
//!         .build();
//!
//!     store.produce(&[event]).await?;
//!     store.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Consume a read group
//!
//! ```rust,no_run
//! use db_event::{ConsumerConfig, DbConfig, EventStore, PgDriverConfig, PgEventDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = PgEventDriver::connect(
//!         &DbConfig::new("postgresql://localhost/mydb"),
//!         PgDriverConfig::with_node_id("node-1"),
//!     )
//!     .await?;
//!     let store = EventStore::new(driver).await?;
//!
//!     let consumer = store.new_consumer("billing", ConsumerConfig::default());
//!     consumer.consume(|event| async move {
//!         println!("got event {}", event.id);
//!         Ok(())
//!     })?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     consumer.close_and_wait().await;
//!     store.close().await?;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod change;
pub mod config;
pub mod consumer;
pub mod driver;
mod error;
pub mod event;
pub mod metrics;
pub mod postgres;
pub mod store;

pub use backoff::{Backoff, BackoffConfig, Backoffer, NO_JITTER};
pub use change::{ChangeFeed, ChangeNotifier, ChangeSubscription};
pub use config::{DbConfig, PgDriverConfig};
pub use consumer::{Consumer, ConsumerConfig, ConsumerState};
pub use driver::{ConsumerDriver, HandlerFuture, StoreDriver};
pub use error::{DbEventError, DbEventResult};
pub use event::{Event, EventBuilder};
pub use metrics::ConsumerMetrics;
pub use postgres::{PgChangeFeed, PgEventDriver};
pub use store::EventStore;
