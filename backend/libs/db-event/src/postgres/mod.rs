//! PostgreSQL implementation of the store driver.
//!
//! ## Lease
//!
//! Each read group has one row in `event_locks`. Acquisition is a single
//! conditional upsert: insert the row if missing, otherwise take it over only
//! when this node already holds it or the holder's `last_seen` is older than
//! the lease timeout. `RETURNING` yields a row exactly when this node ends up
//! as the holder, so there is no window between writing and checking.
//!
//! ## Cursor
//!
//! `event_offsets` keeps the highest committed event id per read group. A
//! missing row means offset 0. The cursor is advanced in the same transaction
//! as the handler runs in, and never moves backwards.
//!
//! ## Appends
//!
//! Ids come from a sequence, so two concurrent inserts could commit out of id
//! order and a consumer could advance past an id that is not visible yet.
//! `create` therefore takes a transaction-scoped advisory lock before
//! inserting: appends through the driver commit one at a time, in id order.
//! Writers that bypass `create` must take the same lock.

mod listener;
mod schema;

pub use listener::PgChangeFeed;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::change::ChangeNotifier;
use crate::config::{DbConfig, PgDriverConfig};
use crate::driver::{ConsumerDriver, HandlerFuture, StoreDriver};
use crate::error::{DbEventError, DbEventResult};
use crate::event::{Event, EventRow};

// Five bind parameters per row; PostgreSQL allows at most 65535 per statement.
const INSERT_CHUNK_SIZE: usize = 1000;

const LISTEN_START_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PgEventDriver {
    pool: PgPool,
    config: PgDriverConfig,
    change: ChangeNotifier,
}

impl PgEventDriver {
    /// Create a driver on an existing pool.
    ///
    /// # Errors
    ///
    /// Returns [`DbEventError::InvalidConfig`] if `config` fails validation.
    pub fn new(pool: PgPool, config: PgDriverConfig) -> DbEventResult<Self> {
        config.validate()?;

        let feed = PgChangeFeed::new(
            pool.clone(),
            config.notify_channel.clone(),
            schema::EVENTS_TABLE,
        );

        Ok(Self {
            pool,
            change: ChangeNotifier::new(Arc::new(feed)),
            config,
        })
    }

    /// Connect a new pool and create a driver on it.
    pub async fn connect(db_config: &DbConfig, config: PgDriverConfig) -> DbEventResult<Self> {
        config.validate()?;
        let pool = db_config.create_pool().await?;
        Self::new(pool, config)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Try to acquire (or refresh) this node's lease on `read_group`.
    ///
    /// Returns `true` if this node holds the lease afterwards.
    pub async fn acquire_lease(&self, read_group: &str) -> DbEventResult<bool> {
        let holder: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO event_locks (name, lock_by, last_seen)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
            SET lock_by = EXCLUDED.lock_by,
                last_seen = EXCLUDED.last_seen
            WHERE event_locks.lock_by = EXCLUDED.lock_by
               OR event_locks.last_seen < NOW() - make_interval(secs => $3)
            RETURNING lock_by
            "#,
        )
        .bind(read_group)
        .bind(&self.config.node_id)
        .bind(self.config.lease_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let acquired = holder.as_deref() == Some(self.config.node_id.as_str());

        if !acquired {
            debug!(
                read_group = %read_group,
                node_id = %self.config.node_id,
                "Lease held by another node"
            );
        }

        Ok(acquired)
    }

    /// Give up this node's lease on `read_group` so another node can take over
    /// without waiting for the lease timeout.
    pub async fn release_lease(&self, read_group: &str) -> DbEventResult<bool> {
        let result = sqlx::query("DELETE FROM event_locks WHERE name = $1 AND lock_by = $2")
            .bind(read_group)
            .bind(&self.config.node_id)
            .execute(&self.pool)
            .await?;

        let released = result.rows_affected() > 0;
        if released {
            info!(read_group = %read_group, node_id = %self.config.node_id, "Lease released");
        }

        Ok(released)
    }

    /// Highest committed event id for `read_group`, or 0 if nothing was committed yet.
    pub async fn current_offset(&self, read_group: &str) -> DbEventResult<i64> {
        let offset: Option<i64> =
            sqlx::query_scalar(r#"SELECT "offset" FROM event_offsets WHERE name = $1"#)
                .bind(read_group)
                .fetch_optional(&self.pool)
                .await?;

        Ok(offset.unwrap_or(0))
    }

    async fn events_after(&self, offset: i64, limit: i64) -> DbEventResult<Vec<Event>> {
        let events = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT id, type, aggregate_type, aggregate_id, data, created_at
            FROM events
            WHERE id > $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Event::from)
        .collect();

        Ok(events)
    }

    /// Like [`ConsumerDriver::commit_in_trans`], but hands the handler the
    /// transaction's connection.
    ///
    /// Writes the handler makes through that connection commit or roll back
    /// together with the cursor advance.
    pub async fn commit_with<F>(
        &self,
        read_group: &str,
        event: &Event,
        handler: F,
    ) -> DbEventResult<()>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, anyhow::Result<()>> + Send,
    {
        let mut tx = self.begin_commit(read_group, event).await?;
        let result = handler(&mut *tx).await;
        Self::finish_commit(tx, read_group, event, result).await
    }

    async fn begin_commit(
        &self,
        read_group: &str,
        event: &Event,
    ) -> DbEventResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO event_offsets (name, "offset")
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE
            SET "offset" = GREATEST(event_offsets."offset", EXCLUDED."offset")
            "#,
        )
        .bind(read_group)
        .bind(event.id)
        .execute(&mut *tx)
        .await?;

        Ok(tx)
    }

    async fn finish_commit(
        tx: Transaction<'static, Postgres>,
        read_group: &str,
        event: &Event,
        result: anyhow::Result<()>,
    ) -> DbEventResult<()> {
        if let Err(source) = result {
            if let Err(e) = tx.rollback().await {
                warn!(read_group = %read_group, event_id = event.id, error = ?e, "Rollback failed");
            }
            return Err(DbEventError::Handler {
                event_id: event.id,
                source,
            });
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ConsumerDriver for PgEventDriver {
    async fn fetch(&self, read_group: &str, limit: i64) -> DbEventResult<Vec<Event>> {
        if !self.acquire_lease(read_group).await? {
            return Ok(Vec::new());
        }

        // Subscribe before reading, so an empty read is followed by a wait on a live feed.
        if !self.change.start(LISTEN_START_TIMEOUT).await {
            debug!(read_group = %read_group, "Change feed not listening, waits use timeout only");
        }

        let offset = self.current_offset(read_group).await?;
        let events = self.events_after(offset, limit).await?;

        debug!(
            read_group = %read_group,
            offset,
            count = events.len(),
            "Fetched events"
        );

        Ok(events)
    }

    async fn commit_in_trans(
        &self,
        read_group: &str,
        event: &Event,
        handler: HandlerFuture<'_>,
    ) -> DbEventResult<()> {
        let tx = self.begin_commit(read_group, event).await?;
        let result = handler.await;
        Self::finish_commit(tx, read_group, event, result).await
    }

    async fn wait_change(&self, timeout: Duration) {
        self.change.wait_change(timeout).await;
    }
}

#[async_trait]
impl StoreDriver for PgEventDriver {
    async fn provision(&self) -> DbEventResult<()> {
        schema::provision(&self.pool, &self.config.notify_channel).await
    }

    async fn create(&self, events: &[Event]) -> DbEventResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // Held until commit, so the next append allocates ids only after ours are visible.
        sqlx::query(schema::APPEND_LOCK_SQL).execute(&mut *tx).await?;

        for chunk in events.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO events (type, aggregate_type, aggregate_id, data, created_at) ",
            );
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(&event.event_type)
                    .push_bind(non_empty(&event.aggregate_type))
                    .push_bind(non_empty(&event.aggregate_id))
                    .push_bind(&event.data)
                    .push_bind(event.created_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;

        debug!(count = events.len(), "Events appended");
        Ok(())
    }

    async fn close(&self) -> DbEventResult<()> {
        self.change.close();
        self.pool.close().await;
        info!(node_id = %self.config.node_id, "Event driver closed");
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}
