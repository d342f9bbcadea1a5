use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::debug;

use crate::change::{ChangeFeed, ChangeSubscription};
use crate::error::DbEventResult;

/// Change feed backed by `LISTEN` on the channel the `events` trigger notifies.
///
/// The trigger payload is the name of the table that was written; anything
/// other than `table` is ignored.
pub struct PgChangeFeed {
    pool: PgPool,
    channel: String,
    table: String,
}

impl PgChangeFeed {
    pub fn new(pool: PgPool, channel: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            table: table.into(),
        }
    }
}

#[async_trait]
impl ChangeFeed for PgChangeFeed {
    async fn subscribe(&self) -> DbEventResult<Box<dyn ChangeSubscription>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;

        debug!(channel = %self.channel, "Listening for event log changes");

        Ok(Box::new(PgChangeSubscription {
            listener,
            table: self.table.clone(),
        }))
    }
}

struct PgChangeSubscription {
    listener: PgListener,
    table: String,
}

#[async_trait]
impl ChangeSubscription for PgChangeSubscription {
    async fn next_change(&mut self) -> DbEventResult<()> {
        loop {
            let notification = self.listener.recv().await?;
            if notification.payload() == self.table {
                return Ok(());
            }
        }
    }
}
