//! Table and trigger provisioning for the PostgreSQL driver.

use sqlx::PgPool;
use tracing::info;

use crate::error::DbEventResult;

pub(crate) const EVENTS_TABLE: &str = "events";

/// Serializes appends to `events` until the surrounding transaction ends.
pub(crate) const APPEND_LOCK_SQL: &str =
    "SELECT pg_advisory_xact_lock(hashtext('db_event_append'))";

const CREATE_EVENTS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        type TEXT NOT NULL,
        aggregate_type TEXT,
        aggregate_id TEXT,
        data JSONB DEFAULT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
"#;

const CREATE_OFFSETS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS event_offsets (
        name VARCHAR(128) PRIMARY KEY,
        "offset" BIGINT NOT NULL
    )
"#;

const CREATE_LOCKS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS event_locks (
        name VARCHAR(128) PRIMARY KEY,
        lock_by VARCHAR(128) NOT NULL,
        last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
"#;

fn notify_function_sql(channel: &str) -> String {
    format!(
        r#"
        CREATE OR REPLACE FUNCTION db_event_notify_{channel}() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify('{channel}', TG_TABLE_NAME);
            RETURN NULL;
        END;
        $$ LANGUAGE plpgsql
        "#
    )
}

fn drop_trigger_sql(channel: &str) -> String {
    format!("DROP TRIGGER IF EXISTS events_notify_{channel} ON events")
}

fn create_trigger_sql(channel: &str) -> String {
    format!(
        "CREATE TRIGGER events_notify_{channel} \
         AFTER INSERT ON events \
         FOR EACH STATEMENT EXECUTE FUNCTION db_event_notify_{channel}()"
    )
}

/// Create the event, offset and lock tables plus the insert notification trigger.
///
/// Idempotent. Concurrent callers are serialized with a transaction-scoped
/// advisory lock. `channel` must already be validated as a plain identifier.
pub(crate) async fn provision(pool: &PgPool, channel: &str) -> DbEventResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock(hashtext('db_event_provision'))")
        .execute(&mut *tx)
        .await?;

    for statement in [
        CREATE_EVENTS_TABLE.to_string(),
        CREATE_OFFSETS_TABLE.to_string(),
        CREATE_LOCKS_TABLE.to_string(),
        notify_function_sql(channel),
        drop_trigger_sql(channel),
        create_trigger_sql(channel),
    ] {
        sqlx::query(&statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;

    info!(notify_channel = %channel, "Event tables provisioned");
    Ok(())
}
