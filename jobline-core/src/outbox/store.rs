//! Outbox persistence: the `execute_with_outbox` transactional wrapper plus the drain-side
//! claim/mark operations the [`super::OutboxProcessor`] needs (§4.4).

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::outbox::model::{NewOutboxEvent, OutboxEvent};

/// How long a claim survives before another drain loop may re-claim the row — guards against a
/// processor crashing mid-batch after claiming but before `mark_processed`/`mark_failed`. Status
/// stays `pending` for the whole lease (§3's outbox invariant only names `{pending, processed,
/// failed}`); the lease lives in a separate `claimed_at` column instead of a fourth status value.
pub(crate) const CLAIM_LEASE_SECONDS: i64 = 30;

/// Drain-side operations, kept object-safe (no generic methods) so [`super::OutboxProcessor`]
/// can hold an `Arc<dyn OutboxStore>` without committing to a concrete database.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `batch_size` pending, unleased (or lease-expired) events in creation order.
    /// The claim itself — not just the row selection — must be durable past this call returning,
    /// so a concurrent or subsequent `claim_pending_batch` does not re-select the same rows
    /// before `mark_processed`/`mark_failed` lands (§4.4: "no event is processed twice").
    async fn claim_pending_batch(&self, batch_size: i64) -> Result<Vec<OutboxEvent>>;

    async fn mark_processed(&self, id: Uuid) -> Result<()>;

    /// Records a failed publish attempt. Transitions to `Failed` once `attempts` reaches
    /// `max_attempts`; otherwise stays `Pending` for the next drain cycle to retry.
    async fn mark_failed(&self, id: Uuid, error: &str, max_attempts: u32) -> Result<()>;
}

#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a connection pool against `database_url` and runs the `outbox_events` migration
    /// (§6 persisted state layout) if it hasn't already been applied.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| QueueError::Unavailable(format!("postgres connect failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id UUID PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                processed_at TIMESTAMPTZ,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INT NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| QueueError::Unavailable(format!("outbox_events migration failed: {e}")))?;

        sqlx::query("ALTER TABLE outbox_events ADD COLUMN IF NOT EXISTS claimed_at TIMESTAMPTZ")
            .execute(&pool)
            .await
            .map_err(|e| QueueError::Unavailable(format!("outbox_events claimed_at migration failed: {e}")))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS outbox_events_status_created_at_idx ON outbox_events (status, created_at)")
            .execute(&pool)
            .await
            .map_err(|e| QueueError::Unavailable(format!("outbox_events index migration failed: {e}")))?;

        Ok(Self { pool })
    }

    /// `ExecuteWithOutbox(tx, logic, events)`: runs `logic` and the outbox inserts in one
    /// transaction, committing only if `logic` succeeds. Kept as an inherent method (not part of
    /// the [`OutboxStore`] trait) because it is generic over the caller's return type `T`, which
    /// a `dyn OutboxStore` cannot express.
    pub async fn execute_with_outbox<T, F>(&self, events: Vec<NewOutboxEvent>, logic: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut Transaction<'_, Postgres>) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| QueueError::Unavailable(format!("begin transaction: {e}")))?;

        let result = logic(&mut tx).await?;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO outbox_events (id, queue_name, payload, created_at, status, attempts)
                VALUES ($1, $2, $3, $4, 'pending', 0)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(&event.queue_name)
            .bind(&event.payload)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| QueueError::Unavailable(format!("insert outbox event: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| QueueError::Unavailable(format!("commit transaction: {e}")))?;

        Ok(result)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_pending_batch(&self, batch_size: i64) -> Result<Vec<OutboxEvent>> {
        // A single atomic UPDATE ... RETURNING: the inner SELECT ... FOR UPDATE SKIP LOCKED picks
        // the candidate rows and the outer UPDATE stamps `claimed_at` before the statement's
        // implicit transaction commits, so the claim itself (not just the row lock) survives past
        // this call returning. Without the UPDATE, a plain `SELECT ... FOR UPDATE SKIP LOCKED`
        // followed by `COMMIT` releases the lock immediately and a concurrent caller can re-select
        // the same still-pending rows.
        let rows: Vec<OutboxEvent> = sqlx::query_as(
            r#"
            UPDATE outbox_events
            SET claimed_at = now()
            WHERE id IN (
                SELECT id FROM outbox_events
                WHERE status = 'pending'
                  AND (claimed_at IS NULL OR claimed_at < now() - make_interval(secs => $1))
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue_name, payload, created_at, processed_at, status, attempts, last_error
            "#,
        )
        .bind(CLAIM_LEASE_SECONDS as f64)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(format!("claim pending batch: {e}")))?;

        Ok(rows)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'processed', processed_at = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(format!("mark processed: {e}")))?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, max_attempts: u32) -> Result<()> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE outbox_events
            SET attempts = attempts + 1, last_error = $2
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| QueueError::Unavailable(format!("record failed attempt: {e}")))?;

        if row.0 as u32 >= max_attempts {
            sqlx::query("UPDATE outbox_events SET status = 'failed' WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| QueueError::Unavailable(format!("mark failed: {e}")))?;
        }
        Ok(())
    }
}
