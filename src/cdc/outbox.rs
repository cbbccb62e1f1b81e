use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

use super::{CdcTransport, ChangeEvent, ChangeHandler, ChangeOp};
use crate::error::{Result, S3GcError};
use crate::keys::extract_keys;

/// Trigger-and-poll CDC transport for Postgres. A `s3gc_capture_change`
/// trigger (installed by [`OutboxTransport::install_triggers`]) writes one
/// row per tracked-column change into `s3gc_outbox`; this transport polls
/// that table, applies each row's extracted keys to the handler, then
/// deletes the row and advances a single-row checkpoint in the same
/// Postgres transaction. That transaction only makes the outbox-side
/// bookkeeping atomic with itself — it says nothing about the handler's
/// own database, which is a separate SQLite connection. A crash between
/// the last `handler.handle()` call and this transaction's commit replays
/// the same outbox rows on restart, so each event carries its own row id
/// as a `dedup` key: [`crate::registry::Registry::apply_cdc_change`]
/// records `(source, event_id, s3_key)` and the ref_count mutation in one
/// SQLite transaction, so a replayed row is a no-op rather than a second
/// increment or decrement.
pub struct OutboxTransport {
    pool: PgPool,
    batch_size: i64,
    poll_interval: Duration,
    stopped: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl OutboxTransport {
    pub async fn connect(connection_url: &str, batch_size: i64) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(connection_url)
            .await
            .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS s3gc_outbox (
                id BIGSERIAL PRIMARY KEY,
                table_name TEXT NOT NULL,
                column_name TEXT NOT NULL,
                op TEXT NOT NULL,
                raw_value TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_s3gc_outbox_created_at ON s3gc_outbox(created_at)",
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS s3gc_outbox_checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_processed_id BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        sqlx::query(
            "INSERT INTO s3gc_outbox_checkpoint (id, last_processed_id) VALUES (1, 0) \
             ON CONFLICT (id) DO NOTHING",
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        Ok(OutboxTransport {
            pool,
            batch_size,
            poll_interval: Duration::from_millis(250),
            stopped: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        })
    }

    /// Installs the capture trigger and per-column triggers for the given
    /// `table -> [column, ...]` mapping. Idempotent: safe to call on every
    /// startup.
    pub async fn install_triggers(
        &self,
        tables: &crate::config::TableConfig,
    ) -> Result<()> {
        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION s3gc_capture_change()
            RETURNS TRIGGER AS $$
            DECLARE
                col_name TEXT := TG_ARGV[0];
                col_value TEXT;
            BEGIN
                IF TG_OP = 'DELETE' THEN
                    EXECUTE format('SELECT ($1).%I::TEXT', col_name) INTO col_value USING OLD;
                    IF col_value IS NOT NULL THEN
                        INSERT INTO s3gc_outbox (table_name, column_name, op, raw_value)
                        VALUES (TG_TABLE_NAME, col_name, 'delete', col_value);
                    END IF;
                ELSIF TG_OP = 'INSERT' THEN
                    EXECUTE format('SELECT ($1).%I::TEXT', col_name) INTO col_value USING NEW;
                    IF col_value IS NOT NULL THEN
                        INSERT INTO s3gc_outbox (table_name, column_name, op, raw_value)
                        VALUES (TG_TABLE_NAME, col_name, 'insert', col_value);
                    END IF;
                ELSIF TG_OP = 'UPDATE' THEN
                    EXECUTE format('SELECT ($1).%I::TEXT', col_name) INTO col_value USING OLD;
                    IF col_value IS NOT NULL THEN
                        INSERT INTO s3gc_outbox (table_name, column_name, op, raw_value)
                        VALUES (TG_TABLE_NAME, col_name, 'delete', col_value);
                    END IF;
                    EXECUTE format('SELECT ($1).%I::TEXT', col_name) INTO col_value USING NEW;
                    IF col_value IS NOT NULL THEN
                        INSERT INTO s3gc_outbox (table_name, column_name, op, raw_value)
                        VALUES (TG_TABLE_NAME, col_name, 'insert', col_value);
                    END IF;
                END IF;
                RETURN NULL;
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        for (table, columns) in tables {
            for column in columns {
                let trigger_name = format!("s3gc_trigger_{table}_{column}");
                sqlx::query(&format!("DROP TRIGGER IF EXISTS {trigger_name} ON {table}"))
                    .execute(&self.pool)
                    .await
                    .map_err(|e| S3GcError::Cdc(e.to_string()))?;

                sqlx::query(&format!(
                    "CREATE TRIGGER {trigger_name} \
                     AFTER INSERT OR UPDATE OR DELETE ON {table} \
                     FOR EACH ROW EXECUTE FUNCTION s3gc_capture_change('{column}')"
                ))
                .execute(&self.pool)
                .await
                .map_err(|e| S3GcError::Cdc(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// Polls once, applying up to `batch_size` pending rows. Returns the
    /// number of outbox rows consumed (not the number of keys extracted,
    /// which may differ for JSON-array columns).
    pub async fn poll_once(&self, handler: &dyn ChangeHandler) -> Result<usize> {
        let mut tx = self.pool.begin().await.map_err(|e| S3GcError::Cdc(e.to_string()))?;

        let rows = sqlx::query(
            "SELECT id, op, raw_value FROM s3gc_outbox ORDER BY id LIMIT $1",
        )
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        if rows.is_empty() {
            tx.commit().await.map_err(|e| S3GcError::Cdc(e.to_string()))?;
            return Ok(0);
        }

        let mut max_id: i64 = 0;
        for row in &rows {
            let id: i64 = row.try_get("id").map_err(|e| S3GcError::Cdc(e.to_string()))?;
            let op: String = row.try_get("op").map_err(|e| S3GcError::Cdc(e.to_string()))?;
            let raw_value: Option<String> =
                row.try_get("raw_value").map_err(|e| S3GcError::Cdc(e.to_string()))?;
            max_id = max_id.max(id);

            let change_op = match op.as_str() {
                "insert" => ChangeOp::Insert,
                "delete" => ChangeOp::Delete,
                other => {
                    return Err(S3GcError::Cdc(format!("unknown outbox op {other:?}")));
                }
            };

            if let Some(value) = raw_value {
                for key in extract_keys(&value) {
                    handler
                        .handle(ChangeEvent {
                            key,
                            op: change_op,
                            dedup: Some(("outbox".to_string(), id)),
                        })
                        .await?;
                }
            }
        }

        let ids: Vec<i64> = rows
            .iter()
            .map(|r| r.try_get::<i64, _>("id").unwrap())
            .collect();
        sqlx::query("DELETE FROM s3gc_outbox WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        sqlx::query(
            "UPDATE s3gc_outbox_checkpoint SET last_processed_id = $1, updated_at = now() \
             WHERE id = 1 AND last_processed_id < $1",
        )
        .bind(max_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| S3GcError::Cdc(e.to_string()))?;

        tx.commit().await.map_err(|e| S3GcError::Cdc(e.to_string()))?;
        Ok(rows.len())
    }
}

#[async_trait]
impl CdcTransport for OutboxTransport {
    async fn run(&mut self, handler: &dyn ChangeHandler) -> Result<()> {
        while !self.stopped.load(std::sync::atomic::Ordering::Relaxed) {
            match self.poll_once(handler).await {
                Ok(0) => tokio::time::sleep(self.poll_interval).await,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "outbox poll failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.stopped.store(true, std::sync::atomic::Ordering::Relaxed);
    }
}
