//! Reference Registry: a durable, SQLite-backed reference count per S3 key.
//! Incremented on insert, decremented on delete; a key with `ref_count = 0`
//! (or absent entirely) is an orphan candidate.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Result, S3GcError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RefRecord {
    pub s3_key: String,
    pub ref_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default, sqlx::FromRow)]
pub struct RegistryStats {
    pub total_keys: i64,
    pub referenced_keys: i64,
    pub orphaned_keys: i64,
    pub total_references: i64,
}

/// The reference registry. Cheap to clone: wraps a pooled connection.
#[derive(Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Opens (creating if absent) the registry database at `db_path` and
    /// runs its schema migration.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let opts = sqlx::sqlite::SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            db_path.display()
        ))
        .map_err(|e| S3GcError::Registry(e.to_string()))?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Normal);
        let opts = ConnectOptions::disable_statement_logging(opts);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refs (
                s3_key TEXT PRIMARY KEY,
                ref_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_refs_ref_count ON refs(ref_count)")
            .execute(&pool)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_applied (
                source TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                s3_key TEXT NOT NULL,
                PRIMARY KEY (source, event_id, s3_key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        Ok(Registry { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE refs (
                s3_key TEXT PRIMARY KEY,
                ref_count INTEGER NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE cdc_applied (
                source TEXT NOT NULL,
                event_id INTEGER NOT NULL,
                s3_key TEXT NOT NULL,
                PRIMARY KEY (source, event_id, s3_key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        Ok(Registry { pool })
    }

    pub async fn increment(&self, s3_key: &str) -> Result<i64> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(s3_key) DO UPDATE SET
                ref_count = ref_count + 1,
                last_seen = ?
            "#,
        )
        .bind(s3_key)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        self.get_count(s3_key).await
    }

    pub async fn decrement(&self, s3_key: &str) -> Result<i64> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE refs
            SET ref_count = MAX(0, ref_count - 1),
                last_seen = ?
            WHERE s3_key = ?
            "#,
        )
        .bind(now)
        .bind(s3_key)
        .execute(&self.pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        self.get_count(s3_key).await
    }

    /// Applies a single CDC-sourced insert/delete idempotently:
    /// `(source, event_id, s3_key)` is recorded in `cdc_applied` in the
    /// same transaction as the ref_count mutation, and a row that has
    /// already been recorded is skipped rather than reapplied. This is
    /// what makes replaying an already-handled CDC batch after a crash
    /// safe — a transport's own "delete the row, then advance the
    /// checkpoint" atomicity only protects its own storage, not a
    /// registry mutation already committed to a different database.
    /// Returns `true` if the change was newly applied, `false` if it was
    /// already recorded and therefore skipped.
    pub async fn apply_cdc_change(
        &self,
        source: &str,
        event_id: i64,
        s3_key: &str,
        is_insert: bool,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(|e| S3GcError::Registry(e.to_string()))?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO cdc_applied (source, event_id, s3_key) VALUES (?, ?, ?)",
        )
        .bind(source)
        .bind(event_id)
        .bind(s3_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| S3GcError::Registry(e.to_string()))?;
            return Ok(false);
        }

        let now = Utc::now();
        if is_insert {
            sqlx::query(
                r#"
                INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
                VALUES (?, 1, ?, ?)
                ON CONFLICT(s3_key) DO UPDATE SET
                    ref_count = ref_count + 1,
                    last_seen = ?
                "#,
            )
            .bind(s3_key)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;
        } else {
            sqlx::query(
                r#"
                UPDATE refs
                SET ref_count = MAX(0, ref_count - 1),
                    last_seen = ?
                WHERE s3_key = ?
                "#,
            )
            .bind(now)
            .bind(s3_key)
            .execute(&mut *tx)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| S3GcError::Registry(e.to_string()))?;
        Ok(true)
    }

    pub async fn bulk_increment(&self, s3_keys: &[String]) -> Result<()> {
        if s3_keys.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| S3GcError::Registry(e.to_string()))?;
        let now = Utc::now();
        for key in s3_keys {
            sqlx::query(
                r#"
                INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
                VALUES (?, 1, ?, ?)
                ON CONFLICT(s3_key) DO UPDATE SET
                    ref_count = ref_count + 1,
                    last_seen = ?
                "#,
            )
            .bind(key)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| S3GcError::Registry(e.to_string()))?;
        Ok(())
    }

    pub async fn bulk_decrement(&self, s3_keys: &[String]) -> Result<()> {
        if s3_keys.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(|e| S3GcError::Registry(e.to_string()))?;
        let now = Utc::now();
        for key in s3_keys {
            sqlx::query(
                r#"
                UPDATE refs SET ref_count = MAX(0, ref_count - 1), last_seen = ?
                WHERE s3_key = ?
                "#,
            )
            .bind(now)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| S3GcError::Registry(e.to_string()))?;
        Ok(())
    }

    /// Sets the reference count for a key to an explicit value. Used by the
    /// verifier's L2 repair path and by registry backfills.
    pub async fn set(&self, s3_key: &str, count: i64) -> Result<()> {
        if count < 0 {
            return Err(S3GcError::Registry(format!(
                "ref_count must be >= 0, got {count}"
            )));
        }
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO refs (s3_key, ref_count, first_seen, last_seen)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(s3_key) DO UPDATE SET
                ref_count = ?,
                last_seen = ?
            "#,
        )
        .bind(s3_key)
        .bind(count)
        .bind(now)
        .bind(now)
        .bind(count)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;
        Ok(())
    }

    pub async fn get_count(&self, s3_key: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT ref_count FROM refs WHERE s3_key = ?")
            .bind(s3_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;
        Ok(row.map(|r| r.0).unwrap_or(0))
    }

    /// Returns the subset of `candidate_keys` that are orphan candidates:
    /// absent from the registry entirely, or present with `ref_count = 0`.
    /// Queries are chunked to stay under SQLite's bound-parameter limit.
    pub async fn orphan_candidates(&self, candidate_keys: &[String]) -> Result<Vec<String>> {
        if candidate_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut referenced = std::collections::HashSet::new();
        for chunk in candidate_keys.chunks(500) {
            let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT s3_key FROM refs WHERE s3_key IN ({placeholders}) AND ref_count > 0"
            );
            let mut query = sqlx::query_as::<_, (String,)>(&sql);
            for key in chunk {
                query = query.bind(key);
            }
            let rows = query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| S3GcError::Registry(e.to_string()))?;
            referenced.extend(rows.into_iter().map(|r| r.0));
        }

        Ok(candidate_keys
            .iter()
            .filter(|k| !referenced.contains(*k))
            .cloned()
            .collect())
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let row: (i64, i64, i64, Option<i64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN ref_count > 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN ref_count = 0 THEN 1 ELSE 0 END), 0),
                SUM(ref_count)
            FROM refs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| S3GcError::Registry(e.to_string()))?;

        Ok(RegistryStats {
            total_keys: row.0,
            referenced_keys: row.1,
            orphaned_keys: row.2,
            total_references: row.3.unwrap_or(0),
        })
    }

    /// Removes zero-ref rows untouched for more than `older_than_days`,
    /// keeping the registry from growing unbounded with deleted keys.
    pub async fn prune_zero_refs(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let result = sqlx::query("DELETE FROM refs WHERE ref_count = 0 AND last_seen < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| S3GcError::Registry(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
