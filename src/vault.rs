//! Audit Vault: the append-only trail of every GC operation and every
//! deletion it performed. Nothing here is ever deleted by this crate;
//! `mark_restored` is the only post-insert mutation, and it only ever sets
//! a previously-null `restored_at`.

pub mod replication;

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, SqlitePool};
use ulid::Ulid;

use crate::config::GcMode;
use crate::error::{Result, S3GcError};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub mode: String,
    pub stats: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeletionRecord {
    pub id: i64,
    pub operation_id: String,
    pub s3_key: String,
    pub backup_path: String,
    pub original_size: i64,
    pub compressed_size: i64,
    pub content_hash: Option<String>,
    pub deleted_at: DateTime<Utc>,
    pub restored_at: Option<DateTime<Utc>>,
    pub restore_operation_id: Option<String>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct VaultStats {
    pub total_operations: i64,
    pub total_deletions: i64,
    pub restored_deletions: i64,
    pub total_original_bytes: i64,
    pub total_compressed_bytes: i64,
    pub avg_compression_ratio: f64,
}

#[derive(Clone)]
pub struct Vault {
    pool: SqlitePool,
}

impl Vault {
    pub async fn open(db_path: &Path) -> Result<Self> {
        let opts = sqlx::sqlite::SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            db_path.display()
        ))
        .map_err(|e| S3GcError::Vault(e.to_string()))?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Full);
        let opts = ConnectOptions::disable_statement_logging(opts);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?;

        Self::migrate(&pool).await?;
        Ok(Vault { pool })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?;
        Self::migrate(&pool).await?;
        Ok(Vault { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                mode TEXT NOT NULL,
                stats TEXT NOT NULL,
                completed_at TEXT,
                error TEXT
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deletions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                operation_id TEXT NOT NULL,
                s3_key TEXT NOT NULL,
                backup_path TEXT NOT NULL,
                original_size INTEGER NOT NULL,
                compressed_size INTEGER NOT NULL,
                content_hash TEXT,
                deleted_at TEXT NOT NULL,
                restored_at TEXT,
                restore_operation_id TEXT,
                FOREIGN KEY (operation_id) REFERENCES operations(id),
                UNIQUE (operation_id, backup_path)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_deletions_operation_id ON deletions(operation_id)",
            "CREATE INDEX IF NOT EXISTS idx_deletions_s3_key ON deletions(s3_key)",
            "CREATE INDEX IF NOT EXISTS idx_deletions_deleted_at ON deletions(deleted_at)",
            "CREATE INDEX IF NOT EXISTS idx_operations_timestamp ON operations(timestamp)",
        ] {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| S3GcError::Vault(e.to_string()))?;
        }

        Ok(())
    }

    /// Records the start of a GC operation and returns its freshly minted
    /// ULID, which sorts lexicographically in start order.
    pub async fn record_operation(&self, mode: GcMode, stats: &serde_json::Value) -> Result<Ulid> {
        let id = Ulid::new();
        let now = Utc::now();
        sqlx::query("INSERT INTO operations (id, timestamp, mode, stats) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(now)
            .bind(mode_str(mode))
            .bind(stats.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?;
        Ok(id)
    }

    pub async fn complete_operation(
        &self,
        operation_id: Ulid,
        stats: &serde_json::Value,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE operations SET stats = ?, completed_at = ?, error = ? WHERE id = ?")
            .bind(stats.to_string())
            .bind(now)
            .bind(error)
            .bind(operation_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?;
        Ok(())
    }

    /// Records a deletion. MUST be called before the object is actually
    /// removed from the bucket, so a crash after this call but before the
    /// delete still leaves a correct, restorable audit trail. A collision
    /// on `(operation_id, backup_path)` is rejected rather than silently
    /// overwritten.
    pub async fn record_deletion(
        &self,
        operation_id: Ulid,
        s3_key: &str,
        backup_path: &str,
        original_size: i64,
        compressed_size: i64,
        content_hash: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO deletions
                (operation_id, s3_key, backup_path, original_size, compressed_size, content_hash, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(operation_id.to_string())
        .bind(s3_key)
        .bind(backup_path)
        .bind(original_size)
        .bind(compressed_size)
        .bind(content_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                S3GcError::Vault(format!(
                    "backup path collision for operation {operation_id}: {backup_path}"
                ))
            } else {
                S3GcError::Vault(e.to_string())
            }
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Marks a single deletion row restored, identified by its own `id`
    /// rather than by `s3_key` — a key can have more than one unrestored
    /// deletion row (deleted, re-uploaded, deleted again), and only the
    /// specific row whose blob was actually re-uploaded may be marked.
    pub async fn mark_restored(&self, deletion_id: i64, restore_operation_id: Option<Ulid>) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE deletions SET restored_at = ?, restore_operation_id = ? \
             WHERE id = ? AND restored_at IS NULL",
        )
        .bind(now)
        .bind(restore_operation_id.map(|u| u.to_string()))
        .bind(deletion_id)
        .execute(&self.pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_deletion(&self, s3_key: &str) -> Result<Option<DeletionRecord>> {
        sqlx::query_as(
            r#"
            SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
                   content_hash, deleted_at, restored_at, restore_operation_id
            FROM deletions WHERE s3_key = ? ORDER BY deleted_at DESC LIMIT 1
            "#,
        )
        .bind(s3_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))
    }

    pub async fn deletions_by_operation(
        &self,
        operation_id: Ulid,
        include_restored: bool,
    ) -> Result<Vec<DeletionRecord>> {
        let sql = if include_restored {
            r#"
            SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
                   content_hash, deleted_at, restored_at, restore_operation_id
            FROM deletions WHERE operation_id = ? ORDER BY id
            "#
        } else {
            r#"
            SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
                   content_hash, deleted_at, restored_at, restore_operation_id
            FROM deletions WHERE operation_id = ? AND restored_at IS NULL ORDER BY id
            "#
        };
        sqlx::query_as(sql)
            .bind(operation_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))
    }

    pub async fn list_operations(&self, limit: i64, offset: i64) -> Result<Vec<OperationRecord>> {
        sqlx::query_as(
            "SELECT id, timestamp, mode, stats, completed_at, error FROM operations \
             ORDER BY timestamp DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))
    }

    pub async fn search_deletions(&self, like_pattern: &str, limit: i64) -> Result<Vec<DeletionRecord>> {
        sqlx::query_as(
            r#"
            SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
                   content_hash, deleted_at, restored_at, restore_operation_id
            FROM deletions WHERE s3_key LIKE ? ORDER BY deleted_at DESC LIMIT ?
            "#,
        )
        .bind(like_pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))
    }

    pub async fn unrestored_deletions(
        &self,
        older_than_days: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DeletionRecord>> {
        match older_than_days {
            Some(days) => {
                let cutoff = Utc::now() - chrono::Duration::days(days);
                sqlx::query_as(
                    r#"
                    SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
                           content_hash, deleted_at, restored_at, restore_operation_id
                    FROM deletions WHERE restored_at IS NULL AND deleted_at < ?
                    ORDER BY deleted_at DESC LIMIT ?
                    "#,
                )
                .bind(cutoff)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
                           content_hash, deleted_at, restored_at, restore_operation_id
                    FROM deletions WHERE restored_at IS NULL
                    ORDER BY deleted_at DESC LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| S3GcError::Vault(e.to_string()))
    }

    pub async fn vault_stats(&self) -> Result<VaultStats> {
        let (total_operations,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?;

        let (total_deletions, restored_deletions): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN restored_at IS NOT NULL THEN 1 ELSE 0 END), 0) FROM deletions",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?;

        let (original, compressed): (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT SUM(original_size), SUM(compressed_size) FROM deletions")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| S3GcError::Vault(e.to_string()))?;

        let total_original_bytes = original.unwrap_or(0);
        let total_compressed_bytes = compressed.unwrap_or(0);
        let avg_compression_ratio = if total_compressed_bytes > 0 {
            total_original_bytes as f64 / total_compressed_bytes as f64
        } else {
            0.0
        };

        Ok(VaultStats {
            total_operations,
            total_deletions,
            restored_deletions,
            total_original_bytes,
            total_compressed_bytes,
            avg_compression_ratio,
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn mode_str(mode: GcMode) -> &'static str {
    match mode {
        GcMode::DryRun => "dry_run",
        GcMode::AuditOnly => "audit_only",
        GcMode::Execute => "execute",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_and_completes_an_operation() {
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault.record_operation(GcMode::DryRun, &serde_json::json!({})).await.unwrap();
        vault
            .complete_operation(op_id, &serde_json::json!({"deleted": 3}), None)
            .await
            .unwrap();

        let ops = vault.list_operations(10, 0).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn records_a_deletion_before_the_object_is_removed() {
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let deletion_id = vault
            .record_deletion(op_id, "a.jpg", "backups/op/a.jpg.zst", 100, 20, None)
            .await
            .unwrap();
        assert!(deletion_id > 0);

        let record = vault.get_deletion("a.jpg").await.unwrap().unwrap();
        assert_eq!(record.s3_key, "a.jpg");
        assert!(record.restored_at.is_none());
    }

    #[tokio::test]
    async fn duplicate_backup_path_for_same_operation_is_rejected() {
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        vault
            .record_deletion(op_id, "a.jpg", "backups/op/same.zst", 100, 20, None)
            .await
            .unwrap();
        let second = vault
            .record_deletion(op_id, "b.jpg", "backups/op/same.zst", 100, 20, None)
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn mark_restored_is_idempotent_at_the_query_level() {
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let deletion_id = vault
            .record_deletion(op_id, "a.jpg", "backups/op/a.jpg.zst", 100, 20, None)
            .await
            .unwrap();

        assert!(vault.mark_restored(deletion_id, None).await.unwrap());
        assert!(!vault.mark_restored(deletion_id, None).await.unwrap());
    }

    #[tokio::test]
    async fn mark_restored_only_touches_the_targeted_row() {
        let vault = Vault::open_in_memory().await.unwrap();
        let op1 = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let op2 = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();

        let first_deletion = vault
            .record_deletion(op1, "a.jpg", "backups/op1/a.jpg.zst", 100, 20, None)
            .await
            .unwrap();
        let second_deletion = vault
            .record_deletion(op2, "a.jpg", "backups/op2/a.jpg.zst", 100, 20, None)
            .await
            .unwrap();

        assert!(vault.mark_restored(second_deletion, None).await.unwrap());

        let deletions = vault.deletions_by_operation(op1, true).await.unwrap();
        assert_eq!(deletions[0].id, first_deletion);
        assert!(deletions[0].restored_at.is_none(), "op1's row must remain unrestored");

        let deletions = vault.deletions_by_operation(op2, true).await.unwrap();
        assert_eq!(deletions[0].id, second_deletion);
        assert!(deletions[0].restored_at.is_some());
    }

    #[tokio::test]
    async fn vault_stats_computes_compression_ratio() {
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        vault
            .record_deletion(op_id, "a.jpg", "p1", 100, 10, None)
            .await
            .unwrap();
        vault
            .record_deletion(op_id, "b.jpg", "p2", 200, 20, None)
            .await
            .unwrap();

        let stats = vault.vault_stats().await.unwrap();
        assert_eq!(stats.total_deletions, 2);
        assert_eq!(stats.total_original_bytes, 300);
        assert_eq!(stats.total_compressed_bytes, 30);
        assert!((stats.avg_compression_ratio - 10.0).abs() < 1e-9);
    }
}
