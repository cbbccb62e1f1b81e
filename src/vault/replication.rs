//! One-way, idempotent replication of the vault's tables to a remote
//! Postgres database, and of backup blobs to a remote S3 bucket. Both are
//! catch-up syncs: safe to run repeatedly, never removes anything on the
//! remote side.

use std::path::Path;

use sqlx::{PgPool, SqlitePool};

use crate::error::{Result, S3GcError};
use crate::s3::ObjectStore;

#[derive(Debug, Default, serde::Serialize)]
pub struct PostgresReplicationStats {
    pub operations_synced: u64,
    pub deletions_synced: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BackupReplicationStats {
    pub files_synced: u64,
    pub bytes_synced: u64,
    pub errors: Vec<String>,
}

async fn ensure_postgres_tables(conn: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS s3gc_operations (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            mode TEXT NOT NULL,
            stats TEXT NOT NULL,
            completed_at TEXT,
            error TEXT
        )
        "#,
    )
    .execute(conn)
    .await
    .map_err(|e| S3GcError::Vault(e.to_string()))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS s3gc_deletions (
            id BIGINT PRIMARY KEY,
            operation_id TEXT NOT NULL,
            s3_key TEXT NOT NULL,
            backup_path TEXT NOT NULL,
            original_size BIGINT NOT NULL,
            compressed_size BIGINT NOT NULL,
            content_hash TEXT,
            deleted_at TEXT NOT NULL,
            restored_at TEXT,
            restore_operation_id TEXT,
            FOREIGN KEY (operation_id) REFERENCES s3gc_operations(id)
        )
        "#,
    )
    .execute(conn)
    .await
    .map_err(|e| S3GcError::Vault(e.to_string()))?;

    Ok(())
}

/// Replicates the local vault's `operations` and `deletions` tables into a
/// remote Postgres database via `INSERT ... ON CONFLICT(id) DO UPDATE`.
/// Per-row failures are collected, not fatal: one bad row never blocks the
/// rest of the batch.
pub async fn replicate_to_postgres(
    local_pool: &SqlitePool,
    remote: &PgPool,
) -> Result<PostgresReplicationStats> {
    ensure_postgres_tables(remote).await?;
    let mut stats = PostgresReplicationStats::default();

    let operations: Vec<(String, String, String, String, Option<String>, Option<String>)> =
        sqlx::query_as(
            "SELECT id, timestamp, mode, stats, completed_at, error FROM operations",
        )
        .fetch_all(local_pool)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?;

    for (id, timestamp, mode, row_stats, completed_at, error) in operations {
        let result = sqlx::query(
            r#"
            INSERT INTO s3gc_operations (id, timestamp, mode, stats, completed_at, error)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                stats = EXCLUDED.stats,
                completed_at = EXCLUDED.completed_at,
                error = EXCLUDED.error
            "#,
        )
        .bind(&id)
        .bind(&timestamp)
        .bind(&mode)
        .bind(&row_stats)
        .bind(&completed_at)
        .bind(&error)
        .execute(remote)
        .await;

        match result {
            Ok(_) => stats.operations_synced += 1,
            Err(e) => stats.errors.push(format!("operation {id}: {e}")),
        }
    }

    #[allow(clippy::type_complexity)]
    let deletions: Vec<(
        i64,
        String,
        String,
        String,
        i64,
        i64,
        Option<String>,
        String,
        Option<String>,
        Option<String>,
    )> = sqlx::query_as(
        r#"
        SELECT id, operation_id, s3_key, backup_path, original_size, compressed_size,
               content_hash, deleted_at, restored_at, restore_operation_id
        FROM deletions
        "#,
    )
    .fetch_all(local_pool)
    .await
    .map_err(|e| S3GcError::Vault(e.to_string()))?;

    for d in deletions {
        let result = sqlx::query(
            r#"
            INSERT INTO s3gc_deletions
                (id, operation_id, s3_key, backup_path, original_size, compressed_size,
                 content_hash, deleted_at, restored_at, restore_operation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                restored_at = EXCLUDED.restored_at,
                restore_operation_id = EXCLUDED.restore_operation_id
            "#,
        )
        .bind(d.0)
        .bind(&d.1)
        .bind(&d.2)
        .bind(&d.3)
        .bind(d.4)
        .bind(d.5)
        .bind(&d.6)
        .bind(&d.7)
        .bind(&d.8)
        .bind(&d.9)
        .execute(remote)
        .await;

        match result {
            Ok(_) => stats.deletions_synced += 1,
            Err(e) => stats.errors.push(format!("deletion {}: {e}", d.0)),
        }
    }

    Ok(stats)
}

/// Replicates local backup blob files under `<vault_path>/backups` to a
/// remote bucket, skipping any file whose remote copy already has the same
/// size. Bounded to `max_concurrent` simultaneous uploads.
pub async fn replicate_backups_to_s3(
    vault_path: &Path,
    store: &dyn ObjectStore,
    remote_prefix: &str,
    max_concurrent: usize,
) -> Result<BackupReplicationStats> {
    let backups_dir = vault_path.join("backups");
    if !backups_dir.exists() {
        return Ok(BackupReplicationStats::default());
    }

    let mut files = Vec::new();
    let mut walker = vec![backups_dir.clone()];
    while let Some(dir) = walker.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| S3GcError::Vault(e.to_string()))?
        {
            let path = entry.path();
            if path.is_dir() {
                walker.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }

    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(max_concurrent));
    let results = futures::future::join_all(files.into_iter().map(|path| {
        let semaphore = semaphore.clone();
        let vault_path = vault_path.to_path_buf();
        let remote_prefix = remote_prefix.to_string();
        async move {
            let _permit = semaphore.acquire().await.unwrap();
            upload_one(&vault_path, &path, &remote_prefix, store).await
        }
    }))
    .await;

    let mut stats = BackupReplicationStats::default();
    for result in results {
        match result {
            Ok(Some(bytes)) => {
                stats.files_synced += 1;
                stats.bytes_synced += bytes;
            }
            Ok(None) => {}
            Err(e) => stats.errors.push(e.to_string()),
        }
    }
    Ok(stats)
}

async fn upload_one(
    vault_path: &Path,
    local_path: &Path,
    remote_prefix: &str,
    store: &dyn ObjectStore,
) -> Result<Option<u64>> {
    let relative = local_path
        .strip_prefix(vault_path)
        .map_err(|e| S3GcError::Vault(e.to_string()))?;
    let remote_key = format!("{remote_prefix}{}", relative.display());

    let local_size = tokio::fs::metadata(local_path)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?
        .len();

    if let Ok(Some(remote_size)) = store.head_size(&remote_key).await {
        if remote_size == local_size {
            return Ok(None);
        }
    }

    let content = tokio::fs::read(local_path)
        .await
        .map_err(|e| S3GcError::Vault(e.to_string()))?;
    store.put(&remote_key, content.clone().into()).await?;
    Ok(Some(content.len() as u64))
}
