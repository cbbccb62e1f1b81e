//! Point-in-time restore: reversing a previous deletion by reading its
//! backup blob back out of the vault and re-uploading it to the bucket.

use std::path::Path;

use ulid::Ulid;

use crate::config::Config;
use crate::error::Result;
use crate::s3::ObjectStore;
use crate::vault::Vault;

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct RestoreResult {
    pub operation_id: String,
    pub restored_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<String>,
    pub dry_run: bool,
    pub restored_keys: Vec<String>,
    pub failed_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
    pub duration_seconds: f64,
}

/// Restores a single key from its already-located backup file, then marks
/// the specific deletion row restored by its `id` (never by `s3_key` alone
/// — a key can have more than one unrestored deletion row). The restore ID
/// is only for log correlation: unlike a GC operation, a restore never
/// gets its own vault `operations` row.
async fn restore_single_object(
    vault: &Vault,
    store: &dyn ObjectStore,
    s3_key: &str,
    deletion_id: i64,
    backup_path: &Path,
    restore_operation_id: Ulid,
) -> Result<()> {
    let compressed_bytes = crate::backup::read_backup_file(backup_path).await?;
    let original_bytes = crate::compress::decompress_backup(compressed_bytes).await?;
    store.put(s3_key, original_bytes.into()).await?;
    vault.mark_restored(deletion_id, Some(restore_operation_id)).await?;
    Ok(())
}

/// Restores every unrestored deletion recorded for `operation_id`.
/// `skip_existing` avoids clobbering an object that was independently
/// re-uploaded to the bucket after the GC cycle that deleted it.
pub async fn restore_operation(
    _config: &Config,
    vault: &Vault,
    store: &dyn ObjectStore,
    operation_id: Ulid,
    dry_run: bool,
    skip_existing: bool,
) -> Result<RestoreResult> {
    let start = chrono::Utc::now();
    let restore_op_id = Ulid::new();
    tracing::info!(operation_id = %operation_id, %restore_op_id, dry_run, "restore_operation_started");

    let deletions = vault.deletions_by_operation(operation_id, false).await?;
    if deletions.is_empty() {
        tracing::warn!(operation_id = %operation_id, "no_deletions_found");
        return Ok(RestoreResult {
            operation_id: operation_id.to_string(),
            errors: vec!["no unrestored deletions found for this operation".to_string()],
            dry_run,
            ..Default::default()
        });
    }

    let mut result = RestoreResult {
        operation_id: operation_id.to_string(),
        dry_run,
        ..Default::default()
    };

    for deletion in deletions {
        let s3_key = deletion.s3_key.clone();

        if skip_existing {
            match store.head(&s3_key).await {
                Ok(Some(_)) => {
                    result.skipped_count += 1;
                    result.skipped_keys.push(s3_key);
                    continue;
                }
                Ok(None) => {}
                Err(_) => {}
            }
        }

        if dry_run {
            result.restored_count += 1;
            result.restored_keys.push(s3_key);
            continue;
        }

        let backup_path = Path::new(&deletion.backup_path);
        match restore_single_object(vault, store, &s3_key, deletion.id, backup_path, restore_op_id).await {
            Ok(()) => {
                result.restored_count += 1;
                result.restored_keys.push(s3_key);
            }
            Err(e) => {
                result.errors.push(format!("{s3_key}: {e}"));
                result.failed_count += 1;
                result.failed_keys.push(s3_key);
            }
        }
    }

    result.duration_seconds = (chrono::Utc::now() - start).num_milliseconds() as f64 / 1000.0;
    tracing::info!(
        operation_id = %operation_id,
        restored = result.restored_count,
        failed = result.failed_count,
        skipped = result.skipped_count,
        "restore_operation_completed"
    );
    Ok(result)
}

/// Restores the most recent unrestored deletion for a single key.
pub async fn restore_key(vault: &Vault, store: &dyn ObjectStore, s3_key: &str, dry_run: bool) -> Result<RestoreResult> {
    let restore_op_id = Ulid::new();

    let deletion = match vault.get_deletion(s3_key).await? {
        Some(d) => d,
        None => {
            return Ok(RestoreResult {
                operation_id: restore_op_id.to_string(),
                errors: vec![format!("no deletion record found for {s3_key}")],
                dry_run,
                ..Default::default()
            })
        }
    };

    if deletion.restored_at.is_some() {
        return Ok(RestoreResult {
            operation_id: restore_op_id.to_string(),
            skipped_count: 1,
            skipped_keys: vec![s3_key.to_string()],
            dry_run,
            ..Default::default()
        });
    }

    if dry_run {
        return Ok(RestoreResult {
            operation_id: restore_op_id.to_string(),
            restored_count: 1,
            restored_keys: vec![s3_key.to_string()],
            dry_run,
            ..Default::default()
        });
    }

    let backup_path = Path::new(&deletion.backup_path);
    match restore_single_object(vault, store, s3_key, deletion.id, backup_path, restore_op_id).await {
        Ok(()) => Ok(RestoreResult {
            operation_id: restore_op_id.to_string(),
            restored_count: 1,
            restored_keys: vec![s3_key.to_string()],
            dry_run,
            ..Default::default()
        }),
        Err(e) => Ok(RestoreResult {
            operation_id: restore_op_id.to_string(),
            failed_count: 1,
            failed_keys: vec![s3_key.to_string()],
            errors: vec![e.to_string()],
            dry_run,
            ..Default::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcMode;
    use crate::s3::FakeObjectStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn restores_a_deleted_object_from_backup() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open_in_memory().await.unwrap();
        let store = FakeObjectStore::new();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            vault_path: dir.path().to_path_buf(),
            ..Config::default()
        }
        .try_new()
        .unwrap();

        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let compressed = crate::compress::compress_for_backup("a.jpg", Bytes::from_static(b"original"), 19, false, 1024, 60)
            .await
            .unwrap();
        let backup_path = crate::backup::write_backup_file(dir.path(), &op_id.to_string(), "a.jpg", &compressed)
            .await
            .unwrap();
        vault
            .record_deletion(op_id, "a.jpg", &backup_path.to_string_lossy(), 8, compressed.len() as i64, None)
            .await
            .unwrap();

        let result = restore_operation(&config, &vault, &store, op_id, false, true).await.unwrap();
        assert_eq!(result.restored_count, 1);
        assert_eq!(store.get("a.jpg").await.unwrap(), Bytes::from_static(b"original"));

        let deletion = vault.get_deletion("a.jpg").await.unwrap().unwrap();
        assert!(deletion.restored_at.is_some());
    }

    #[tokio::test]
    async fn skips_keys_that_already_exist_in_the_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open_in_memory().await.unwrap();
        let store = FakeObjectStore::new();
        store.seed("a.jpg", Bytes::from_static(b"already there")).await;
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            vault_path: dir.path().to_path_buf(),
            ..Config::default()
        }
        .try_new()
        .unwrap();

        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        vault
            .record_deletion(op_id, "a.jpg", "irrelevant.zst", 8, 8, None)
            .await
            .unwrap();

        let result = restore_operation(&config, &vault, &store, op_id, false, true).await.unwrap();
        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.restored_count, 0);
    }

    #[tokio::test]
    async fn reports_nothing_to_restore_for_an_unknown_operation() {
        let vault = Vault::open_in_memory().await.unwrap();
        let store = FakeObjectStore::new();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            ..Config::default()
        }
        .try_new()
        .unwrap();

        let result = restore_operation(&config, &vault, &store, Ulid::new(), false, true).await.unwrap();
        assert!(!result.errors.is_empty());
    }

    #[tokio::test]
    async fn restore_key_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open_in_memory().await.unwrap();
        let store = FakeObjectStore::new();

        let op_id = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let compressed = crate::compress::compress_for_backup("a.jpg", Bytes::from_static(b"x"), 19, false, 1024, 60)
            .await
            .unwrap();
        let backup_path = crate::backup::write_backup_file(dir.path(), &op_id.to_string(), "a.jpg", &compressed)
            .await
            .unwrap();
        vault
            .record_deletion(op_id, "a.jpg", &backup_path.to_string_lossy(), 1, compressed.len() as i64, None)
            .await
            .unwrap();

        let first = restore_key(&vault, &store, "a.jpg", false).await.unwrap();
        assert_eq!(first.restored_count, 1);

        let second = restore_key(&vault, &store, "a.jpg", false).await.unwrap();
        assert_eq!(second.skipped_count, 1);
    }

    #[tokio::test]
    async fn restoring_one_operation_does_not_mark_a_different_operations_deletion_restored() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open_in_memory().await.unwrap();
        let store = FakeObjectStore::new();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            vault_path: dir.path().to_path_buf(),
            ..Config::default()
        }
        .try_new()
        .unwrap();

        // Same key deleted twice across two separate operations (deleted,
        // re-uploaded/re-referenced, then deleted again), neither restored yet.
        let op1 = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let compressed = crate::compress::compress_for_backup("a.jpg", Bytes::from_static(b"first"), 19, false, 1024, 60)
            .await
            .unwrap();
        let backup_path_1 = crate::backup::write_backup_file(dir.path(), &op1.to_string(), "a.jpg", &compressed)
            .await
            .unwrap();
        vault
            .record_deletion(op1, "a.jpg", &backup_path_1.to_string_lossy(), 5, compressed.len() as i64, None)
            .await
            .unwrap();

        let op2 = vault.record_operation(GcMode::Execute, &serde_json::json!({})).await.unwrap();
        let compressed = crate::compress::compress_for_backup("a.jpg", Bytes::from_static(b"second"), 19, false, 1024, 60)
            .await
            .unwrap();
        let backup_path_2 = crate::backup::write_backup_file(dir.path(), &op2.to_string(), "a.jpg", &compressed)
            .await
            .unwrap();
        vault
            .record_deletion(op2, "a.jpg", &backup_path_2.to_string_lossy(), 6, compressed.len() as i64, None)
            .await
            .unwrap();

        let result = restore_operation(&config, &vault, &store, op2, false, false).await.unwrap();
        assert_eq!(result.restored_count, 1);

        let op1_deletions = vault.deletions_by_operation(op1, true).await.unwrap();
        assert!(
            op1_deletions[0].restored_at.is_none(),
            "op1's unrestored deletion row for the same key must not be touched by restoring op2"
        );
        let op2_deletions = vault.deletions_by_operation(op2, true).await.unwrap();
        assert!(op2_deletions[0].restored_at.is_some());
    }
}
