//! Backup/Delete Executor: the only place in the crate allowed to delete
//! an object from the bucket. Enforces a strict five-step order — steps 3
//! and 4 (atomic backup write, vault row) must both land before step 5
//! (the actual delete) — so a crash mid-sequence never loses data.

use ulid::Ulid;

use crate::compress;
use crate::config::Config;
use crate::error::{Result, S3GcError};
use crate::s3::ObjectStore;
use crate::vault::Vault;

#[derive(Debug, Clone)]
pub struct BackupDeleteOutcome {
    pub s3_key: String,
    pub backup_path: String,
    pub original_size: i64,
    pub compressed_size: i64,
}

/// Downloads, compresses, durably backs up, records the deletion, then
/// deletes `s3_key` from the store. Never reorders these steps: the vault
/// row for the deletion exists before the object is removed, so a crash
/// here leaves a recoverable trail rather than a silent data loss.
pub async fn backup_and_delete(
    config: &Config,
    store: &dyn ObjectStore,
    vault: &Vault,
    operation_id: Ulid,
    s3_key: &str,
) -> Result<BackupDeleteOutcome> {
    // Step 1: download.
    let original_bytes = store.get(s3_key).await?;
    let original_size = original_bytes.len() as i64;

    // Step 2: compress.
    let compressed_bytes = if config.compress_backups {
        compress::compress_for_backup(
            s3_key,
            original_bytes,
            config.zstd_level,
            true,
            config.max_image_dim,
            config.jpeg_quality,
        )
        .await?
    } else {
        original_bytes.to_vec()
    };
    let compressed_size = compressed_bytes.len() as i64;

    // Step 3: durable backup write, atomic rename into place.
    let backup_path = crate::backup::write_backup_file(
        &config.vault_path,
        &operation_id.to_string(),
        s3_key,
        &compressed_bytes,
    )
    .await?;

    // Step 4: record the deletion in the vault before anything is removed
    // from the object store.
    vault
        .record_deletion(
            operation_id,
            s3_key,
            &backup_path.to_string_lossy(),
            original_size,
            compressed_size,
            None,
        )
        .await
        .map_err(|e| S3GcError::Vault(format!("failed to record deletion for {s3_key}: {e}")))?;

    // Step 5: only now delete from the object store.
    store.delete(s3_key).await?;

    Ok(BackupDeleteOutcome {
        s3_key: s3_key.to_string(),
        backup_path: backup_path.to_string_lossy().to_string(),
        original_size,
        compressed_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::FakeObjectStore;
    use bytes::Bytes;

    #[tokio::test]
    async fn backs_up_and_deletes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            vault_path: dir.path().to_path_buf(),
            compress_backups: true,
            ..Config::default()
        }
        .try_new()
        .unwrap();

        let store = FakeObjectStore::new();
        store.seed("avatars/a.jpg", Bytes::from_static(b"raw image bytes")).await;
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault
            .record_operation(config.mode, &serde_json::json!({}))
            .await
            .unwrap();

        let outcome = backup_and_delete(&config, &store, &vault, op_id, "avatars/a.jpg")
            .await
            .unwrap();

        assert_eq!(outcome.original_size, 16);
        assert!(!store.contains("avatars/a.jpg").await);

        let record = vault.get_deletion("avatars/a.jpg").await.unwrap().unwrap();
        assert_eq!(record.s3_key, "avatars/a.jpg");
        assert!(std::path::Path::new(&record.backup_path).exists());
    }

    #[tokio::test]
    async fn leaves_object_intact_when_the_vault_record_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            vault_path: dir.path().to_path_buf(),
            compress_backups: false,
            ..Config::default()
        }
        .try_new()
        .unwrap();

        let store = FakeObjectStore::new();
        store.seed("a.jpg", Bytes::from_static(b"data")).await;
        let vault = Vault::open_in_memory().await.unwrap();
        let op_id = vault
            .record_operation(config.mode, &serde_json::json!({}))
            .await
            .unwrap();

        // Pre-insert a deletion row at the exact backup path the executor
        // will compute for "a.jpg" under this operation, forcing the
        // UNIQUE(operation_id, backup_path) constraint to reject step 4.
        let predicted_path = dir
            .path()
            .join("backups")
            .join(op_id.to_string())
            .join("a.jpg.zst");
        vault
            .record_deletion(op_id, "other.jpg", &predicted_path.to_string_lossy(), 1, 1, None)
            .await
            .unwrap();

        let result = backup_and_delete(&config, &store, &vault, op_id, "a.jpg").await;
        assert!(result.is_err());
        assert!(store.contains("a.jpg").await, "object must survive a failed vault write");
    }
}
