//! Backup lifecycle utilities: writing compressed blobs to the vault's
//! on-disk `backups/` tree, archiving an operation's backups into a
//! tarball, pruning old blobs, and verifying a blob's integrity by hash.
//!
//! All file I/O here is local disk under `vault_path`, independent of the
//! audit rows [`crate::vault::Vault`] keeps in SQLite — the two are kept
//! consistent by callers, never by this module.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, S3GcError};

/// Converts an S3 key into a filesystem-safe filename. Lossy by design:
/// the original key lives in the vault's `deletions` row, not in this
/// filename, so nothing needs to parse it back out.
fn sanitize_filename(s3_key: &str) -> String {
    let mut safe: String = s3_key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect();

    if safe.len() > 200 {
        let mut hasher = Sha256::new();
        hasher.update(s3_key.as_bytes());
        let hash = hex_simd::encode_to_string(hasher.finalize(), hex_simd::AsciiCase::Lower);
        let tail: String = safe.chars().rev().take(190).collect::<String>().chars().rev().collect();
        safe = format!("{tail}_{}", &hash[..8]);
    }
    safe
}

/// Writes `compressed_bytes` to `<vault_path>/backups/<operation_id>/<key>.zst`
/// atomically: full write to a `.tmp` sibling, fsync, then rename.
pub async fn write_backup_file(
    vault_path: &Path,
    operation_id: &str,
    s3_key: &str,
    compressed_bytes: &[u8],
) -> Result<PathBuf> {
    let backup_dir = vault_path.join("backups").join(operation_id);
    tokio::fs::create_dir_all(&backup_dir)
        .await
        .map_err(|e| S3GcError::Backup(format!("failed to create backup dir: {e}")))?;

    let backup_path = backup_dir.join(format!("{}.zst", sanitize_filename(s3_key)));
    let temp_path = backup_dir.join(format!("{}.zst.tmp", sanitize_filename(s3_key)));

    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .map_err(|e| S3GcError::Backup(format!("failed to create temp backup file: {e}")))?;
    file.write_all(compressed_bytes)
        .await
        .map_err(|e| S3GcError::Backup(format!("failed to write backup file: {e}")))?;
    file.sync_all()
        .await
        .map_err(|e| S3GcError::Backup(format!("failed to fsync backup file: {e}")))?;
    drop(file);

    tokio::fs::rename(&temp_path, &backup_path)
        .await
        .map_err(|e| S3GcError::Backup(format!("failed to rename backup file into place: {e}")))?;

    Ok(backup_path)
}

pub async fn read_backup_file(backup_path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(backup_path)
        .await
        .map_err(|e| S3GcError::Backup(format!("backup file not found at {}: {e}", backup_path.display())))
}

/// Archives every backup blob for `operation_id` into a single tarball
/// under `<vault_path>/archives`.
pub async fn archive_operation(vault_path: &Path, operation_id: &str, compress: bool) -> Result<PathBuf> {
    let backup_dir = vault_path.join("backups").join(operation_id);
    if !backup_dir.exists() {
        return Err(S3GcError::Backup(format!(
            "no backup directory for operation {operation_id}"
        )));
    }

    let extension = if compress { "tar.gz" } else { "tar" };
    let archives_dir = vault_path.join("archives");
    let tarball_path = archives_dir.join(format!("op_{operation_id}.{extension}"));

    let vault_path = vault_path.to_path_buf();
    let operation_id = operation_id.to_string();
    let result_path = tarball_path.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&archives_dir)
            .map_err(|e| S3GcError::Backup(format!("failed to create archives dir: {e}")))?;

        let file = std::fs::File::create(&result_path)
            .map_err(|e| S3GcError::Backup(format!("failed to create tarball: {e}")))?;

        if compress {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(&operation_id, vault_path.join("backups").join(&operation_id))
                .map_err(|e| S3GcError::Backup(format!("failed to build tarball: {e}")))?;
            builder
                .into_inner()
                .map_err(|e| S3GcError::Backup(format!("failed to finish tarball: {e}")))?
                .finish()
                .map_err(|e| S3GcError::Backup(format!("failed to finish gzip stream: {e}")))?;
        } else {
            let mut builder = tar::Builder::new(file);
            builder
                .append_dir_all(&operation_id, vault_path.join("backups").join(&operation_id))
                .map_err(|e| S3GcError::Backup(format!("failed to build tarball: {e}")))?;
            builder
                .into_inner()
                .map_err(|e| S3GcError::Backup(format!("failed to finish tarball: {e}")))?;
        }
        Ok(())
    })
    .await
    .map_err(|e| S3GcError::Backup(format!("archive task panicked: {e}")))??;

    Ok(tarball_path)
}

/// Extracts a tarball created by [`archive_operation`] into `extract_to`,
/// rejecting any entry that would escape the target directory.
pub async fn extract_archive(tarball_path: &Path, extract_to: &Path) -> Result<PathBuf> {
    let tarball_path = tarball_path.to_path_buf();
    let extract_to = extract_to.to_path_buf();
    let result = extract_to.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&extract_to)
            .map_err(|e| S3GcError::Backup(format!("failed to create extraction dir: {e}")))?;

        let file = std::fs::File::open(&tarball_path)
            .map_err(|e| S3GcError::Backup(format!("failed to open tarball: {e}")))?;
        let is_gzip = tarball_path.extension().and_then(|e| e.to_str()) == Some("gz");

        fn extract_entries<R: std::io::Read>(
            archive: &mut tar::Archive<R>,
            extract_to: &Path,
        ) -> Result<()> {
            let entries = archive
                .entries()
                .map_err(|e| S3GcError::Backup(format!("failed to read tarball entries: {e}")))?;
            for entry in entries {
                let mut entry = entry.map_err(|e| S3GcError::Backup(format!("bad tarball entry: {e}")))?;
                let path = entry.path().map_err(|e| S3GcError::Backup(e.to_string()))?;
                if path.is_absolute() || path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                    return Err(S3GcError::Backup(format!(
                        "unsafe path in tarball: {}",
                        path.display()
                    )));
                }
                entry
                    .unpack_in(extract_to)
                    .map_err(|e| S3GcError::Backup(format!("failed to extract entry: {e}")))?;
            }
            Ok(())
        }

        if is_gzip {
            let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
            extract_entries(&mut archive, &extract_to)?;
        } else {
            let mut archive = tar::Archive::new(file);
            extract_entries(&mut archive, &extract_to)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| S3GcError::Backup(format!("extraction task panicked: {e}")))??;

    Ok(result)
}

#[derive(Debug, Default, serde::Serialize)]
pub struct BackupStats {
    pub backup_files: u64,
    pub backup_bytes: u64,
    pub archive_files: u64,
    pub archive_bytes: u64,
    pub operation_count: u64,
}

pub async fn backup_stats(vault_path: &Path) -> Result<BackupStats> {
    let mut stats = BackupStats::default();
    let backups_dir = vault_path.join("backups");

    if backups_dir.exists() {
        let mut ops = tokio::fs::read_dir(&backups_dir)
            .await
            .map_err(|e| S3GcError::Backup(e.to_string()))?;
        while let Some(entry) = ops.next_entry().await.map_err(|e| S3GcError::Backup(e.to_string()))? {
            if entry.path().is_dir() {
                stats.operation_count += 1;
                let mut files = tokio::fs::read_dir(entry.path())
                    .await
                    .map_err(|e| S3GcError::Backup(e.to_string()))?;
                while let Some(file) = files.next_entry().await.map_err(|e| S3GcError::Backup(e.to_string()))? {
                    if file.path().extension().and_then(|e| e.to_str()) == Some("zst") {
                        stats.backup_files += 1;
                        stats.backup_bytes += file
                            .metadata()
                            .await
                            .map_err(|e| S3GcError::Backup(e.to_string()))?
                            .len();
                    }
                }
            }
        }
    }

    let archives_dir = vault_path.join("archives");
    if archives_dir.exists() {
        let mut entries = tokio::fs::read_dir(&archives_dir)
            .await
            .map_err(|e| S3GcError::Backup(e.to_string()))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| S3GcError::Backup(e.to_string()))? {
            let name = entry.file_name();
            if name.to_string_lossy().contains(".tar") {
                stats.archive_files += 1;
                stats.archive_bytes += entry
                    .metadata()
                    .await
                    .map_err(|e| S3GcError::Backup(e.to_string()))?
                    .len();
            }
        }
    }

    Ok(stats)
}

/// Deletes backup blobs older than `max_age_days`, then removes any
/// operation directory left empty. Returns `(files_deleted, bytes_freed)`.
pub async fn prune_old_backups(vault_path: &Path, max_age_days: i64, dry_run: bool) -> Result<(u64, u64)> {
    let cutoff = std::time::SystemTime::now() - std::time::Duration::from_secs((max_age_days.max(0) as u64) * 86400);
    let backups_dir = vault_path.join("backups");
    if !backups_dir.exists() {
        return Ok((0, 0));
    }

    let mut files_deleted = 0u64;
    let mut bytes_freed = 0u64;
    let mut op_dirs = Vec::new();

    let mut ops = tokio::fs::read_dir(&backups_dir)
        .await
        .map_err(|e| S3GcError::Backup(e.to_string()))?;
    while let Some(op_entry) = ops.next_entry().await.map_err(|e| S3GcError::Backup(e.to_string()))? {
        if !op_entry.path().is_dir() {
            continue;
        }
        op_dirs.push(op_entry.path());

        let mut files = tokio::fs::read_dir(op_entry.path())
            .await
            .map_err(|e| S3GcError::Backup(e.to_string()))?;
        while let Some(file_entry) = files.next_entry().await.map_err(|e| S3GcError::Backup(e.to_string()))? {
            let path = file_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zst") {
                continue;
            }
            let metadata = match file_entry.metadata().await {
                Ok(m) => m,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "prune_file_error");
                    continue;
                }
            };
            let modified = metadata.modified().unwrap_or(std::time::SystemTime::now());
            if modified < cutoff {
                let size = metadata.len();
                if !dry_run {
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        tracing::warn!(path = %path.display(), error = %err, "prune_file_error");
                        continue;
                    }
                }
                files_deleted += 1;
                bytes_freed += size;
            }
        }
    }

    if !dry_run {
        for dir in op_dirs {
            if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
                if entries.next_entry().await.ok().flatten().is_none() {
                    let _ = tokio::fs::remove_dir(&dir).await;
                }
            }
        }
    }

    Ok((files_deleted, bytes_freed))
}

/// Verifies a backup blob's integrity. When `expected_hash` is given, does
/// an exact hash comparison; otherwise falls back to confirming the blob
/// is at least decodable by [`crate::compress::decompress_backup`].
pub async fn verify_integrity(backup_path: &Path, expected_hash: Option<&str>) -> Result<(bool, String)> {
    let content = read_backup_file(backup_path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    let actual_hash = hex_simd::encode_to_string(hasher.finalize(), hex_simd::AsciiCase::Lower);

    let is_valid = if let Some(expected) = expected_hash {
        actual_hash == expected
    } else {
        crate::compress::decompress_backup(content).await.is_ok()
    };

    Ok((is_valid, actual_hash))
}

pub fn calculate_backup_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_simd::encode_to_string(hasher.finalize(), hex_simd::AsciiCase::Lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_reads_back_a_backup_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_backup_file(dir.path(), "op1", "avatars/a.jpg", b"compressed-bytes")
            .await
            .unwrap();
        assert!(path.exists());
        let content = read_backup_file(&path).await.unwrap();
        assert_eq!(content, b"compressed-bytes");
    }

    #[tokio::test]
    async fn sanitizes_keys_with_path_separators() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_backup_file(dir.path(), "op1", "a/b/c.jpg", b"data").await.unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("a_b_c.jpg"));
    }

    #[tokio::test]
    async fn archives_and_extracts_an_operation() {
        let dir = tempfile::tempdir().unwrap();
        write_backup_file(dir.path(), "op1", "a.jpg", b"hello").await.unwrap();
        write_backup_file(dir.path(), "op1", "b.jpg", b"world").await.unwrap();

        let tarball = archive_operation(dir.path(), "op1", true).await.unwrap();
        assert!(tarball.exists());

        let extract_dir = dir.path().join("extracted");
        let extracted = extract_archive(&tarball, &extract_dir).await.unwrap();
        assert!(extracted.join("op1").join("a.jpg.zst").exists());
    }

    #[tokio::test]
    async fn does_not_prune_fresh_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_backup_file(dir.path(), "op1", "a.jpg", b"data").await.unwrap();

        let (deleted, freed) = prune_old_backups(dir.path(), 30, false).await.unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(freed, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn reports_backup_stats() {
        let dir = tempfile::tempdir().unwrap();
        write_backup_file(dir.path(), "op1", "a.jpg", b"data").await.unwrap();
        write_backup_file(dir.path(), "op1", "b.jpg", b"more-data").await.unwrap();

        let stats = backup_stats(dir.path()).await.unwrap();
        assert_eq!(stats.operation_count, 1);
        assert_eq!(stats.backup_files, 2);
        assert_eq!(stats.backup_bytes, 4 + 9);
    }

    #[tokio::test]
    async fn verifies_integrity_against_an_expected_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_backup_file(dir.path(), "op1", "a.jpg", b"data").await.unwrap();
        let expected = calculate_backup_hash(b"data");

        let (valid, hash) = verify_integrity(&path, Some(&expected)).await.unwrap();
        assert!(valid);
        assert_eq!(hash, expected);

        let (invalid, _) = verify_integrity(&path, Some("deadbeef")).await.unwrap();
        assert!(!invalid);
    }
}
