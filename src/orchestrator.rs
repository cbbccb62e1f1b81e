//! The main GC cycle: list, find candidates, verify, then (mode
//! permitting) back up and delete. One call to [`run_cycle`] is one
//! operation, and it either completes with a [`GcResult`] or leaves the
//! runtime's `last_error` set without ever leaving the vault in a state
//! that loses track of a deletion it already made.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use ulid::Ulid;

use crate::config::{Config, GcMode};
use crate::error::Result;
use crate::executor;
use crate::runtime::RuntimeState;
use crate::verify::{self, LiveDbProbe, VerifyOutcome};

#[derive(Debug, Clone, serde::Serialize)]
pub struct GcResult {
    pub operation_id: String,
    pub mode: String,
    pub total_scanned: usize,
    pub candidates_found: usize,
    pub verified_orphans: usize,
    pub deleted_count: usize,
    pub backed_up_count: usize,
    pub errors: Vec<String>,
    pub duration_seconds: f64,
    pub deleted_keys: Vec<String>,
    pub skipped_keys: Vec<String>,
}

fn mode_str(mode: GcMode) -> &'static str {
    match mode {
        GcMode::DryRun => "dry_run",
        GcMode::AuditOnly => "audit_only",
        GcMode::Execute => "execute",
    }
}

/// Runs one full garbage collection cycle against `state` per `config`.
/// `live_db` is the L2 probe (absent when no CDC backend is configured).
pub async fn run_cycle(
    config: &Config,
    state: &RuntimeState,
    live_db: Option<&dyn LiveDbProbe>,
) -> Result<GcResult> {
    let operation_id = Ulid::new();
    let start = Utc::now();
    tracing::info!(operation_id = %operation_id, mode = ?config.mode, "gc_cycle_started");

    let result = run_cycle_inner(config, state, live_db, operation_id, start).await;

    match &result {
        Ok(r) => {
            state.record_run(r.deleted_count as u64, r.backed_up_count as u64);
            state.set_last_run_at(Utc::now()).await;
            state.set_last_error(None).await;
        }
        Err(e) => {
            state.set_last_error(Some(e.to_string())).await;
        }
    }

    result
}

async fn run_cycle_inner(
    config: &Config,
    state: &RuntimeState,
    live_db: Option<&dyn LiveDbProbe>,
    operation_id: Ulid,
    start: chrono::DateTime<Utc>,
) -> Result<GcResult> {
    // Step 1: list every object in the bucket.
    let s3_keys = state.store.list_keys("").await?;
    tracing::info!(total = s3_keys.len(), "objects_listed");

    // Step 2: find orphan candidates via the registry.
    let candidates = state.registry.orphan_candidates(&s3_keys).await?;
    tracing::info!(count = candidates.len(), "candidates_found");

    // Step 3: multi-layer verification, bounded concurrency.
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops));
    let verifications = join_all(candidates.iter().map(|key| {
        let semaphore = semaphore.clone();
        let key = key.clone();
        async move {
            let _permit = semaphore.acquire().await.unwrap();
            let outcome = verify::verify_orphan(config, &state.registry, live_db, state.store.as_ref(), &key).await;
            (key, outcome)
        }
    }))
    .await;

    let mut verified_orphans = Vec::new();
    let mut skipped_keys = Vec::new();
    let mut errors = Vec::new();

    for (key, outcome) in verifications {
        match outcome {
            Ok(VerifyOutcome::Orphan) => verified_orphans.push(key),
            Ok(VerifyOutcome::Rejected(reason)) => {
                tracing::debug!(s3_key = %key, reason = %reason, "verification_failed");
                skipped_keys.push(key);
            }
            Err(e) => errors.push(format!("{key}: {e}")),
        }
    }
    tracing::info!(count = verified_orphans.len(), "orphans_verified");

    // Step 4: mode-dependent dispatch.
    let mut deleted_count = 0usize;
    let mut backed_up_count = 0usize;
    let mut deleted_keys = Vec::new();

    match config.mode {
        GcMode::Execute => {
            state
                .vault
                .record_operation(
                    config.mode,
                    &serde_json::json!({
                        "candidates": candidates.len(),
                        "verified": verified_orphans.len(),
                    }),
                )
                .await?;

            for key in &verified_orphans {
                match executor::backup_and_delete(config, state.store.as_ref(), &state.vault, operation_id, key).await {
                    Ok(_) => {
                        deleted_count += 1;
                        backed_up_count += 1;
                        deleted_keys.push(key.clone());
                    }
                    Err(e) => {
                        errors.push(format!("{key}: {e}"));
                        tracing::error!(s3_key = %key, error = %e, "backup_delete_failed");
                    }
                }
            }

            state
                .vault
                .complete_operation(
                    operation_id,
                    &serde_json::json!({"deleted": deleted_count, "backed_up": backed_up_count}),
                    None,
                )
                .await?;
        }
        GcMode::AuditOnly => {
            state
                .vault
                .record_operation(
                    config.mode,
                    &serde_json::json!({
                        "candidates": candidates.len(),
                        "verified": verified_orphans.len(),
                        "would_delete": verified_orphans,
                    }),
                )
                .await?;
        }
        GcMode::DryRun => {}
    }

    let duration = (Utc::now() - start).num_milliseconds() as f64 / 1000.0;

    let result = GcResult {
        operation_id: operation_id.to_string(),
        mode: mode_str(config.mode).to_string(),
        total_scanned: s3_keys.len(),
        candidates_found: candidates.len(),
        verified_orphans: verified_orphans.len(),
        deleted_count,
        backed_up_count,
        errors,
        duration_seconds: duration,
        deleted_keys,
        skipped_keys,
    };

    tracing::info!(
        operation_id = %operation_id,
        deleted = deleted_count,
        backed_up = backed_up_count,
        duration = duration,
        "gc_cycle_completed"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcMode;
    use crate::registry::Registry;
    use crate::s3::{FakeObjectStore, ObjectStore};
    use crate::vault::Vault;
    use bytes::Bytes;
    use chrono::Duration;
    use std::sync::Arc;

    async fn test_state(vault_path: std::path::PathBuf) -> (RuntimeState, Arc<FakeObjectStore>) {
        let registry = Registry::open_in_memory().await.unwrap();
        let vault = Vault::open_in_memory().await.unwrap();
        let fake = Arc::new(FakeObjectStore::new());
        let store: Arc<dyn ObjectStore> = fake.clone();
        let state = RuntimeState::for_test(registry, vault, store, vault_path);
        (state, fake)
    }

    #[tokio::test]
    async fn dry_run_never_deletes_anything() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            mode: GcMode::DryRun,
            vault_path: dir.path().to_path_buf(),
            retention_days: 0,
            ..Config::default()
        }
        .try_new()
        .unwrap();
        let (state, fake) = test_state(dir.path().to_path_buf()).await;

        let old = Utc::now() - Duration::days(30);
        fake.seed_with_age("orphan.jpg", Bytes::from_static(b"data"), old).await;

        let result = run_cycle(&config, &state, None).await.unwrap();
        assert_eq!(result.deleted_count, 0);
        assert_eq!(result.verified_orphans, 1);
    }

    #[tokio::test]
    async fn execute_mode_deletes_verified_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            mode: GcMode::Execute,
            vault_path: dir.path().to_path_buf(),
            retention_days: 0,
            ..Config::default()
        }
        .try_new()
        .unwrap();
        let (state, fake) = test_state(dir.path().to_path_buf()).await;

        let old = Utc::now() - Duration::days(30);
        fake.seed_with_age("orphan.jpg", Bytes::from_static(b"data"), old).await;

        let result = run_cycle(&config, &state, None).await.unwrap();
        assert_eq!(result.deleted_count, 1);
        assert_eq!(result.deleted_keys, vec!["orphan.jpg".to_string()]);

        let metrics = state.metrics().await.unwrap();
        assert_eq!(metrics.total_deleted, 1);
    }

    #[tokio::test]
    async fn referenced_keys_are_never_touched() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            bucket: "my-valid-bucket".to_string(),
            mode: GcMode::Execute,
            vault_path: dir.path().to_path_buf(),
            retention_days: 0,
            ..Config::default()
        }
        .try_new()
        .unwrap();
        let (state, fake) = test_state(dir.path().to_path_buf()).await;

        let old = Utc::now() - Duration::days(30);
        fake.seed_with_age("referenced.jpg", Bytes::from_static(b"data"), old).await;
        state.registry.increment("referenced.jpg").await.unwrap();

        let result = run_cycle(&config, &state, None).await.unwrap();
        assert_eq!(result.deleted_count, 0);
        assert!(fake.contains("referenced.jpg").await);
    }
}
