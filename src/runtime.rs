//! Runtime state threaded through every GC cycle: the registry, vault,
//! object store, and optional CDC transport, plus in-memory counters
//! exposed to operators via [`crate::runtime::RuntimeState::metrics`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::cdc::CdcTransport;
use crate::config::Config;
use crate::error::Result;
use crate::registry::Registry;
use crate::s3::{ObjectStore, S3ObjectStore};
use crate::vault::Vault;

#[derive(Debug, Clone, serde::Serialize)]
pub struct GcMetrics {
    pub total_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub total_deleted: u64,
    pub total_backed_up: u64,
    pub total_restored: u64,
    pub vault_size_bytes: u64,
    pub avg_compression_ratio: f64,
    pub last_error: Option<String>,
}

/// Everything a GC cycle needs that outlives a single invocation. Cheap to
/// clone: the store and optional CDC handle are already behind `Arc`, and
/// [`Registry`]/[`Vault`] wrap pooled connections.
#[derive(Clone)]
pub struct RuntimeState {
    pub registry: Registry,
    pub vault: Vault,
    pub store: Arc<dyn ObjectStore>,
    pub vault_path: PathBuf,
    cdc_transport: Option<Arc<dyn CdcTransport>>,
    total_runs: Arc<AtomicU64>,
    total_deleted: Arc<AtomicU64>,
    total_backed_up: Arc<AtomicU64>,
    total_restored: Arc<AtomicU64>,
    last_run_at: Arc<RwLock<Option<DateTime<Utc>>>>,
    last_error: Arc<RwLock<Option<String>>>,
}

impl RuntimeState {
    /// Creates the registry/vault databases under `config.vault_path` if
    /// absent and opens a real S3 object store. CDC is left unattached;
    /// callers that need it wire a transport in separately, since the
    /// transport's lifecycle (background task, shutdown) is owned by
    /// whoever starts it, not by this struct.
    pub async fn initialize(config: &Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.vault_path)
            .await
            .map_err(|e| crate::error::S3GcError::Configuration {
                errors: vec![format!("failed to create vault_path: {e}")],
            })?;

        let registry = Registry::open(&config.vault_path.join("registry.db")).await?;
        let vault = Vault::open(&config.vault_path.join("vault.db")).await?;
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(config).await?);

        Ok(RuntimeState {
            registry,
            vault,
            store,
            vault_path: config.vault_path.clone(),
            cdc_transport: None,
            total_runs: Arc::new(AtomicU64::new(0)),
            total_deleted: Arc::new(AtomicU64::new(0)),
            total_backed_up: Arc::new(AtomicU64::new(0)),
            total_restored: Arc::new(AtomicU64::new(0)),
            last_run_at: Arc::new(RwLock::new(None)),
            last_error: Arc::new(RwLock::new(None)),
        })
    }

    #[cfg(test)]
    pub(crate) fn for_test(registry: Registry, vault: Vault, store: Arc<dyn ObjectStore>, vault_path: PathBuf) -> Self {
        RuntimeState {
            registry,
            vault,
            store,
            vault_path,
            cdc_transport: None,
            total_runs: Arc::new(AtomicU64::new(0)),
            total_deleted: Arc::new(AtomicU64::new(0)),
            total_backed_up: Arc::new(AtomicU64::new(0)),
            total_restored: Arc::new(AtomicU64::new(0)),
            last_run_at: Arc::new(RwLock::new(None)),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    pub fn with_cdc_transport(mut self, transport: Arc<dyn CdcTransport>) -> Self {
        self.cdc_transport = Some(transport);
        self
    }

    pub fn cdc_transport(&self) -> Option<&Arc<dyn CdcTransport>> {
        self.cdc_transport.as_ref()
    }

    pub(crate) fn record_run(&self, deleted: u64, backed_up: u64) {
        self.total_runs.fetch_add(1, Ordering::Relaxed);
        self.total_deleted.fetch_add(deleted, Ordering::Relaxed);
        self.total_backed_up.fetch_add(backed_up, Ordering::Relaxed);
    }

    pub(crate) async fn set_last_run_at(&self, ran_at: DateTime<Utc>) {
        *self.last_run_at.write().await = Some(ran_at);
    }

    pub(crate) async fn set_last_error(&self, error: Option<String>) {
        *self.last_error.write().await = error;
    }

    /// Adds `count` to the running restored-object total. Callers (the CLI,
    /// or any embedder driving `restore::restore_operation`/`restore_key`
    /// directly) call this after a non-dry-run restore completes, since
    /// restores don't flow through `run_cycle`'s own counter updates.
    pub fn record_restored(&self, count: u64) {
        self.total_restored.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn metrics(&self) -> Result<GcMetrics> {
        let backup_stats = crate::backup::backup_stats(&self.vault_path).await?;
        let vault_stats = self.vault.vault_stats().await?;

        Ok(GcMetrics {
            total_runs: self.total_runs.load(Ordering::Relaxed),
            last_run_at: *self.last_run_at.read().await,
            total_deleted: self.total_deleted.load(Ordering::Relaxed),
            total_backed_up: self.total_backed_up.load(Ordering::Relaxed),
            total_restored: self.total_restored.load(Ordering::Relaxed),
            vault_size_bytes: backup_stats.backup_bytes + backup_stats.archive_bytes,
            avg_compression_ratio: vault_stats.avg_compression_ratio,
            last_error: self.last_error.read().await.clone(),
        })
    }
}
