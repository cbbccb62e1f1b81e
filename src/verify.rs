//! Orphan Verifier: four independent safety layers a candidate key must
//! clear, in a fixed order, before it is eligible for backup and deletion.
//! Any layer may reject; no layer is ever skipped, not even in execute
//! mode.

use chrono::Utc;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::config::{Config, TableConfig};
use crate::registry::Registry;
use crate::s3::ObjectStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    RegistryRefCount(i64),
    FoundInDatabase,
    TooRecent,
    AgeCheckFailed,
    ExcludedPrefix(String),
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::RegistryRefCount(n) => write!(f, "registry_ref_count={n}"),
            RejectionReason::FoundInDatabase => write!(f, "found_in_database"),
            RejectionReason::TooRecent => write!(f, "too_recent"),
            RejectionReason::AgeCheckFailed => write!(f, "age_check_failed"),
            RejectionReason::ExcludedPrefix(p) => write!(f, "excluded_prefix={p}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Orphan,
    Rejected(RejectionReason),
}

/// A live re-check against the application database, used by L2. Kept as
/// a trait so tests can substitute a fixture without a real database.
#[async_trait::async_trait]
pub trait LiveDbProbe: Send + Sync {
    /// Returns true if `key` is found in any tracked `(table, column)`.
    async fn exists(&self, key: &str) -> bool;
}

pub struct PostgresLiveDbProbe {
    pool: AnyPool,
    tables: TableConfig,
}

impl PostgresLiveDbProbe {
    pub async fn connect(connection_url: &str, tables: TableConfig) -> crate::error::Result<Self> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect(connection_url)
            .await
            .map_err(|e| crate::error::S3GcError::Registry(e.to_string()))?;
        Ok(PostgresLiveDbProbe { pool, tables })
    }
}

#[async_trait::async_trait]
impl LiveDbProbe for PostgresLiveDbProbe {
    async fn exists(&self, key: &str) -> bool {
        for (table, columns) in &self.tables {
            for column in columns {
                // Exact-match, parameter-bound probe. A substring `LIKE`
                // probe is unsafe here: it can match unrelated keys that
                // merely share a prefix or suffix, which would make L2
                // reject legitimate orphans. Equality is both safe and
                // sufficient because keys observed via CDC are compared
                // against the normalized key the verifier already has.
                let sql = format!("SELECT 1 FROM {table} WHERE {column} = $1 LIMIT 1");
                if let Ok(Some(_)) = sqlx::query(&sql)
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await
                {
                    return true;
                }
            }
        }
        false
    }
}

/// Runs all four layers against `key` in order, short-circuiting on the
/// first rejection. `live_db` is `None` when no CDC backend is configured,
/// in which case L2 is a no-op pass-through (not a silent success covering
/// for a misconfiguration — the orchestrator logs when CDC is absent).
pub async fn verify_orphan(
    config: &Config,
    registry: &Registry,
    live_db: Option<&dyn LiveDbProbe>,
    store: &dyn ObjectStore,
    key: &str,
) -> crate::error::Result<VerifyOutcome> {
    // L1: registry reference count.
    let ref_count = registry.get_count(key).await?;
    if ref_count != 0 {
        return Ok(VerifyOutcome::Rejected(RejectionReason::RegistryRefCount(ref_count)));
    }

    // L2: live database re-check, only when CDC is configured.
    if let Some(probe) = live_db {
        if probe.exists(key).await {
            registry.increment(key).await?;
            return Ok(VerifyOutcome::Rejected(RejectionReason::FoundInDatabase));
        }
    }

    // L3: retention window, fail-closed on any head_object error.
    match store.head(key).await {
        Ok(Some(meta)) => {
            let age_days = (Utc::now() - meta.last_modified).num_days();
            if age_days < config.retention_days {
                return Ok(VerifyOutcome::Rejected(RejectionReason::TooRecent));
            }
        }
        Ok(None) => return Ok(VerifyOutcome::Rejected(RejectionReason::AgeCheckFailed)),
        Err(_) => return Ok(VerifyOutcome::Rejected(RejectionReason::AgeCheckFailed)),
    }

    // L4: operator-configured prefix allowlist.
    for prefix in &config.exclude_prefixes {
        if key.starts_with(prefix.as_str()) {
            return Ok(VerifyOutcome::Rejected(RejectionReason::ExcludedPrefix(prefix.clone())));
        }
    }

    Ok(VerifyOutcome::Orphan)
}
