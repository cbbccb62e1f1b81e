use std::panic::Location;

use tracing::error;

/// Logs an error with its call-site location and the current span trace,
/// then lets the caller convert it into the crate's own error type.
#[inline]
#[track_caller]
pub(crate) fn log(source: &dyn std::error::Error) {
    let location = Location::caller();
    let span_trace = tracing_error::SpanTrace::capture();

    error!(
        target: "s3gc",
        %location,
        error = %source,
        "span trace:\n{span_trace}"
    );
}

/// Logs `$result`'s error (if any) and returns it wrapped in the given
/// `S3GcError` variant constructor.
macro_rules! try_ {
    ($result:expr, $variant:expr) => {
        match $result {
            Ok(val) => val,
            Err(err) => {
                crate::error::log(&err);
                return Err($variant(err.to_string()));
            }
        }
    };
}

pub(crate) use try_;

/// The single error taxonomy for the crate. Every fallible public entry
/// point returns `Result<_, S3GcError>`; callers match on the tag, not on
/// a type hierarchy.
#[derive(Debug, thiserror::Error)]
pub enum S3GcError {
    /// Configuration failed validation. Carries every failure found, not
    /// just the first, so a caller can fix them all in one pass.
    #[error("configuration error: {}", .errors.join("; "))]
    Configuration { errors: Vec<String> },

    /// The reference registry (SQLite) failed to read or write.
    #[error("registry error: {0}")]
    Registry(String),

    /// A CDC transport failed to ingest or apply a change event.
    #[error("cdc error: {0}")]
    Cdc(String),

    /// Backup creation, compression, or blob storage failed.
    #[error("backup error: {0}")]
    Backup(String),

    /// The audit vault (SQLite, or its replication target) failed.
    #[error("vault error: {0}")]
    Vault(String),

    /// A restore operation could not complete.
    #[error("restore error: {0}")]
    Restore(String),

    /// The remote object store returned an error or was unreachable.
    #[error("object store error: {0}")]
    ObjectStore(String),
}

impl S3GcError {
    pub fn configuration(errors: Vec<String>) -> Self {
        S3GcError::Configuration { errors }
    }

    /// Short machine-readable tag, used in structured log fields.
    pub fn tag(&self) -> &'static str {
        match self {
            S3GcError::Configuration { .. } => "configuration",
            S3GcError::Registry(_) => "registry",
            S3GcError::Cdc(_) => "cdc",
            S3GcError::Backup(_) => "backup",
            S3GcError::Vault(_) => "vault",
            S3GcError::Restore(_) => "restore",
            S3GcError::ObjectStore(_) => "object_store",
        }
    }
}

pub type Result<T> = std::result::Result<T, S3GcError>;
