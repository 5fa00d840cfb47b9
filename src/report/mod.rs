//! Run reports and their persistence.
//!
//! This module provides:
//! - Per-resource outcomes and the aggregated [`Report`] with exit codes
//! - Optional persistence of the last report (local or S3)
//! - The exclusive run lock for a target

mod types;
mod lock;
mod store;
mod local;
mod s3;

use std::path::Path;

use tracing::debug;

use crate::config::{ReportBackend, ReportConfig, expand_home};
use crate::error::{ConfigError, Result};

pub use types::{Outcome, OutcomeStatus, REPORT_VERSION, Report, RunMode, RunPhase, Summary};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_SECS, LockInfo, generate_holder_id};
pub use store::ReportStore;
pub use local::{LocalReportStore, REPORT_DIR};
pub use s3::S3ReportStore;

/// Opens the report store configured for the declaration at `declaration`.
///
/// The local backend defaults to a `.converge` directory beside the
/// declaration.
///
/// # Errors
///
/// Returns an error if the S3 backend is selected without a bucket.
pub async fn open_store(config: &ReportConfig, declaration: &Path) -> Result<Box<dyn ReportStore>> {
    let store: Box<dyn ReportStore> = match config.backend {
        ReportBackend::Local => match config.path.as_deref() {
            Some(path) => Box::new(LocalReportStore::with_base_dir(expand_home(path))),
            None => Box::new(LocalReportStore::beside(declaration)),
        },
        ReportBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("S3 report backend requires a bucket", "report.bucket")
            })?;
            Box::new(
                S3ReportStore::new(bucket, config.prefix.as_deref(), config.region.as_deref())
                    .await,
            )
        }
    };

    debug!("Using {} report store", store.backend_type());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_local_store_beside_declaration() {
        let temp = TempDir::new().expect("temp dir");
        let store = open_store(&ReportConfig::default(), &temp.path().join("converge.yaml"))
            .await
            .expect("open");

        assert_eq!(store.backend_type(), "local");
        store
            .save(&Report::new(RunMode::Verify, "srv", "abc"))
            .await
            .expect("save");
        assert!(temp.path().join(REPORT_DIR).is_dir());
    }

    #[test]
    fn test_s3_backend_requires_bucket() {
        let config = ReportConfig {
            backend: ReportBackend::S3,
            ..ReportConfig::default()
        };

        let result = tokio_test::block_on(open_store(&config, Path::new("converge.yaml")));
        let err = tokio_test::assert_err!(result.map(|_| ()));
        assert!(matches!(err, ConvergeError::Config(_)));
    }
}
