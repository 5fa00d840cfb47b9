//! Local file-based report storage.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ConvergeError, ReportError, Result};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::ReportStore;
use super::types::Report;

/// Default report directory name, created beside the declaration.
pub const REPORT_DIR: &str = ".converge";

/// Last report file name.
const REPORT_FILE: &str = "last-report.json";

/// Lock file name.
const LOCK_FILE: &str = "run.lock";

/// Report store in a local directory.
#[derive(Debug)]
pub struct LocalReportStore {
    /// Directory holding the report and lock files.
    base_dir: PathBuf,
    /// Path to the last report.
    report_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalReportStore {
    /// Creates a store in `base_dir`.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let report_path = base_dir.join(REPORT_FILE);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            report_path,
            lock_path,
        }
    }

    /// Creates a store in the default directory beside `declaration`.
    #[must_use]
    pub fn beside(declaration: &Path) -> Self {
        let dir = declaration
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::with_base_dir(dir.join(REPORT_DIR))
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating report directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ConvergeError::Report(ReportError::local(format!(
                    "Failed to create report directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConvergeError::Report(ReportError::Corrupted {
                    message: format!("Failed to read lock file: {e}"),
                }));
            }
        };

        let lock: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::Report(ReportError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock))
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock: &LockInfo) -> Result<bool> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(lock).map_err(|e| {
            ConvergeError::Report(ReportError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let lock_failed = |e: std::io::Error| {
            ConvergeError::Report(ReportError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })
        };

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(lock_failed(e)),
        };

        file.write_all(content.as_bytes()).await.map_err(lock_failed)?;
        file.sync_all().await.map_err(lock_failed)?;

        Ok(true)
    }

    /// Replaces the lock file's content.
    async fn rewrite_lock_file(&self, lock: &LockInfo) -> Result<()> {
        let content = serde_json::to_string_pretty(lock).map_err(|e| {
            ConvergeError::Report(ReportError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let lock_failed = |e: std::io::Error| {
            ConvergeError::Report(ReportError::LockFailed {
                message: format!("Failed to renew lock file: {e}"),
            })
        };

        let temp_path = self.lock_path.with_extension("renew");
        fs::write(&temp_path, content).await.map_err(lock_failed)?;
        fs::rename(&temp_path, &self.lock_path)
            .await
            .map_err(lock_failed)
    }

    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvergeError::Report(ReportError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }
}

#[async_trait]
impl ReportStore for LocalReportStore {
    async fn load_last(&self) -> Result<Option<Report>> {
        if !self.report_path.exists() {
            debug!("No report at {}", self.report_path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.report_path).await.map_err(|e| {
            ConvergeError::Report(ReportError::Corrupted {
                message: format!("Failed to read report: {e}"),
            })
        })?;

        let report: Report = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::Report(ReportError::Corrupted {
                message: format!("Failed to parse report: {e}"),
            })
        })?;

        Ok(Some(report))
    }

    async fn save(&self, report: &Report) -> Result<()> {
        self.ensure_dir().await?;

        info!("Saving report to: {}", self.report_path.display());

        let content = serde_json::to_string_pretty(report).map_err(|e| {
            ConvergeError::Report(ReportError::serialization(format!(
                "Failed to serialize report: {e}"
            )))
        })?;

        let write_failed = |e: std::io::Error| {
            ConvergeError::Report(ReportError::local(format!("Failed to write report: {e}")))
        };

        // temp file, then rename over the last report
        let temp_path = self.report_path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await.map_err(write_failed)?;
        file.write_all(content.as_bytes()).await.map_err(write_failed)?;
        file.sync_all().await.map_err(write_failed)?;
        fs::rename(&temp_path, &self.report_path)
            .await
            .map_err(write_failed)?;

        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, target: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock = LockInfo::new(&holder_id, target);

        if !self.create_lock_file(&lock).await? {
            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(ConvergeError::Report(ReportError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                _ => {
                    debug!("Expired lock found, taking over");
                    self.delete_lock_file().await?;
                    if !self.create_lock_file(&lock).await? {
                        return Err(ConvergeError::Report(ReportError::LockFailed {
                            message: String::from("another run took the lock concurrently"),
                        }));
                    }
                }
            }
        }

        info!(
            "Acquired run lock: {} (expires in {}s)",
            lock.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let mut current = match self.read_lock_file().await? {
            Some(current) if current.lock_id == lock.lock_id => current,
            _ => {
                return Err(ConvergeError::Report(ReportError::LockFailed {
                    message: format!("run lock {} is no longer held", lock.lock_id),
                }));
            }
        };

        current.refresh();
        self.rewrite_lock_file(&current).await?;
        debug!("Renewed run lock {} until {}", current.lock_id, current.expires_at);

        Ok(current)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released run lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.delete_lock_file().await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
