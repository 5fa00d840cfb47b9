//! Report store trait.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::Report;

/// Persists the last report of a target and guards runs with a lock.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Loads the last persisted report.
    ///
    /// Returns `None` if no run has been recorded yet.
    async fn load_last(&self) -> Result<Option<Report>>;

    /// Persists `report` as the last report.
    async fn save(&self, report: &Report) -> Result<()>;

    /// Acquires the run lock for `target`.
    ///
    /// An empty `holder` is replaced by a generated process identifier.
    async fn acquire_lock(&self, holder: &str, target: &str) -> Result<LockInfo>;

    /// Extends the expiry of `lock` while its holder is still running.
    ///
    /// Fails with [`crate::error::ReportError::LockFailed`] if the lock was
    /// released or taken over in the meantime.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the run lock regardless of holder.
    async fn force_unlock(&self) -> Result<()>;

    /// Returns the current lock, expired or not.
    async fn lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
