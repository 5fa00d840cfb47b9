//! S3-based report storage.
//!
//! Keeps the last report and the run lock of a target in an S3 bucket (or a
//! compatible service) so several operators share one audit trail.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tracing::{debug, info};

use crate::error::{ConvergeError, ReportError, Result};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::ReportStore;
use super::types::Report;

/// Last report key suffix.
const REPORT_KEY: &str = "last-report.json";

/// Lock key suffix.
const LOCK_KEY: &str = "run.lock";

/// Error codes S3 returns when a conditional write loses.
const CONDITION_FAILED_CODES: &[&str] = &["PreconditionFailed", "ConditionalRequestConflict"];

/// Condition under which the lock object is written.
#[derive(Debug, Clone, Copy)]
enum LockWrite<'a> {
    /// Only if no lock object exists.
    Create,
    /// Only if the lock object still carries this entity tag.
    Replace(&'a str),
}

/// S3-based report store.
#[derive(Debug)]
pub struct S3ReportStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

impl S3ReportStore {
    /// Creates a store using credentials from the environment.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let config = match region {
            Some(region) => {
                aws_config::from_env()
                    .region(aws_config::Region::new(region.to_string()))
                    .load()
                    .await
            }
            None => aws_config::load_from_env().await,
        };

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_object_tagged(key).await?.map(|(content, _)| content))
    }

    /// Fetches an object with its entity tag.
    async fn get_object_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let e_tag = response.e_tag().map(String::from);
                let bytes = response.body.collect().await.map_err(|e| {
                    ConvergeError::Report(ReportError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    ConvergeError::Report(ReportError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some((content, e_tag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ConvergeError::Report(ReportError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| ConvergeError::Report(ReportError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ConvergeError::Report(ReportError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock_tagged().await?.map(|(lock, _)| lock))
    }

    async fn read_lock_tagged(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some((content, e_tag)) = self.get_object_tagged(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };

        let lock: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::Report(ReportError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;

        Ok(Some((lock, e_tag)))
    }

    /// Writes the lock object under `write`.
    ///
    /// Returns `false` if the condition did not hold.
    async fn put_lock(&self, lock: &LockInfo, write: LockWrite<'_>) -> Result<bool> {
        let content = serde_json::to_string_pretty(lock).map_err(|e| {
            ConvergeError::Report(ReportError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(LOCK_KEY))
            .body(content.into_bytes().into())
            .content_type("application/json");
        let request = match write {
            LockWrite::Create => request.if_none_match("*"),
            LockWrite::Replace(e_tag) => request.if_match(e_tag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(e) if e.code().is_some_and(|code| CONDITION_FAILED_CODES.contains(&code)) => {
                debug!("Conditional lock write lost: {write:?}");
                Ok(false)
            }
            Err(e) => Err(ConvergeError::Report(ReportError::s3(format!(
                "S3 lock put error: {e}"
            )))),
        }
    }
}

/// Normalizes a key prefix to empty or `segment/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl ReportStore for S3ReportStore {
    async fn load_last(&self) -> Result<Option<Report>> {
        let key = self.key(REPORT_KEY);
        debug!("Loading report from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No report found in S3");
            return Ok(None);
        };

        let report: Report = serde_json::from_str(&json).map_err(|e| {
            ConvergeError::Report(ReportError::Corrupted {
                message: format!("Failed to parse report: {e}"),
            })
        })?;

        Ok(Some(report))
    }

    async fn save(&self, report: &Report) -> Result<()> {
        let key = self.key(REPORT_KEY);
        info!("Saving report to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(report).map_err(|e| {
            ConvergeError::Report(ReportError::serialization(format!(
                "Failed to serialize report: {e}"
            )))
        })?;

        self.put_object(&key, &content).await
    }

    async fn acquire_lock(&self, holder: &str, target: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };
        let lock = LockInfo::new(&holder_id, target);

        if !self.put_lock(&lock, LockWrite::Create).await? {
            let acquired = match self.read_lock_tagged().await? {
                Some((existing, _)) if !existing.is_expired() => {
                    return Err(ConvergeError::Report(ReportError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                Some((_, Some(e_tag))) => {
                    debug!("Expired lock found, taking over");
                    self.put_lock(&lock, LockWrite::Replace(&e_tag)).await?
                }
                Some((_, None)) => false,
                None => self.put_lock(&lock, LockWrite::Create).await?,
            };
            if !acquired {
                return Err(ConvergeError::Report(ReportError::LockFailed {
                    message: String::from("another run took the lock concurrently"),
                }));
            }
        }

        info!(
            "Acquired run lock: {} (expires in {}s)",
            lock.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let lost = || {
            ConvergeError::Report(ReportError::LockFailed {
                message: format!("run lock {} is no longer held", lock.lock_id),
            })
        };

        let Some((mut current, Some(e_tag))) = self
            .read_lock_tagged()
            .await?
            .filter(|(current, _)| current.lock_id == lock.lock_id)
        else {
            return Err(lost());
        };

        current.refresh();
        if !self.put_lock(&current, LockWrite::Replace(&e_tag)).await? {
            return Err(lost());
        }
        debug!("Renewed run lock {} until {}", current.lock_id, current.expires_at);

        Ok(current)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
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
        self.delete_object(&self.key(LOCK_KEY)).await
    }

    async fn lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
