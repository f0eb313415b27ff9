//! S3-based state storage backend.
//!
//! This module provides remote state storage in an S3 bucket so that
//! several machines (or CI runners) share records and run locks. Keys
//! mirror the local layout below an optional prefix.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::{debug, info};

use crate::error::{Result, StateError};

use super::local::parse_record;
use super::lock::{LOCK_EXPIRY_SECS, LOCK_FILE, LockInfo};
use super::store::{StateStore, record_file};
use super::types::DeploymentRecord;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        let config = loader.load().await;

        Self::with_client(Client::new(&config), bucket, prefix)
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn record_key(&self, cluster: &str, service: &str) -> String {
        format!("{}{cluster}/{}", self.prefix, record_file(service))
    }

    fn lock_key(&self, cluster: &str) -> String {
        format!("{}{cluster}/{LOCK_FILE}", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::backend(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                    message: format!("Invalid UTF-8 in S3 object: {e}"),
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object. With `if_absent` the write fails if the key exists.
    async fn put_object(&self, key: &str, content: &str, if_absent: bool) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(content.as_bytes().to_vec()))
            .content_type("application/json");
        if if_absent {
            request = request.if_none_match("*");
        }

        request.send().await.map_err(|e| {
            let status = e.raw_response().map(|r| r.status().as_u16());
            if matches!(status, Some(409 | 412)) {
                StateError::LockFailed {
                    message: format!("s3://{}/{key} was written concurrently", self.bucket),
                }
            } else {
                StateError::backend(format!("S3 put error: {e}"))
            }
        })?;

        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, cluster: &str, service: &str) -> Result<Option<DeploymentRecord>> {
        let key = self.record_key(cluster, service);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(json) => parse_record(&json).map(Some),
            None => {
                debug!("No state found in S3");
                Ok(None)
            }
        }
    }

    async fn save(&self, record: &DeploymentRecord) -> Result<()> {
        let key = self.record_key(&record.cluster, &record.service);
        info!("Saving state to s3://{}/{key}", self.bucket);

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content, false).await
    }

    async fn delete(&self, cluster: &str, service: &str) -> Result<()> {
        let key = self.record_key(cluster, service);
        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn acquire_lock(&self, cluster: &str, holder: &str) -> Result<LockInfo> {
        let key = self.lock_key(cluster);

        if let Some(content) = self.get_object(&key).await? {
            let existing = LockInfo::from_json(&content)?;
            if !existing.is_expired() {
                return Err(existing.conflict());
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
            self.delete_object(&key).await?;
        }

        let lock = LockInfo::new(cluster, holder);
        self.put_object(&key, &lock.to_json()?, true).await?;

        info!(
            "Acquired run lock for {cluster}: {} (expires in {}s)",
            lock.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let key = self.lock_key(&lock.cluster);

        match self.get_object(&key).await? {
            Some(content) => {
                let mut existing = LockInfo::from_json(&content)?;
                if existing.lock_id != lock.lock_id {
                    return Err(existing.conflict());
                }
                existing.refresh();
                self.put_object(&key, &existing.to_json()?, false).await?;
                debug!("Refreshed run lock for {}", lock.cluster);
                Ok(existing)
            }
            None => Err(StateError::LockFailed {
                message: format!("lock for {} disappeared", lock.cluster),
            }
            .into()),
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        let key = self.lock_key(&lock.cluster);

        if let Some(content) = self.get_object(&key).await? {
            let existing = LockInfo::from_json(&content)?;
            if existing.lock_id == lock.lock_id {
                self.delete_object(&key).await?;
                info!("Released run lock for {}", lock.cluster);
            } else {
                debug!(
                    "Lock ID mismatch: expected {}, found {}",
                    lock.lock_id, existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn lock_info(&self, cluster: &str) -> Result<Option<LockInfo>> {
        match self.get_object(&self.lock_key(cluster)).await? {
            Some(content) => LockInfo::from_json(&content).map(Some),
            None => Ok(None),
        }
    }

    async fn force_unlock(&self, cluster: &str) -> Result<Option<LockInfo>> {
        let existing = self.lock_info(cluster).await?;
        if existing.is_some() {
            self.delete_object(&self.lock_key(cluster)).await?;
        }
        Ok(existing)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{p}/"))
        .unwrap_or_default()
}
