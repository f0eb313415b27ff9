//! State store trait definition.
//!
//! Records are keyed by cluster and service; the run lock is keyed by
//! cluster alone.

use async_trait::async_trait;

use crate::error::Result;
use super::lock::LockInfo;
use super::types::DeploymentRecord;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the record for a service.
    ///
    /// Returns `None` if nothing was recorded yet.
    async fn load(&self, cluster: &str, service: &str) -> Result<Option<DeploymentRecord>>;

    /// Saves a record.
    async fn save(&self, record: &DeploymentRecord) -> Result<()>;

    /// Deletes the record for a service.
    async fn delete(&self, cluster: &str, service: &str) -> Result<()>;

    /// Acquires the run lock for a cluster.
    ///
    /// Fails with `StateError::LockedByOther` while another holder's lock
    /// has not expired.
    async fn acquire_lock(&self, cluster: &str, holder: &str) -> Result<LockInfo>;

    /// Extends a held lock.
    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo>;

    /// Releases a held lock. A lock taken over by someone else is left alone.
    async fn release_lock(&self, lock: &LockInfo) -> Result<()>;

    /// Gets the current lock for a cluster, expired or not.
    async fn lock_info(&self, cluster: &str) -> Result<Option<LockInfo>>;

    /// Removes the lock for a cluster regardless of holder.
    ///
    /// Returns the lock that was removed.
    async fn force_unlock(&self, cluster: &str) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// File name of a service record inside its cluster directory.
#[must_use]
pub fn record_file(service: &str) -> String {
    format!("{service}.json")
}
