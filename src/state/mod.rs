//! Recorded state and run locking.
//!
//! This module keeps a record per deployed service (last applied spec hash,
//! resolved identifiers, run history) and the run lock that serializes
//! runs against one cluster.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::LocalStateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{DeploymentRecord, MAX_HISTORY, RunRecord, STATE_VERSION};

use std::sync::Arc;

use crate::config::{StateBackend, StateSpec};
use crate::error::{ConfigError, Result};

/// Opens the backend a descriptor asks for.
///
/// # Errors
///
/// Returns an error if the S3 backend has no bucket or the local directory
/// cannot be determined.
pub async fn open(spec: &StateSpec) -> Result<Arc<dyn StateStore>> {
    match spec.backend {
        StateBackend::Local => {
            let store = match &spec.path {
                Some(path) => LocalStateStore::with_base_dir(path),
                None => LocalStateStore::new()?,
            };
            Ok(Arc::new(store))
        }
        StateBackend::S3 => {
            let bucket = spec.bucket.as_deref().ok_or_else(|| {
                ConfigError::validation("the s3 state backend needs a bucket", "state.bucket")
            })?;
            let store = S3StateStore::new(bucket, spec.prefix.as_deref(), spec.region.as_deref()).await;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_local() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = StateSpec {
            path: Some(dir.path().display().to_string()),
            ..StateSpec::default()
        };

        let store = open(&spec).await.unwrap();
        assert_eq!(store.backend_type(), "local");
    }

    #[tokio::test]
    async fn test_s3_needs_bucket() {
        let spec = StateSpec {
            backend: StateBackend::S3,
            ..StateSpec::default()
        };

        assert!(open(&spec).await.is_err());
    }
}
