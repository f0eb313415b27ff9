//! Local file-based state storage backend.
//!
//! Layout under the base directory (`.ecs-deploy/` by default):
//!
//! ```text
//! <cluster>/run.lock
//! <cluster>/<service>.json
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::is_valid_ecs_name;
use crate::error::{ConfigError, DeployError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LOCK_FILE, LockInfo};
use super::store::{StateStore, record_file};
use super::types::{DeploymentRecord, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".ecs-deploy";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a store in `.ecs-deploy/` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| DeployError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store with a custom base directory. A leading `~` is
    /// expanded to the home directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: expand_home(base_dir.as_ref()),
        }
    }

    /// Base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Names are joined into paths, so only plain ECS names are accepted.
    fn cluster_dir(&self, cluster: &str) -> Result<PathBuf> {
        checked_name(cluster, "cluster.name")?;
        Ok(self.base_dir.join(cluster))
    }

    fn record_path(&self, cluster: &str, service: &str) -> Result<PathBuf> {
        checked_name(service, "service.name")?;
        Ok(self.cluster_dir(cluster)?.join(record_file(service)))
    }

    fn lock_path(&self, cluster: &str) -> Result<PathBuf> {
        Ok(self.cluster_dir(cluster)?.join(LOCK_FILE))
    }

    async fn ensure_dir(dir: &Path) -> Result<()> {
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(dir).await.map_err(|e| {
                StateError::backend(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Writes through a temporary file and renames it into place.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent).await?;
        }

        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(format!("Failed to create {}: {e}", temp_path.display()))
        })?;
        file.write_all(content.as_bytes()).await.map_err(|e| {
            StateError::backend(format!("Failed to write {}: {e}", temp_path.display()))
        })?;
        file.sync_all().await.map_err(|e| {
            StateError::backend(format!("Failed to sync {}: {e}", temp_path.display()))
        })?;

        fs::rename(&temp_path, path).await.map_err(|e| {
            StateError::backend(format!("Failed to rename {}: {e}", path.display()))
        })?;
        Ok(())
    }

    async fn read_lock_file(&self, cluster: &str) -> Result<Option<LockInfo>> {
        let path = self.lock_path(cluster)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read lock file: {e}"),
        })?;

        LockInfo::from_json(&content).map(Some)
    }

    async fn delete_lock_file(&self, cluster: &str) -> Result<()> {
        let path = self.lock_path(cluster)?;
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, cluster: &str, service: &str) -> Result<Option<DeploymentRecord>> {
        let path = self.record_path(cluster, service)?;
        if !path.exists() {
            debug!("State file does not exist: {}", path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", path.display());

        let content = fs::read_to_string(&path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read state file: {e}"),
        })?;

        parse_record(&content).map(Some)
    }

    async fn save(&self, record: &DeploymentRecord) -> Result<()> {
        let path = self.record_path(&record.cluster, &record.service)?;
        info!("Saving state to: {}", path.display());

        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        Self::write_atomic(&path, &content).await
    }

    async fn delete(&self, cluster: &str, service: &str) -> Result<()> {
        let path = self.record_path(cluster, service)?;
        if path.exists() {
            info!("Deleting state file: {}", path.display());
            fs::remove_file(&path)
                .await
                .map_err(|e| StateError::backend(format!("Failed to delete state file: {e}")))?;
        }
        Ok(())
    }

    async fn acquire_lock(&self, cluster: &str, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file(cluster).await? {
            if !existing.is_expired() {
                return Err(existing.conflict());
            }
            debug!("Expired lock held by {} found, taking over", existing.holder);
            self.delete_lock_file(cluster).await?;
        }

        let lock = LockInfo::new(cluster, holder);
        Self::ensure_dir(&self.cluster_dir(cluster)?).await?;

        // a concurrent run that got here first wins
        let path = self.lock_path(cluster)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => StateError::LockFailed {
                    message: format!("lock for {cluster} was taken concurrently"),
                },
                _ => StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                },
            })?;
        file.write_all(lock.to_json()?.as_bytes())
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to write lock file: {e}"),
            })?;
        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        info!(
            "Acquired run lock for {cluster}: {} (expires in {}s)",
            lock.lock_id, LOCK_EXPIRY_SECS
        );
        Ok(lock)
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        match self.read_lock_file(&lock.cluster).await? {
            Some(existing) if existing.lock_id == lock.lock_id => {
                let mut refreshed = existing;
                refreshed.refresh();
                Self::write_atomic(&self.lock_path(&lock.cluster)?, &refreshed.to_json()?).await?;
                debug!("Refreshed run lock for {}", lock.cluster);
                Ok(refreshed)
            }
            Some(other) => Err(other.conflict()),
            None => Err(StateError::LockFailed {
                message: format!("lock for {} disappeared", lock.cluster),
            }
            .into()),
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> Result<()> {
        if let Some(existing) = self.read_lock_file(&lock.cluster).await? {
            if existing.lock_id == lock.lock_id {
                self.delete_lock_file(&lock.cluster).await?;
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
        self.read_lock_file(cluster).await
    }

    async fn force_unlock(&self, cluster: &str) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file(cluster).await?;
        self.delete_lock_file(cluster).await?;
        Ok(existing)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

/// Parses a stored record, rejecting unknown format versions.
///
/// # Errors
///
/// Returns an error if the content is not a record of this version.
pub fn parse_record(content: &str) -> Result<DeploymentRecord> {
    let record: DeploymentRecord = serde_json::from_str(content).map_err(|e| StateError::Corrupted {
        message: format!("Failed to parse state: {e}"),
    })?;

    if record.version != STATE_VERSION {
        return Err(StateError::VersionMismatch {
            expected: STATE_VERSION.to_string(),
            found: record.version,
        }
        .into());
    }
    Ok(record)
}

fn checked_name(name: &str, field: &str) -> Result<()> {
    if is_valid_ecs_name(name) {
        Ok(())
    } else {
        Err(ConfigError::validation(
            format!("'{name}' is not a valid ECS name (letters, numbers, hyphens, underscores)"),
            field,
        )
        .into())
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{RunKind, RunPhase};
    use crate::state::RunRecord;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, temp) = create_test_store();

        let mut record = DeploymentRecord::new("lamp-cluster", "lamp");
        let mut run = RunRecord::start(RunKind::Deploy, "abc123");
        run.finish(RunPhase::Succeeded, None);
        record.record_run(run);
        record.bindings.service_arn = Some(String::from("arn:aws:ecs:service/lamp"));
        store.save(&record).await.expect("Failed to save state");

        assert!(temp.path().join("lamp-cluster/lamp.json").exists());

        let loaded = store
            .load("lamp-cluster", "lamp")
            .await
            .expect("Failed to load state")
            .expect("State should exist");
        assert_eq!(loaded, record);

        store.delete("lamp-cluster", "lamp").await.expect("delete failed");
        assert!(store.load("lamp-cluster", "lamp").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load("lamp-cluster", "lamp").await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_corrupted_and_foreign_version() {
        let (store, temp) = create_test_store();
        let dir = temp.path().join("lamp-cluster");
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(dir.join("lamp.json"), "{ not json").unwrap();
        let err = store.load("lamp-cluster", "lamp").await.unwrap_err();
        assert!(matches!(err, DeployError::State(StateError::Corrupted { .. })));

        let mut record = DeploymentRecord::new("lamp-cluster", "lamp");
        record.version = String::from("99");
        std::fs::write(dir.join("lamp.json"), serde_json::to_string(&record).unwrap()).unwrap();
        let err = store.load("lamp-cluster", "lamp").await.unwrap_err();
        assert!(matches!(err, DeployError::State(StateError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, temp) = create_test_store();

        let lock = store
            .acquire_lock("lamp-cluster", "test-holder")
            .await
            .expect("Failed to acquire lock");
        assert!(temp.path().join("lamp-cluster/run.lock").exists());

        let refreshed = store.refresh_lock(&lock).await.expect("refresh failed");
        assert!(refreshed.expires_at >= lock.expires_at);

        store.release_lock(&lock).await.expect("Failed to release lock");
        assert!(store.lock_info("lamp-cluster").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let first = store
            .acquire_lock("lamp-cluster", "holder-1")
            .await
            .expect("Failed to acquire first lock");

        let err = store.acquire_lock("lamp-cluster", "holder-2").await.unwrap_err();
        match err {
            DeployError::State(StateError::LockedByOther { cluster, holder, .. }) => {
                assert_eq!(cluster, "lamp-cluster");
                assert_eq!(holder, "holder-1");
            }
            other => panic!("unexpected: {other}"),
        }

        // other clusters are independent
        store.acquire_lock("other-cluster", "holder-2").await.expect("independent lock");

        // releasing someone else's lock does nothing
        let stranger = LockInfo::new("lamp-cluster", "holder-2");
        store.release_lock(&stranger).await.unwrap();
        assert_eq!(store.lock_info("lamp-cluster").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store();

        let mut stale = LockInfo::new("lamp-cluster", "crashed-run");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let dir = temp.path().join("lamp-cluster");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("run.lock"), stale.to_json().unwrap()).unwrap();

        let lock = store.acquire_lock("lamp-cluster", "new-run").await.unwrap();
        assert_eq!(lock.holder, "new-run");
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("lamp-cluster", "holder-1").await.unwrap();

        let removed = store.force_unlock("lamp-cluster").await.unwrap();
        assert_eq!(removed.map(|l| l.holder).as_deref(), Some("holder-1"));
        assert!(store.lock_info("lamp-cluster").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_names_cannot_leave_base_dir() {
        let (store, temp) = create_test_store();

        let err = store.acquire_lock("../x", "holder-1").await.unwrap_err();
        assert!(matches!(err, DeployError::Config(ref e) if e.field() == Some("cluster.name")));

        let err = store.load("lamp-cluster", "../../lamp").await.unwrap_err();
        assert!(matches!(err, DeployError::Config(ref e) if e.field() == Some("service.name")));

        let record = DeploymentRecord::new("lamp-cluster/..", "lamp");
        assert!(store.save(&record).await.is_err());

        assert!(std::fs::read_dir(temp.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_expand_home() {
        let expanded = expand_home(Path::new("~/state"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("state"));
        }
        assert_eq!(expand_home(Path::new("/tmp/state")), PathBuf::from("/tmp/state"));
    }
}
