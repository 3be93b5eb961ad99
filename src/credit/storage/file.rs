//! File-based storage backend with atomic writes.
//!
//! Each record is a file named after the record inside the state directory.
//! Writes go to a private temp file which is synced and then renamed over
//! the target.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{StateRecord, StateStorage};
use crate::credit::PaygError;

/// Stores records as files under a directory owned by this process.
///
/// # Example
///
/// ```rust
/// use payg::credit::storage::{FileStorage, StateRecord, StateStorage};
///
/// # async fn example() -> Result<(), payg::PaygError> {
/// let dir = std::env::temp_dir().join("payg-doc");
/// let storage = FileStorage::new(&dir);
/// storage.init().await?;
/// storage.store(StateRecord::UsedCounters, vec![1, 2]).await?;
/// assert!(dir.join("used-counters").exists());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileStorage {
    directory: PathBuf,
}

fn storage_error(path: &Path, action: &str, e: std::io::Error) -> PaygError {
    PaygError::StorageError(format!("failed to {action} {}: {e}", path.display()))
}

impl FileStorage {
    /// Creates a backend rooted at `directory`. Nothing is touched until
    /// [`StateStorage::init`] or the first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the file holding `record`.
    pub fn path(&self, record: StateRecord) -> PathBuf {
        self.directory.join(record.name())
    }

    fn temp_path(&self, record: StateRecord) -> PathBuf {
        self.directory.join(format!(".{}.tmp", record.name()))
    }

    async fn write_temp(&self, temp: &Path, data: &[u8]) -> Result<(), PaygError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(temp)
            .await
            .map_err(|e| storage_error(temp, "create", e))?;
        file.write_all(data)
            .await
            .map_err(|e| storage_error(temp, "write", e))?;
        file.sync_all()
            .await
            .map_err(|e| storage_error(temp, "sync", e))?;
        Ok(())
    }
}

#[async_trait]
impl StateStorage for FileStorage {
    async fn init(&self) -> Result<(), PaygError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);

        builder
            .create(&self.directory)
            .await
            .map_err(|e| storage_error(&self.directory, "create directory", e))
    }

    async fn load(&self, record: StateRecord) -> Result<Option<Vec<u8>>, PaygError> {
        let path = self.path(record);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_error(&path, "read", e)),
        }
    }

    async fn store(&self, record: StateRecord, data: Vec<u8>) -> Result<(), PaygError> {
        let target = self.path(record);
        let temp = self.temp_path(record);

        let result = match self.write_temp(&temp, &data).await {
            Ok(()) => tokio::fs::rename(&temp, &target)
                .await
                .map_err(|e| storage_error(&target, "replace", e)),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                debug!(path = %temp.display(), error = %e, "Failed to remove temporary file");
            }
        }
        result
    }

    async fn remove(&self, record: StateRecord) -> Result<(), PaygError> {
        let path = self.path(record);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_error(&path, "remove", e)),
        }
    }

    fn location(&self, record: StateRecord) -> String {
        self.path(record).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_storage_roundtrip() -> Result<(), PaygError> {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        storage
            .store(StateRecord::ExpiryTime, 99u64.to_ne_bytes().to_vec())
            .await?;
        assert_eq!(
            storage.load(StateRecord::ExpiryTime).await?,
            Some(99u64.to_ne_bytes().to_vec())
        );
        assert_eq!(
            std::fs::read(temp_dir.path().join("expiry-time")).unwrap(),
            99u64.to_ne_bytes()
        );

        // Overwrite leaves no temp file behind
        storage
            .store(StateRecord::ExpiryTime, 100u64.to_ne_bytes().to_vec())
            .await?;
        assert!(!temp_dir.path().join(".expiry-time.tmp").exists());
        assert_eq!(
            storage.load(StateRecord::ExpiryTime).await?,
            Some(100u64.to_ne_bytes().to_vec())
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_file_storage_load_nonexistent() -> Result<(), PaygError> {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        assert_eq!(storage.load(StateRecord::UsedCounters).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_storage_remove() -> Result<(), PaygError> {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        storage.store(StateRecord::UsedCounters, vec![1]).await?;
        storage.remove(StateRecord::UsedCounters).await?;
        assert_eq!(storage.load(StateRecord::UsedCounters).await?, None);
        storage.remove(StateRecord::UsedCounters).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_file_storage_init_creates_directory() -> Result<(), PaygError> {
        let temp_dir = TempDir::new().unwrap();
        let directory = temp_dir.path().join("nested").join("state");
        let storage = FileStorage::new(&directory);

        storage.init().await?;
        assert!(directory.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&directory).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        // Idempotent
        storage.init().await?;
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_storage_files_are_private() -> Result<(), PaygError> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());
        storage.store(StateRecord::ClockTime, vec![0; 8]).await?;

        let mode = std::fs::metadata(storage.path(StateRecord::ClockTime))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_storage_store_into_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let directory = temp_dir.path().join("gone");
        let storage = FileStorage::new(&directory);

        let result = storage.store(StateRecord::ExpiryTime, vec![0; 8]).await;
        match result {
            Err(PaygError::StorageError(message)) => {
                assert!(message.contains(&directory.display().to_string()));
            }
            other => panic!("expected a storage error, got {other:?}"),
        }
    }

    #[test]
    fn test_file_storage_location() {
        let storage = FileStorage::new("/var/lib/payg");
        assert_eq!(
            storage.location(StateRecord::UsedCounters),
            "/var/lib/payg/used-counters"
        );
    }
}
