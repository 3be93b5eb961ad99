use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::credit::clock::{Clock, SystemClock};
use crate::credit::storage::{FileStorage, MemoryStorage, StateStorage};
use crate::credit::{CreditManager, PaygConfig, PaygError, SharedKey};

enum KeySource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// A builder for creating a `CreditManager` instance.
///
/// This builder defaults to `MemoryStorage`, the system clock and
/// `PaygConfig::default()`. Deployments persist state with
/// `with_file_storage()` or `with_storage()`. Without an explicit key, the key is read from
/// the configured key file; a missing key file disables enforcement.
#[must_use = "The builder does nothing unless `.build_and_init()` is called."]
pub struct CreditManagerBuilder<S: StateStorage> {
    storage: Arc<S>,
    clock: Option<Arc<dyn Clock>>,
    key: Option<KeySource>,
    config: Option<PaygConfig>,
    enabled: Option<bool>,
}

impl CreditManagerBuilder<MemoryStorage> {
    pub(crate) fn new() -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            clock: None,
            key: None,
            config: None,
            enabled: None,
        }
    }
}

impl<S: StateStorage + 'static> CreditManagerBuilder<S> {
    /// Specifies a storage backend to use instead of the default `MemoryStorage`.
    pub fn with_storage<T: StateStorage + 'static>(self, storage: Arc<T>) -> CreditManagerBuilder<T> {
        CreditManagerBuilder {
            storage,
            clock: self.clock,
            key: self.key,
            config: self.config,
            enabled: self.enabled,
        }
    }

    /// Persists state as files in the configured `state_directory`.
    ///
    /// The directory comes from the config given to `with_config()` so far,
    /// or from `PaygConfig::default()` (and so `PAYG_STATE_DIRECTORY`) if
    /// none was given. Call this after `with_config()`.
    pub fn with_file_storage(self) -> CreditManagerBuilder<FileStorage> {
        let storage = match &self.config {
            Some(config) => config.file_storage(),
            None => PaygConfig::default().file_storage(),
        };
        self.with_storage(Arc::new(storage))
    }

    /// Sets the time source. Defaults to [`SystemClock`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses `key` as the shared key.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(KeySource::Bytes(key.into()));
        self
    }

    /// Reads the shared key from `path` instead of the configured key file.
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key = Some(KeySource::File(path.into()));
        self
    }

    pub fn with_config(mut self, config: PaygConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Forces enforcement on or off.
    ///
    /// Forcing it on without a usable key makes `build_and_init()` fail
    /// with `PaygError::InvalidKey`.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Builds the manager and loads its state.
    ///
    /// This method consumes the builder. For an enabled manager it calls the
    /// storage backend's `init()`, loads the persisted state and arms the
    /// expiry timer; an empty store yields credit expiring immediately.
    ///
    /// # Errors
    ///
    /// - `PaygError::InvalidKey` if enabled with a missing or short key
    /// - `PaygError::CorruptState` if a persisted record was corrupt; it has
    ///   been removed, so building again succeeds
    /// - `PaygError::StorageError` if storage could not be read
    pub async fn build_and_init(self) -> Result<CreditManager<S>, PaygError> {
        let config = self.config.unwrap_or_default();
        for warning in config.validate() {
            warn!("{warning}");
        }

        let key = match self.key {
            Some(KeySource::Bytes(bytes)) => Some(SharedKey::new(bytes)?),
            Some(KeySource::File(path)) => SharedKey::from_file(&path).await?,
            None => SharedKey::from_file(&config.key_file).await?,
        };

        let key = match (self.enabled, key) {
            (Some(false), _) => None,
            (Some(true), None) => return Err(PaygError::InvalidKey),
            (_, key) => key,
        };
        if key.is_none() {
            info!("No key available; pay as you go is disabled");
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));

        if key.is_some() {
            self.storage.init().await?;
        }

        let mut manager = CreditManager::new(key, config, clock, self.storage);
        manager.load_state().await?;
        info!(
            enabled = manager.enabled(),
            expiry_time = manager.expiry_time(),
            "Credit manager ready"
        );
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::clock::FakeClock;
    use serial_test::serial;

    #[tokio::test]
    async fn test_builder_with_key() -> Result<(), PaygError> {
        let manager = CreditManager::builder()
            .with_key(vec![1u8; 64])
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await?;
        assert!(manager.enabled());
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_short_key() {
        let result = CreditManager::builder()
            .with_key(vec![1u8; 10])
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await;
        assert!(matches!(result, Err(PaygError::InvalidKey)));
    }

    #[tokio::test]
    async fn test_builder_missing_key_file_disables() -> Result<(), PaygError> {
        let dir = tempfile::tempdir().unwrap();
        let manager = CreditManager::builder()
            .with_key_file(dir.path().join("no-such-key"))
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await?;
        assert!(!manager.enabled());
        assert_eq!(manager.expiry_time(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_forced_enabled_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let result = CreditManager::builder()
            .with_key_file(dir.path().join("no-such-key"))
            .enabled(true)
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await;
        assert!(matches!(result, Err(PaygError::InvalidKey)));
    }

    #[tokio::test]
    async fn test_builder_forced_disabled() -> Result<(), PaygError> {
        let storage = Arc::new(MemoryStorage::new());
        let manager = CreditManager::builder()
            .with_storage(Arc::clone(&storage))
            .with_key(vec![1u8; 64])
            .enabled(false)
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await?;
        assert!(!manager.enabled());

        drop(manager);
        tokio::task::yield_now().await;
        assert!(storage.is_empty().await);
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_uses_config_key_file() -> Result<(), PaygError> {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("key");
        std::fs::write(&key_file, [9u8; 64]).unwrap();

        let config = PaygConfig {
            key_file,
            ..PaygConfig::from(crate::credit::ConfigPreset::Testing)
        };
        let manager = CreditManager::builder()
            .with_config(config)
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await?;
        assert!(manager.enabled());
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_file_storage_from_config() -> Result<(), PaygError> {
        let dir = tempfile::tempdir().unwrap();
        let state_directory = dir.path().join("state");
        let config = PaygConfig {
            state_directory: state_directory.clone(),
            ..PaygConfig::from(crate::credit::ConfigPreset::Testing)
        };

        let manager = CreditManager::builder()
            .with_config(config)
            .with_file_storage()
            .with_key(vec![1u8; 64])
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await?;
        assert_eq!(manager.storage().directory(), state_directory.as_path());

        manager.save_state().await?;
        assert!(state_directory.join("expiry-time").exists());
        Ok(())
    }

    #[tokio::test]
    #[serial]
    async fn test_builder_file_storage_from_env() -> Result<(), PaygError> {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("PAYG_STATE_DIRECTORY", dir.path());
        }

        let result = CreditManager::builder()
            .with_file_storage()
            .with_key(vec![1u8; 64])
            .with_clock(Arc::new(FakeClock::default()))
            .build_and_init()
            .await;
        unsafe {
            std::env::remove_var("PAYG_STATE_DIRECTORY");
        }

        let manager = result?;
        manager.save_state().await?;
        assert!(dir.path().join("expiry-time").exists());
        Ok(())
    }
}
