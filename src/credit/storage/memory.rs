//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StateRecord, StateStorage};
use crate::credit::PaygError;

/// Keeps records in a `HashMap`. Nothing survives the process.
///
/// Cloning yields a handle to the same records, so a test can keep one
/// clone, drop a manager and build a new one on the same state to simulate
/// a restart.
///
/// # Example
///
/// ```rust
/// use payg::credit::storage::{MemoryStorage, StateRecord, StateStorage};
///
/// # async fn example() -> Result<(), payg::PaygError> {
/// let storage = MemoryStorage::new();
/// storage.store(StateRecord::UsedCounters, vec![1, 2, 3]).await?;
/// assert_eq!(storage.load(StateRecord::UsedCounters).await?, Some(vec![1, 2, 3]));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<StateRecord, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently stored.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn load(&self, record: StateRecord) -> Result<Option<Vec<u8>>, PaygError> {
        let data = self.data.read().await;
        Ok(data.get(&record).cloned())
    }

    async fn store(&self, record: StateRecord, bytes: Vec<u8>) -> Result<(), PaygError> {
        let mut data = self.data.write().await;
        data.insert(record, bytes);
        Ok(())
    }

    async fn remove(&self, record: StateRecord) -> Result<(), PaygError> {
        let mut data = self.data.write().await;
        data.remove(&record);
        Ok(())
    }
}
