//! Pluggable durable storage for the credit state.
//!
//! State is split into a handful of small binary records, each stored
//! whole. Backends only move bytes around; encoding and validation live
//! with the manager.

use std::fmt;

use async_trait::async_trait;

use crate::credit::PaygError;

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// The records making up the persisted credit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateRecord {
    /// Absolute expiry on the authoritative clock, 8 bytes native-endian.
    ExpiryTime,
    /// Redeemed counters, one byte each, sorted ascending.
    UsedCounters,
    /// Wallclock time of the last save, 8 bytes native-endian.
    ClockTime,
    /// Credit remaining at the last save in seconds, 8 bytes native-endian.
    ExpirySeconds,
}

impl StateRecord {
    /// Every record, in the order they are written.
    pub const ALL: [StateRecord; 4] = [
        StateRecord::ExpiryTime,
        StateRecord::UsedCounters,
        StateRecord::ClockTime,
        StateRecord::ExpirySeconds,
    ];

    /// Name of the record, used as its file name.
    pub fn name(self) -> &'static str {
        match self {
            StateRecord::ExpiryTime => "expiry-time",
            StateRecord::UsedCounters => "used-counters",
            StateRecord::ClockTime => "clock-time",
            StateRecord::ExpirySeconds => "expiry-seconds",
        }
    }
}

impl fmt::Display for StateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Abstract storage backend for the credit state.
///
/// # Available Implementations
///
/// - [`FileStorage`] - one file per record in a private directory, written atomically
/// - [`MemoryStorage`] - in-memory map, for tests and ephemeral deployments
///
/// # Error Handling
///
/// Failures are reported as `PaygError::StorageError` with a message naming
/// [`StateStorage::location`] of the record.
///
/// # Example Implementation
///
/// ```rust
/// use payg::credit::storage::{StateRecord, StateStorage};
/// use payg::PaygError;
/// use async_trait::async_trait;
/// use std::collections::HashMap;
/// use std::sync::Mutex;
///
/// #[derive(Default)]
/// pub struct CustomStorage {
///     data: Mutex<HashMap<StateRecord, Vec<u8>>>,
/// }
///
/// #[async_trait]
/// impl StateStorage for CustomStorage {
///     async fn load(&self, record: StateRecord) -> Result<Option<Vec<u8>>, PaygError> {
///         Ok(self.data.lock().unwrap().get(&record).cloned())
///     }
///
///     async fn store(&self, record: StateRecord, data: Vec<u8>) -> Result<(), PaygError> {
///         self.data.lock().unwrap().insert(record, data);
///         Ok(())
///     }
///
///     async fn remove(&self, record: StateRecord) -> Result<(), PaygError> {
///         self.data.lock().unwrap().remove(&record);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait StateStorage: Send + Sync {
    /// Prepares the backend, e.g. creates the state directory.
    ///
    /// Called once by the manager builder before the first load.
    async fn init(&self) -> Result<(), PaygError> {
        Ok(())
    }

    /// Reads a whole record.
    ///
    /// # Returns
    ///
    /// * `Ok(Some(bytes))` - The record contents
    /// * `Ok(None)` - The record has never been written or was removed
    /// * `Err(PaygError)` - If the record exists but could not be read
    async fn load(&self, record: StateRecord) -> Result<Option<Vec<u8>>, PaygError>;

    /// Replaces a record. Readers must observe either the old or the new
    /// contents, never a mix.
    async fn store(&self, record: StateRecord, data: Vec<u8>) -> Result<(), PaygError>;

    /// Deletes a record. Removing a missing record succeeds.
    async fn remove(&self, record: StateRecord) -> Result<(), PaygError>;

    /// Human-readable location of a record, used in error messages.
    fn location(&self, record: StateRecord) -> String {
        record.name().to_string()
    }
}
