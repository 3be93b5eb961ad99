//! Encoding of the credit state into storage records, and the background
//! worker that writes it.
//!
//! The authoritative clock restarts from zero on every boot, so an absolute
//! expiry alone cannot be carried across a reboot. Each save therefore also
//! records the wallclock time and the credit remaining; on load the
//! remaining credit is reduced by the wallclock time elapsed since the save
//! and re-anchored at the current authoritative time.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::credit::PaygError;
use crate::credit::storage::{StateRecord, StateStorage};

/// Most counters that can ever be used with one key.
const MAX_USED_COUNTERS: usize = 256;

/// Credit state captured when a save is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateSnapshot {
    pub(crate) expiry_time: u64,
    pub(crate) used_counters: Vec<u8>,
    /// Authoritative time at the snapshot.
    pub(crate) time: u64,
    /// Wallclock time at the snapshot.
    pub(crate) wallclock_time: u64,
}

impl StateSnapshot {
    fn expiry_seconds(&self) -> u64 {
        if self.expiry_time == u64::MAX {
            u64::MAX
        } else {
            self.expiry_time.saturating_sub(self.time)
        }
    }
}

/// State recovered from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LoadedState {
    pub(crate) expiry_time: u64,
    pub(crate) used_counters: Vec<u8>,
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    Some(u64::from_ne_bytes(bytes.try_into().ok()?))
}

fn decode_used_counters(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() > MAX_USED_COUNTERS {
        return None;
    }
    let mut counters = bytes.to_vec();
    counters.sort_unstable();
    let len = counters.len();
    counters.dedup();
    (counters.len() == len).then_some(counters)
}

/// Decodes a loaded record, removing it from storage if it is corrupt.
async fn decode_or_discard<T>(
    storage: &dyn StateStorage,
    record: StateRecord,
    bytes: Option<Vec<u8>>,
    decode: fn(&[u8]) -> Option<T>,
) -> Result<Option<T>, PaygError> {
    let Some(bytes) = bytes else {
        return Ok(None);
    };
    if let Some(value) = decode(&bytes) {
        return Ok(Some(value));
    }

    let location = storage.location(record);
    warn!(record = %location, len = bytes.len(), "Discarding corrupt state record");
    if let Err(e) = storage.remove(record).await {
        warn!(record = %location, error = %e, "Failed to remove corrupt state record");
    }
    Err(PaygError::CorruptState(format!(
        "{location} has invalid contents ({} bytes)",
        bytes.len()
    )))
}

/// Loads the credit state as of authoritative time `now` and wallclock
/// time `wallclock_time`.
///
/// Missing records take their defaults: no counters used, and credit
/// expiring at `now`. A finite `expiry-time` is only trusted through
/// `clock-time` and `expiry-seconds`; on its own it is treated as expiring
/// at `now`. Every corrupt record is removed before the first
/// error is returned, so a retry succeeds.
pub(crate) async fn load_state(
    storage: &dyn StateStorage,
    now: u64,
    wallclock_time: u64,
) -> Result<LoadedState, PaygError> {
    let (expiry_time, used_counters, clock_time, expiry_seconds) = futures::join!(
        storage.load(StateRecord::ExpiryTime),
        storage.load(StateRecord::UsedCounters),
        storage.load(StateRecord::ClockTime),
        storage.load(StateRecord::ExpirySeconds),
    );

    let expiry_time =
        decode_or_discard(storage, StateRecord::ExpiryTime, expiry_time?, decode_u64).await;
    let used_counters = decode_or_discard(
        storage,
        StateRecord::UsedCounters,
        used_counters?,
        decode_used_counters,
    )
    .await;
    let clock_time =
        decode_or_discard(storage, StateRecord::ClockTime, clock_time?, decode_u64).await;
    let expiry_seconds =
        decode_or_discard(storage, StateRecord::ExpirySeconds, expiry_seconds?, decode_u64).await;

    let (expiry_time, used_counters, clock_time, expiry_seconds) =
        (expiry_time?, used_counters?, clock_time?, expiry_seconds?);

    let expiry_time = match (clock_time, expiry_seconds) {
        (_, Some(u64::MAX)) => u64::MAX,
        (Some(saved_at), Some(remaining)) => {
            // A wallclock that went backwards deducts nothing
            let elapsed = wallclock_time.saturating_sub(saved_at);
            now.saturating_add(remaining.saturating_sub(elapsed))
        }
        // Without both reboot records the expiry may be from an earlier boot
        _ if expiry_time == Some(u64::MAX) => u64::MAX,
        _ => now,
    };

    Ok(LoadedState {
        expiry_time,
        used_counters: used_counters.unwrap_or_default(),
    })
}

/// Awaits every operation and returns the first error in submission order.
/// Later errors are logged and dropped.
pub(crate) async fn join_first_error<F>(operations: impl IntoIterator<Item = F>) -> Result<(), PaygError>
where
    F: Future<Output = Result<(), PaygError>>,
{
    let mut first_error = None;
    for result in join_all(operations).await {
        if let Err(e) = result {
            if first_error.is_none() {
                first_error = Some(e);
            } else {
                debug!(error = %e, "Ignoring further persistence error");
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// Writes every record of `snapshot` in parallel.
pub(crate) async fn save_snapshot(
    storage: &dyn StateStorage,
    snapshot: &StateSnapshot,
) -> Result<(), PaygError> {
    let used_counters = if snapshot.used_counters.is_empty() {
        storage.remove(StateRecord::UsedCounters)
    } else {
        storage.store(StateRecord::UsedCounters, snapshot.used_counters.clone())
    };

    join_first_error([
        storage.store(
            StateRecord::ExpiryTime,
            snapshot.expiry_time.to_ne_bytes().to_vec(),
        ),
        used_counters,
        storage.store(
            StateRecord::ClockTime,
            snapshot.wallclock_time.to_ne_bytes().to_vec(),
        ),
        storage.store(
            StateRecord::ExpirySeconds,
            snapshot.expiry_seconds().to_ne_bytes().to_vec(),
        ),
    ])
    .await
}

enum PersistRequest {
    Save {
        snapshot: StateSnapshot,
        reply: Option<oneshot::Sender<Result<(), PaygError>>>,
    },
    Flush {
        reply: oneshot::Sender<Option<PaygError>>,
    },
}

/// Handle to the task that writes snapshots, one at a time, in the order
/// they were requested.
///
/// The task stops once the handle is dropped and every queued request has
/// been written.
#[derive(Debug)]
pub(crate) struct Persister {
    requests: mpsc::UnboundedSender<PersistRequest>,
}

impl Persister {
    pub(crate) fn spawn(storage: Arc<dyn StateStorage>) -> Self {
        let (requests, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(storage, receiver));
        Self { requests }
    }

    /// Queues a save nobody waits for. A failure is kept for the next
    /// [`Persister::flush`].
    pub(crate) fn save(&self, snapshot: StateSnapshot) {
        let request = PersistRequest::Save {
            snapshot,
            reply: None,
        };
        if self.requests.send(request).is_err() {
            warn!("Persistence worker has stopped; state not saved");
        }
    }

    /// Queues a save and returns a future resolving to its outcome.
    ///
    /// The save is queued before this returns; dropping the future does not
    /// cancel it.
    pub(crate) fn save_and_wait(
        &self,
        snapshot: StateSnapshot,
    ) -> impl Future<Output = Result<(), PaygError>> + Send + use<> {
        let (reply, outcome) = oneshot::channel();
        let request = PersistRequest::Save {
            snapshot,
            reply: Some(reply),
        };
        let queued = self.requests.send(request).is_ok();
        async move {
            if !queued {
                return Err(PaygError::ShutDown);
            }
            outcome.await.unwrap_or(Err(PaygError::ShutDown))
        }
    }

    /// Waits for every queued save and returns the first failure among the
    /// unattended ones since the previous flush.
    pub(crate) async fn flush(&self) -> Option<PaygError> {
        let (reply, outcome) = oneshot::channel();
        if self.requests.send(PersistRequest::Flush { reply }).is_err() {
            return Some(PaygError::ShutDown);
        }
        outcome.await.unwrap_or(Some(PaygError::ShutDown))
    }
}

async fn run_worker(
    storage: Arc<dyn StateStorage>,
    mut requests: mpsc::UnboundedReceiver<PersistRequest>,
) {
    let mut first_error: Option<PaygError> = None;

    while let Some(request) = requests.recv().await {
        match request {
            PersistRequest::Save {
                snapshot,
                reply: Some(reply),
            } => {
                let result = save_snapshot(storage.as_ref(), &snapshot).await;
                // The caller may have stopped waiting
                let _ = reply.send(result);
            }
            PersistRequest::Save {
                snapshot,
                reply: None,
            } => {
                if let Err(e) = save_snapshot(storage.as_ref(), &snapshot).await {
                    if first_error.is_none() {
                        warn!(error = %e, "Failed to save state");
                        first_error = Some(e);
                    } else {
                        debug!(error = %e, "Failed to save state again");
                    }
                }
            }
            PersistRequest::Flush { reply } => {
                let _ = reply.send(first_error.take());
            }
        }
    }

    debug!("Persistence worker stopped");
}
