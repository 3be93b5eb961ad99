use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::codes::{self, Period};
use super::persist::{self, Persister, StateSnapshot};
use super::rate_limit::RateLimiter;
use super::{CreditManagerBuilder, PaygConfig, PaygError, SharedKey};
use crate::credit::storage::{MemoryStorage, StateStorage};

/// Capacity of the event channel; slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by an enabled [`CreditManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreditEvent {
    /// The expiry time changed to the given value.
    ExpiryTimeChanged(u64),
    /// The rate limit end time changed; 0 means attempts are allowed.
    ///
    /// Sent when the limit trips and again, on its own, when it lifts.
    RateLimitEndTimeChanged(u64),
    /// Credit ran out.
    Expired,
}

/// A point-in-time view of a manager, for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditStatus {
    pub enabled: bool,
    pub expiry_time: u64,
    pub expired: bool,
    /// Seconds of credit left, or `None` if credit never expires.
    pub seconds_remaining: Option<u64>,
    pub rate_limit_end_time: u64,
    pub used_counters: usize,
}

/// Owns the credit state of the machine and redeems top-up codes.
///
/// The manager is driven from a single task: [`CreditManager::add_code`]
/// and [`CreditManager::clear_code`] take `&mut self` and update the
/// in-memory state before they return. Each change is then written to
/// storage in the background, in call order.
///
/// When credit runs out a [`CreditEvent::Expired`] is broadcast to
/// [`subscribers`](CreditManager::subscribe). The expiry timer runs on the
/// authoritative clock, so changing the wallclock has no effect on it.
///
/// To create an instance, use the `CreditManager::builder()` method.
///
/// # Example
///
/// ```rust
/// use payg::credit::codes::{calculate_code, format_code, Period};
/// use payg::CreditManager;
///
/// # async fn example() -> Result<(), payg::PaygError> {
/// let key = vec![b'k'; 64];
/// let mut manager = CreditManager::builder()
///     .with_key(key.clone())
///     .build_and_init()
///     .await?;
///
/// let code = calculate_code(Period::OneDay, 0, &key)?;
/// manager.add_code_now(&format_code(code))?;
/// assert!(!manager.status().expired);
///
/// manager.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct CreditManager<S: StateStorage> {
    /// `None` when enforcement is disabled.
    key: Option<SharedKey>,
    config: PaygConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<S>,
    persister: Persister,
    events: broadcast::Sender<CreditEvent>,
    expiry_time: u64,
    used_counters: Vec<u8>,
    rate_limiter: RateLimiter,
    /// Last published rate limit end time, shared with `rate_limit_timer`.
    rate_limit_end_time: Arc<AtomicU64>,
    timer: Option<JoinHandle<()>>,
    rate_limit_timer: Option<JoinHandle<()>>,
    /// Nothing is written back until state has been loaded, so a failed
    /// load never overwrites good records with defaults.
    state_loaded: bool,
    shut_down: bool,
}

impl CreditManager<MemoryStorage> {
    /// Creates a new `CreditManagerBuilder`.
    ///
    /// The builder defaults to `MemoryStorage`; production deployments pass
    /// a `FileStorage` with `.with_storage()`.
    pub fn builder() -> CreditManagerBuilder<MemoryStorage> {
        CreditManagerBuilder::new()
    }
}

impl<S: StateStorage + 'static> CreditManager<S> {
    /// Internal constructor used by the builder.
    pub(crate) fn new(
        key: Option<SharedKey>,
        config: PaygConfig,
        clock: Arc<dyn Clock>,
        storage: Arc<S>,
    ) -> Self {
        let persister = Persister::spawn(storage.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let rate_limiter = RateLimiter::new(
            config.rate_limit_attempts,
            config.rate_limit_window.as_secs(),
        );
        Self {
            key,
            config,
            clock,
            storage,
            persister,
            events,
            expiry_time: 0,
            used_counters: Vec::new(),
            rate_limiter,
            rate_limit_end_time: Arc::new(AtomicU64::new(0)),
            timer: None,
            rate_limit_timer: None,
            state_loaded: false,
            shut_down: false,
        }
    }
}

impl<S: StateStorage> CreditManager<S> {
    /// Whether credit enforcement is on. Fixed at construction.
    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Absolute time, on the authoritative clock, at which credit runs out.
    ///
    /// `u64::MAX` means never; 0 is returned when disabled.
    pub fn expiry_time(&self) -> u64 {
        if self.enabled() { self.expiry_time } else { 0 }
    }

    /// Time at which failed attempts stop being rejected, or 0 if they are
    /// not being rejected.
    pub fn rate_limit_end_time(&self) -> u64 {
        if !self.enabled() {
            return 0;
        }
        self.rate_limiter.end_time(self.clock.time())
    }

    /// Counters redeemed so far, ascending.
    pub fn used_counters(&self) -> &[u8] {
        &self.used_counters
    }

    /// Regular expression a code must match, for input widgets.
    pub fn code_format(&self) -> &'static str {
        codes::CODE_FORMAT
    }

    pub fn config(&self) -> &PaygConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Receives every event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CreditEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> CreditStatus {
        let now = self.clock.time();
        let expiry_time = self.expiry_time();
        let enabled = self.enabled();
        CreditStatus {
            enabled,
            expiry_time,
            expired: enabled && now >= expiry_time,
            seconds_remaining: if expiry_time == u64::MAX {
                None
            } else {
                Some(expiry_time.saturating_sub(now))
            },
            rate_limit_end_time: self.rate_limit_end_time(),
            used_counters: self.used_counters.len(),
        }
    }

    /// Redeems `code_str` as of authoritative time `now`.
    ///
    /// Checks run in this order, and the first failure is returned:
    ///
    /// 1. [`PaygError::Disabled`] if enforcement is off
    /// 2. [`PaygError::TooManyAttempts`] if the rate limit is tripped; no
    ///    further work is done and the attempt is not counted
    /// 3. [`PaygError::InvalidCode`] if `code_str` is not 8 digits below 2^26
    /// 4. [`PaygError::InvalidPeriod`] or [`PaygError::InvalidSignature`] if
    ///    the code does not verify
    /// 5. [`PaygError::CodeAlreadyUsed`] if its counter was redeemed before
    ///
    /// Failures from steps 4 and 5 count toward the rate limit; step 3 does
    /// when `count_malformed_attempts` is set. Failures never change the
    /// credit state.
    ///
    /// On success the counter is marked used, the expiry becomes
    /// `max(now, expiry) + period` (saturating), the timer is re-armed, the
    /// attempt history is cleared and a save is queued.
    pub fn add_code(&mut self, code_str: &str, now: u64) -> Result<(), PaygError> {
        if !self.enabled() {
            return Err(PaygError::Disabled);
        }

        self.rate_limiter.check(now)?;
        self.update_rate_limit_end_time(now);

        let verified = match &self.key {
            Some(key) => {
                codes::parse_code(code_str).and_then(|code| codes::verify_code(code, key.as_bytes()))
            }
            None => return Err(PaygError::Disabled),
        };

        let (period, counter) = match verified {
            Ok(verified) => verified,
            Err(e) => {
                let counted = e.is_counted_attempt()
                    || (matches!(e, PaygError::InvalidCode(_))
                        && self.config.count_malformed_attempts);
                debug!(error = %e, counted, "Rejected code");
                if counted {
                    self.record_failed_attempt(now);
                }
                return Err(e);
            }
        };

        let position = match self.used_counters.binary_search(&counter) {
            Ok(_) => {
                debug!(counter, "Rejected reused code");
                self.record_failed_attempt(now);
                return Err(PaygError::CodeAlreadyUsed);
            }
            Err(position) => position,
        };
        self.used_counters.insert(position, counter);

        let new_expiry = extend_expiry(self.expiry_time, now, period);
        info!(%period, counter, expiry_time = new_expiry, "Accepted code");
        self.set_expiry_time(new_expiry);

        self.rate_limiter.reset();
        self.update_rate_limit_end_time(now);

        self.request_save();
        Ok(())
    }

    /// [`CreditManager::add_code`] at the current authoritative time.
    pub fn add_code_now(&mut self, code_str: &str) -> Result<(), PaygError> {
        let now = self.clock.time();
        self.add_code(code_str, now)
    }

    /// Ends the current credit at once.
    ///
    /// The expiry time is reset to 0, the pending timer is cancelled and
    /// [`CreditEvent::Expired`] is emitted immediately. Used counters are
    /// kept.
    pub fn clear_code(&mut self) -> Result<(), PaygError> {
        if !self.enabled() {
            return Err(PaygError::Disabled);
        }

        self.cancel_timer();
        if self.expiry_time != 0 {
            self.expiry_time = 0;
            self.notify(CreditEvent::ExpiryTimeChanged(0));
        }
        info!("Credit cleared");
        self.notify(CreditEvent::Expired);

        self.request_save();
        Ok(())
    }

    /// Writes the current state and resolves once it is durable.
    ///
    /// The save is queued when this is called, behind any save already
    /// queued. Dropping the returned future does not cancel it. Does nothing
    /// when disabled.
    pub fn save_state(&self) -> impl Future<Output = Result<(), PaygError>> + Send + use<S> {
        let pending = (self.enabled() && self.state_loaded)
            .then(|| self.persister.save_and_wait(self.snapshot()));
        async move {
            match pending {
                Some(pending) => pending.await,
                None => Ok(()),
            }
        }
    }

    /// Stops the manager.
    ///
    /// Waits for every queued save, then writes the final state. Returns
    /// the first error from a background save since the last shutdown or,
    /// failing that, the error from the final save.
    pub async fn shutdown(mut self) -> Result<(), PaygError> {
        self.cancel_timer();
        self.cancel_rate_limit_timer();
        self.shut_down = true;

        if !self.enabled() || !self.state_loaded {
            return Ok(());
        }

        let background = self.persister.flush().await;
        let last = self.persister.save_and_wait(self.snapshot()).await;
        debug!("Credit manager shut down");

        match (background, last) {
            (Some(e), Err(later)) => {
                debug!(error = %later, "Final save also failed");
                Err(e)
            }
            (Some(e), Ok(())) => Err(e),
            (None, result) => result,
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            expiry_time: self.expiry_time,
            used_counters: self.used_counters.clone(),
            time: self.clock.time(),
            wallclock_time: self.clock.wallclock_time(),
        }
    }

    fn request_save(&self) {
        if self.state_loaded {
            self.persister.save(self.snapshot());
        }
    }

    fn notify(&self, event: CreditEvent) {
        if self.enabled() {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn record_failed_attempt(&mut self, now: u64) {
        self.rate_limiter.record(now);
        self.update_rate_limit_end_time(now);
    }

    fn update_rate_limit_end_time(&mut self, now: u64) {
        let end_time = self.rate_limiter.end_time(now);
        let published = self.rate_limit_end_time.swap(end_time, Ordering::SeqCst);
        if end_time != published {
            if end_time != 0 {
                warn!(until = end_time, "Too many failed code attempts");
            }
            self.notify(CreditEvent::RateLimitEndTimeChanged(end_time));
            self.arm_rate_limit_timer(end_time);
        }
    }

    /// Arms a timer publishing `RateLimitEndTimeChanged(0)` once the limit
    /// lifts, unless a call to `add_code` published a change first.
    fn arm_rate_limit_timer(&mut self, end_time: u64) {
        self.cancel_rate_limit_timer();
        if !self.enabled() || end_time == 0 {
            return;
        }

        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let published = Arc::clone(&self.rate_limit_end_time);
        self.rate_limit_timer = Some(tokio::spawn(async move {
            clock.sleep_until(end_time).await;
            if published
                .compare_exchange(end_time, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                debug!(end_time, "Rate limit lifted");
                let _ = events.send(CreditEvent::RateLimitEndTimeChanged(0));
            }
        }));
    }

    fn cancel_rate_limit_timer(&mut self) {
        if let Some(timer) = self.rate_limit_timer.take() {
            timer.abort();
        }
    }

    fn set_expiry_time(&mut self, expiry_time: u64) {
        if expiry_time != self.expiry_time {
            self.expiry_time = expiry_time;
            self.notify(CreditEvent::ExpiryTimeChanged(expiry_time));
        }
        self.arm_timer();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Arms a timer emitting `Expired` once the authoritative clock reaches
    /// the expiry time. An expiry already in the past fires at once.
    fn arm_timer(&mut self) {
        self.cancel_timer();
        if !self.enabled() || self.expiry_time == u64::MAX {
            return;
        }

        let clock = Arc::clone(&self.clock);
        let events = self.events.clone();
        let deadline = self.expiry_time;
        self.timer = Some(tokio::spawn(async move {
            clock.sleep_until(deadline).await;
            info!(expiry_time = deadline, "Credit expired");
            let _ = events.send(CreditEvent::Expired);
        }));
    }
}

impl<S: StateStorage + 'static> CreditManager<S> {
    /// Replaces the in-memory state with what storage holds.
    ///
    /// Missing records are not an error. A corrupt record is deleted and
    /// reported as [`PaygError::CorruptState`]; calling this again then
    /// succeeds. On failure the in-memory state is left untouched. After a
    /// successful load the reconstructed state is saved straight away.
    ///
    /// Does nothing when disabled.
    pub async fn load_state(&mut self) -> Result<(), PaygError> {
        if !self.enabled() {
            return Ok(());
        }

        let now = self.clock.time();
        let loaded =
            persist::load_state(self.storage.as_ref(), now, self.clock.wallclock_time()).await?;
        debug!(
            expiry_time = loaded.expiry_time,
            used_counters = loaded.used_counters.len(),
            "Loaded state"
        );

        self.used_counters = loaded.used_counters;
        self.set_expiry_time(loaded.expiry_time);
        self.state_loaded = true;
        self.request_save();
        Ok(())
    }
}

impl<S: StateStorage> Drop for CreditManager<S> {
    fn drop(&mut self) {
        self.cancel_timer();
        self.cancel_rate_limit_timer();
        if !self.shut_down && self.enabled() {
            // Best effort; the worker drains the queue after we are gone
            self.request_save();
        }
    }
}

/// `max(now, expiry) + period`, saturating. Infinite credit never expires.
fn extend_expiry(expiry_time: u64, now: u64, period: Period) -> u64 {
    match period.duration_secs() {
        Some(span) => expiry_time.max(now).saturating_add(span),
        None => u64::MAX,
    }
}
