//! Time sources for the credit manager.
//!
//! Two clocks are involved. The authoritative clock counts seconds since
//! boot, keeps running while the machine is suspended and cannot be set by
//! the user; expiry is measured against it. The wallclock is ordinary Unix
//! time and is only used to carry the remaining credit across a reboot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::watch;

/// A source of time and timers.
///
/// All times are whole seconds.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Seconds on the authoritative, suspend-aware monotonic clock.
    fn time(&self) -> u64;

    /// Seconds since the Unix epoch, as shown to the user.
    fn wallclock_time(&self) -> u64;

    /// Completes once [`Clock::time`] has reached `deadline`.
    async fn sleep_until(&self, deadline: u64);
}

/// Longest single sleep. Tokio timers do not advance while suspended, so
/// the boot clock is re-read at least this often.
const MAX_SLEEP_SLICE: Duration = Duration::from_secs(60);

/// The real clocks of the machine.
///
/// On Linux the authoritative time is `CLOCK_BOOTTIME`. Elsewhere it falls
/// back to a monotonic `Instant` taken when the clock was created, which
/// does not count suspended time.
#[derive(Debug)]
pub struct SystemClock {
    #[cfg(not(target_os = "linux"))]
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "linux"))]
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn boot_time() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        // CLOCK_BOOTTIME exists on every kernel since 2.6.39
        tracing::warn!(
            error = %std::io::Error::last_os_error(),
            "clock_gettime(CLOCK_BOOTTIME) failed"
        );
        return 0;
    }
    u64::try_from(ts.tv_sec).unwrap_or(0)
}

#[async_trait]
impl Clock for SystemClock {
    fn time(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            boot_time()
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.origin.elapsed().as_secs()
        }
    }

    fn wallclock_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    async fn sleep_until(&self, deadline: u64) {
        loop {
            let now = self.time();
            if now >= deadline {
                return;
            }
            let remaining = Duration::from_secs(deadline - now).min(MAX_SLEEP_SLICE);
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Default authoritative time of a [`FakeClock`].
pub const FAKE_CLOCK_DEFAULT_TIME: u64 = 424_242;

/// Default wallclock time of a [`FakeClock`].
pub const FAKE_CLOCK_DEFAULT_WALLCLOCK_TIME: u64 = 1_231_006_505;

/// A manually driven clock for tests.
///
/// Time only moves when the test moves it. Tasks blocked in
/// [`Clock::sleep_until`] wake as soon as the fake time reaches their
/// deadline.
///
/// # Example
///
/// ```rust
/// use payg::credit::clock::{Clock, FakeClock};
///
/// # async fn example() {
/// let clock = FakeClock::new(100, 1_700_000_000);
/// clock.advance(5);
/// assert_eq!(clock.time(), 105);
/// clock.sleep_until(105).await;
/// # }
/// ```
#[derive(Debug)]
pub struct FakeClock {
    time: watch::Sender<u64>,
    wallclock_time: AtomicU64,
}

impl FakeClock {
    pub fn new(time: u64, wallclock_time: u64) -> Self {
        Self {
            time: watch::Sender::new(time),
            wallclock_time: AtomicU64::new(wallclock_time),
        }
    }

    /// Sets the authoritative time, waking any sleepers whose deadline passed.
    pub fn set_time(&self, time: u64) {
        self.time.send_replace(time);
    }

    /// Moves both clocks forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.time.send_modify(|time| *time = time.saturating_add(secs));
        self.wallclock_time.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set_wallclock_time(&self, wallclock_time: u64) {
        self.wallclock_time.store(wallclock_time, Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(FAKE_CLOCK_DEFAULT_TIME, FAKE_CLOCK_DEFAULT_WALLCLOCK_TIME)
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn time(&self) -> u64 {
        *self.time.borrow()
    }

    fn wallclock_time(&self) -> u64 {
        self.wallclock_time.load(Ordering::SeqCst)
    }

    async fn sleep_until(&self, deadline: u64) {
        let mut rx = self.time.subscribe();
        // The sender lives in `self`, so `wait_for` only fails if it is dropped
        let _ = rx.wait_for(|&time| time >= deadline).await;
    }
}
