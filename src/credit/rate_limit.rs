use std::collections::VecDeque;

use crate::credit::PaygError;

/// Sliding-window limiter for failed code attempts.
///
/// Timestamps are on the authoritative clock. An attempt stays in the
/// window while `timestamp + window > now`; once `max_attempts` are in the
/// window the limiter is tripped until the oldest of them ages out.
#[derive(Debug, Clone)]
pub(crate) struct RateLimiter {
    max_attempts: usize,
    window: u64,
    attempts: VecDeque<u64>,
}

impl RateLimiter {
    /// A limiter allowing `max_attempts` failures per `window` seconds.
    /// `max_attempts == 0` never trips.
    pub(crate) fn new(max_attempts: usize, window: u64) -> Self {
        Self {
            max_attempts,
            window,
            attempts: VecDeque::with_capacity(max_attempts),
        }
    }

    fn prune(&mut self, now: u64) {
        while let Some(&oldest) = self.attempts.front() {
            if oldest.saturating_add(self.window) > now {
                break;
            }
            self.attempts.pop_front();
        }
    }

    /// Fails with `TooManyAttempts` if the limiter is tripped at `now`.
    pub(crate) fn check(&mut self, now: u64) -> Result<(), PaygError> {
        self.prune(now);
        match self.end_time(now) {
            0 => Ok(()),
            retry_at => Err(PaygError::TooManyAttempts { retry_at }),
        }
    }

    /// Records a failed attempt at `now`.
    pub(crate) fn record(&mut self, now: u64) {
        if self.max_attempts == 0 {
            return;
        }
        self.prune(now);
        self.attempts.push_back(now);
        // Only the most recent `max_attempts` can ever matter
        while self.attempts.len() > self.max_attempts {
            self.attempts.pop_front();
        }
    }

    /// Forgets all recorded attempts.
    pub(crate) fn reset(&mut self) {
        self.attempts.clear();
    }

    /// Time at which the limit lifts, or 0 if it is not tripped at `now`.
    pub(crate) fn end_time(&self, now: u64) -> u64 {
        if self.max_attempts == 0 {
            return 0;
        }
        let live = self
            .attempts
            .iter()
            .copied()
            .skip_while(|&ts| ts.saturating_add(self.window) <= now);
        let mut count = 0;
        let mut oldest = None;
        for ts in live {
            oldest.get_or_insert(ts);
            count += 1;
        }
        match oldest {
            Some(oldest) if count >= self.max_attempts => oldest.saturating_add(self.window),
            _ => 0,
        }
    }
}
