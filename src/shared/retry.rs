//! Bounded retry and polling loops.
//!
//! Both helpers sleep between iterations with a fixed delay and give up after a
//! fixed budget; neither ever spins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

/// Runs `op` until it succeeds, returns an error `is_retryable` rejects, or the
/// attempt budget is spent. `op` receives the 1-based attempt number.
pub fn retry_with<T, E, R, F>(policy: RetryPolicy, mut is_retryable: R, mut op: F) -> Result<T, E>
where
    R: FnMut(&E) -> bool,
    F: FnMut(u32) -> Result<T, E>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                if !policy.delay.is_zero() {
                    thread::sleep(policy.delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Calls `check` until it yields a value. Sleeps `interval` between calls and
/// fails through `on_timeout(waited, polls)` once `timeout` has elapsed.
pub fn poll_until<T, E, F, G>(policy: PollPolicy, mut check: F, on_timeout: G) -> Result<T, E>
where
    F: FnMut() -> Result<Option<T>, E>,
    G: FnOnce(Duration, u32) -> E,
{
    let started = Instant::now();
    let mut polls = 0_u32;
    loop {
        polls = polls.saturating_add(1);
        if let Some(value) = check()? {
            return Ok(value);
        }
        let waited = started.elapsed();
        if waited >= policy.timeout {
            return Err(on_timeout(waited, polls));
        }
        let remaining = policy.timeout - waited;
        thread::sleep(policy.interval.min(remaining));
    }
}

/// Sleeps up to `total` in short steps. Returns false as soon as `stop` is
/// set.
pub fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(50));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
