//! Single-shot connection timer
//!
//! Schedules one delayed callback on the runtime that drives a connection and
//! hands back a handle that can cancel it. Cancellation and expiry race on a
//! single atomic state word, so exactly one of them takes effect.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Errors that can occur when scheduling a timer
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("Timer delay must be positive")]
    NonPositiveDelay,

    #[error("No tokio runtime available to schedule the timer")]
    NoRuntime,
}

/// Result type for timer operations
pub type TimerResult<T> = Result<T, TimerError>;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELED: u8 = 2;

/// Schedules delayed callbacks on one connection's runtime
#[derive(Debug, Clone)]
pub struct ConnectionTimer {
    handle: Handle,
}

impl ConnectionTimer {
    /// Create a timer that schedules onto the given runtime
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a timer bound to the runtime of the calling task
    pub fn current() -> TimerResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| TimerError::NoRuntime)
    }

    /// Run `callback` once `delay` has elapsed
    ///
    /// A zero delay is a caller bug: immediate and disabled close policies
    /// never reach the timer, so it is rejected instead of firing at once.
    pub fn arm<F>(&self, delay: Duration, callback: F) -> TimerResult<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            return Err(TimerError::NonPositiveDelay);
        }

        let state = Arc::new(AtomicU8::new(ARMED));
        let task_state = Arc::clone(&state);

        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if task_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                callback();
            }
        });

        Ok(TimerHandle { state, task })
    }
}

/// Handle to an armed timer
///
/// Dropping the handle cancels the timer if it has not fired yet.
#[derive(Debug)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    /// Prevent the callback from running
    ///
    /// Returns `true` if this call won the race against expiry. Returns
    /// `false` when the callback already ran (or is running) or the timer
    /// was cancelled before.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ARMED, CANCELED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.task.abort();
        }
        won
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        (count, move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_current_outside_runtime() {
        assert_eq!(ConnectionTimer::current().unwrap_err(), TimerError::NoRuntime);
    }

    #[tokio::test]
    async fn test_zero_delay_rejected() {
        let timer = ConnectionTimer::current().unwrap();
        let (count, callback) = counter();
        let result = timer.arm(Duration::ZERO, callback);
        assert_eq!(result.unwrap_err(), TimerError::NonPositiveDelay);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay_not_before() {
        let timer = ConnectionTimer::current().unwrap();
        let (count, callback) = counter();
        let handle = timer.arm(Duration::from_millis(100), callback).unwrap();

        tokio::time::sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Expiry already won
        assert!(!handle.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let timer = ConnectionTimer::current().unwrap();
        let (count, callback) = counter();
        let handle = timer.arm(Duration::from_millis(100), callback).unwrap();

        assert!(handle.cancel());
        assert!(!handle.cancel());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_noop() {
        let timer = ConnectionTimer::current().unwrap();
        let (count, callback) = counter();
        let handle = timer.arm(Duration::from_millis(10), callback).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.cancel());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let timer = ConnectionTimer::current().unwrap();
        let (count, callback) = counter();
        drop(timer.arm(Duration::from_millis(10), callback).unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
