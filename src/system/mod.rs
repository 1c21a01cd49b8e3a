//! System utilities for embedded devices.
//!
//! The MQTT stack runs under single-threaded cooperative scheduling: nothing
//! is preempted and tasks only suspend at explicit yield points. This module
//! defines the [`Scheduler`] contract the stack uses for those yield points
//! and for every time measurement.
//!
//! On Embassy the implementation is a thin wrapper around `embassy_time`:
//!
//! ```rust,ignore
//! #[derive(Clone, Copy)]
//! struct EmbassyScheduler;
//!
//! impl Scheduler for EmbassyScheduler {
//!     fn now_ms(&self) -> u64 {
//!         embassy_time::Instant::now().as_millis()
//!     }
//!
//!     async fn sleep_ms(&self, ms: u64) {
//!         embassy_time::Timer::after_millis(ms).await
//!     }
//! }
//! ```

#![allow(async_fn_in_trait)]

/// Clock and cooperative sleep provided by the executor.
///
/// Implementations are expected to be cheap handles (`Clone` is required by
/// the client so every connection can carry its own copy).
pub trait Scheduler {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_ms(&self) -> u64;

    /// Suspend the calling task for at least `ms` milliseconds.
    ///
    /// A zero duration still yields to the other tasks.
    async fn sleep_ms(&self, ms: u64);

    /// Milliseconds elapsed since the timestamp `since`.
    fn elapsed_ms(&self, since: u64) -> u64 {
        self.now_ms().saturating_sub(since)
    }
}

impl<T: Scheduler> Scheduler for &T {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    async fn sleep_ms(&self, ms: u64) {
        (**self).sleep_ms(ms).await
    }

    fn elapsed_ms(&self, since: u64) -> u64 {
        (**self).elapsed_ms(since)
    }
}
