//! # Pocketsync Testing
//!
//! Testing utilities and helpers for Pocketsync.
//!
//! This crate provides:
//! - Deterministic clocks for TTL and timestamp assertions
//! - Event handlers that record or fail on demand
//! - Tracing setup for test output
//!
//! ## Example
//!
//! ```
//! use pocketsync_core::event_bus::{EventBus, HandlerRef};
//! use pocketsync_testing::RecordingHandler;
//! use std::sync::Arc;
//!
//! let bus: EventBus<String> = EventBus::new();
//! let recorder = Arc::new(RecordingHandler::<String>::new());
//! bus.subscribe("E", Arc::clone(&recorder) as HandlerRef<String>);
//!
//! bus.publish("E", Some(&"payload".to_string()));
//! assert_eq!(recorder.payloads(), vec![Some("payload".to_string())]);
//! ```

use chrono::{DateTime, Utc};
use pocketsync_core::environment::Clock;

/// Recording and failing event handlers
pub mod handlers;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to a cache and
    /// advance the other.
    ///
    /// # Example
    ///
    /// ```
    /// use pocketsync_testing::mocks::ManualClock;
    /// use pocketsync_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::at_test_epoch();
    /// let handle = clock.clone();
    /// let start = clock.now();
    ///
    /// handle.advance(Duration::from_millis(15));
    /// assert_eq!((clock.now() - start).num_milliseconds(), 15);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a manual clock starting at `time`
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Create a manual clock starting at the test epoch
        #[must_use]
        pub fn at_test_epoch() -> Self {
            Self::new(test_epoch())
        }

        /// Move time forward
        ///
        /// # Panics
        ///
        /// Panics if `by` does not fit in a `chrono::TimeDelta`.
        #[allow(clippy::expect_used)]
        pub fn advance(&self, by: Duration) {
            let by = chrono::TimeDelta::from_std(by).expect("test durations fit in a TimeDelta");
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// The instant test clocks start at: 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }
}

/// Install a `tracing` subscriber for test output.
///
/// Honors `RUST_LOG`, defaults to `debug`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use handlers::{FailingHandler, RecordingHandler};
pub use mocks::{ManualClock, test_epoch};
