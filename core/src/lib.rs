//! # Pocketsync Core
//!
//! Core types for the Pocketsync state synchronization layer.
//!
//! This crate provides the pieces every other layer of the finance app talks
//! through:
//!
//! - **Domain entities**: the records carried by domain events (operations,
//!   accounts, categories, goals)
//! - **Domain events**: the fixed `<Entity><Action>` vocabulary use-cases publish
//!   after a successful write
//! - **Event bus**: an in-process, synchronous publish/subscribe dispatcher
//! - **Environment**: injected dependencies such as the [`environment::Clock`]
//!
//! ## Example
//!
//! ```
//! use pocketsync_core::domain::Account;
//! use pocketsync_core::event::DomainEvent;
//! use pocketsync_core::event_bus::{EventBus, handler_fn};
//!
//! let bus: EventBus<DomainEvent> = EventBus::new();
//! bus.subscribe(
//!     "AccountCreated",
//!     handler_fn(|_name, event: Option<&DomainEvent>| {
//!         assert!(event.is_some());
//!         Ok(())
//!     }),
//! );
//!
//! let report = bus.publish_event(&DomainEvent::AccountCreated(Account::new("a1", "Checking")));
//! assert!(report.all_succeeded());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Domain entities carried as event payloads
pub mod domain;

/// Domain event vocabulary
pub mod event;

/// In-process publish/subscribe event bus
pub mod event_bus;

/// Environment module - Dependency injection traits
///
/// All external dependencies the synchronization layer needs are abstracted
/// behind traits and injected at construction time.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Cache expiry and the store's `last_updated` stamp both read the clock,
    /// so tests can drive time explicitly instead of sleeping.
    ///
    /// # Examples
    ///
    /// ```
    /// use pocketsync_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
