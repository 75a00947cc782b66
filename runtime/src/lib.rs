//! # Pocketsync Runtime
//!
//! Runtime pieces that keep UI-facing state coherent with domain writes.
//!
//! ## Core Components
//!
//! - **Cache Manager**: domain-keyed TTL cache, bounded, swept in the background
//! - **Invalidation Rules**: table from domain event to the cache domains it stales
//! - **Application Store**: loading/error/collection state with change listeners
//!
//! ## Example
//!
//! ```
//! use pocketsync_core::event::DomainEvent;
//! use pocketsync_core::event_bus::EventBus;
//! use pocketsync_runtime::cache::{CacheConfig, CacheParams};
//! use pocketsync_runtime::store::{ApplicationStore, CachedData, StatePatch};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(EventBus::<DomainEvent>::new());
//! let store = ApplicationStore::new(CacheConfig::default(), &bus)?;
//!
//! let subscription = store.subscribe(|state| println!("loading = {}", state.loading));
//! store.set_state(StatePatch::new().loading(true));
//! subscription.unsubscribe();
//!
//! store.set_cached_data("accounts", &CacheParams::new(), CachedData::Accounts(vec![]), None);
//! bus.publish("AccountCreated", None);
//! assert!(!store.has_cached_data("accounts", &CacheParams::new()));
//! # Ok(())
//! # }
//! ```

/// TTL cache with event-driven invalidation
pub mod cache;

/// Event to cache-domain invalidation table
pub mod invalidation;

/// Application state store
pub mod store;

/// Prometheus metrics for observability
pub mod metrics;

/// Error types for the runtime
pub mod error {
    use thiserror::Error;

    /// Invalid cache configuration
    ///
    /// Returned when constructing a cache manager (or a store owning one) from a
    /// configuration that could never hold or keep an entry.
    #[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ConfigError {
        /// `max_size` is zero
        #[error("Cache max_size must be at least 1")]
        ZeroCapacity,

        /// `default_ttl` is zero
        #[error("Cache default_ttl must be greater than zero")]
        ZeroDefaultTtl,

        /// `cleanup_interval` is zero
        ///
        /// A zero period would make the sweeper spin.
        #[error("Cache cleanup_interval must be greater than zero")]
        ZeroCleanupInterval,
    }
}

pub use cache::{CacheConfig, CacheManager, CacheParams, CacheStats};
pub use error::ConfigError;
pub use invalidation::{InvalidationRules, domains};
pub use store::{AppState, ApplicationStore, CachedData, StatePatch, Subscription};
