//! TTL cache with event-driven invalidation.
//!
//! # Overview
//!
//! [`CacheManager`] stores values under keys derived from a cache domain and a
//! set of parameters. Entries expire after their TTL, the store is bounded by
//! `max_size`, and whole domains are dropped when the event bus announces a
//! write that makes them stale.
//!
//! ```text
//! ┌─────────────┐  OperationCreated   ┌──────────────┐
//! │  Event Bus  │────────────────────►│ Invalidation │
//! └─────────────┘                     │   handler    │
//!                                     └──────┬───────┘
//!                                            │ invalidate_domain("operations")
//!                                            ▼
//! ┌─────────────┐   get / set / has   ┌──────────────┐     ┌─────────┐
//! │ UI adapter  │────────────────────►│ CacheManager │◄────│ Sweeper │
//! └─────────────┘                     └──────────────┘     └─────────┘
//! ```
//!
//! # Keys
//!
//! `domain:k1:v1|k2:v2` with params sorted by name, so the order params are
//! supplied in never changes the key. The domain is everything before the
//! first `:` and is the unit of [`CacheManager::invalidate_domain`].
//!
//! # Expiry and eviction
//!
//! - An entry is expired once `now - created_at > ttl`. Reads treat it as
//!   absent and delete it (lazy expiry); the sweeper deletes the rest every
//!   `cleanup_interval`.
//! - When the store is full, inserting a new key evicts the entry created
//!   first. Reads do not refresh an entry (this is not an LRU).
//!
//! # Example
//!
//! ```
//! use pocketsync_core::event::DomainEvent;
//! use pocketsync_core::event_bus::EventBus;
//! use pocketsync_runtime::cache::{CacheConfig, CacheManager, CacheParams};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = Arc::new(EventBus::<DomainEvent>::new());
//! let cache = CacheManager::new(CacheConfig::default(), &bus)?;
//!
//! let params = CacheParams::new().with("account", "a1").with("page", 1);
//! cache.set("operations", &params, vec![1, 2, 3], None);
//! assert_eq!(cache.get("operations", &params), Some(vec![1, 2, 3]));
//!
//! bus.publish("OperationCreated", None);
//! assert_eq!(cache.get("operations", &params), None);
//! # Ok(())
//! # }
//! ```

use crate::error::ConfigError;
use crate::invalidation::InvalidationRules;
use chrono::{DateTime, Utc};
use pocketsync_core::environment::{Clock, SystemClock};
use pocketsync_core::event_bus::{EventBus, EventHandler, HandlerError, HandlerRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Cache configuration.
///
/// # Example
///
/// ```
/// use pocketsync_runtime::cache::CacheConfig;
/// use std::time::Duration;
///
/// let config = CacheConfig::default()
///     .with_default_ttl(Duration::from_secs(30))
///     .with_max_size(500);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when `set` is called without one
    #[serde(rename = "default_ttl_ms", with = "duration_ms")]
    pub default_ttl: Duration,
    /// Maximum number of entries
    pub max_size: usize,
    /// Period of the background sweep
    #[serde(rename = "cleanup_interval_ms", with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl CacheConfig {
    /// Create a configuration with custom values
    #[must_use]
    pub const fn new(default_ttl: Duration, max_size: usize, cleanup_interval: Duration) -> Self {
        Self {
            default_ttl,
            max_size,
            cleanup_interval,
        }
    }

    /// Set the default TTL
    #[must_use]
    pub const fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the maximum number of entries
    #[must_use]
    pub const fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the sweep period
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Check the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the capacity, default TTL or sweep period is zero.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.default_ttl.is_zero() {
            return Err(ConfigError::ZeroDefaultTtl);
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    /// 5 minute TTL, 100 entries, sweep every minute.
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_size: 100,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Parameters identifying an entry within a domain.
///
/// Values are stored in their `Display` form. Params are kept sorted by name,
/// which is what makes key derivation order-independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CacheParams(BTreeMap<String, String>);

impl CacheParams {
    /// No parameters
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Add a parameter
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.insert(name, value);
        self
    }

    /// Add or replace a parameter
    pub fn insert(&mut self, name: impl Into<String>, value: impl ToString) {
        self.0.insert(name.into(), value.to_string());
    }

    /// Whether there are no parameters
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for CacheParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Derive the cache key for `(domain, params)`.
///
/// ```
/// use pocketsync_runtime::cache::{CacheParams, cache_key};
///
/// let a = CacheParams::new().with("b", 2).with("a", 1);
/// assert_eq!(cache_key("d", &a), "d:a:1|b:2");
/// assert_eq!(cache_key("d", &CacheParams::new()), "d:");
/// ```
#[must_use]
pub fn cache_key(domain: &str, params: &CacheParams) -> String {
    let joined = params
        .0
        .iter()
        .map(|(name, value)| format!("{name}:{value}"))
        .collect::<Vec<_>>()
        .join("|");
    format!("{domain}:{joined}")
}

/// The domain segment of a key (everything before the first `:`).
#[must_use]
pub fn key_domain(key: &str) -> &str {
    key.split_once(':').map_or(key, |(domain, _)| domain)
}

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// `get` calls served from a live entry
    pub hits: u64,
    /// `get` calls that found nothing live
    pub misses: u64,
    /// Entries removed to respect `max_size`
    pub evictions: u64,
    /// Expired entries removed, lazily or by the sweeper
    pub expirations: u64,
    /// Entries removed by domain invalidation
    pub invalidations: u64,
    /// Entries currently stored (expired ones included until removed)
    pub entries: usize,
}

struct CacheEntry<V> {
    data: V,
    created_at: DateTime<Utc>,
    ttl: Duration,
    sequence: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        // A negative age (clock moved backwards) counts as fresh.
        (now - self.created_at)
            .to_std()
            .is_ok_and(|age| age > self.ttl)
    }
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_sequence: u64,
    stats: CacheStats,
}

impl<V> CacheInner<V> {
    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| (entry.created_at, entry.sequence))
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions += 1;
            metrics::counter!("cache_evictions_total").increment(1);
            tracing::debug!(key = %key, "Cache full, evicted oldest entry");
        }
    }

    fn remove_where(&mut self, mut matches: impl FnMut(&str, &CacheEntry<V>) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, entry| !matches(key.as_str(), &*entry));
        before - self.entries.len()
    }
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by the manager, its invalidation handler and its sweeper.
struct CacheShared<V> {
    id: u64,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> CacheShared<V> {
    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Intentional cast for metrics - entry count is bounded by max_size
    #[allow(clippy::cast_precision_loss)]
    fn record_size(&self, inner: &CacheInner<V>) {
        metrics::gauge!("cache_entries", "cache" => self.id.to_string())
            .set(inner.entries.len() as f64);
    }

    fn set(&self, key: String, data: V, ttl: Option<Duration>) {
        let created_at = self.clock.now();
        let mut guard = self.lock();
        let inner = &mut *guard;

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_size {
            inner.evict_oldest();
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.entries.insert(
            key,
            CacheEntry {
                data,
                created_at,
                ttl: ttl.unwrap_or(self.config.default_ttl),
                sequence,
            },
        );
        self.record_size(inner);
    }

    /// Look up a live entry, deleting it if it has expired.
    fn live(&self, inner: &mut CacheInner<V>, key: &str) -> Option<V> {
        let expired = inner.entries.get(key)?.is_expired(self.clock.now());
        if expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
            self.record_size(inner);
            metrics::counter!("cache_expirations_total").increment(1);
            tracing::trace!(key = key, "Cache entry expired on access");
            return None;
        }
        inner.entries.get(key).map(|entry| entry.data.clone())
    }

    fn get(&self, key: &str) -> Option<V> {
        let mut guard = self.lock();
        let value = self.live(&mut guard, key);
        if value.is_some() {
            guard.stats.hits += 1;
            metrics::counter!("cache_hits_total").increment(1);
        } else {
            guard.stats.misses += 1;
            metrics::counter!("cache_misses_total").increment(1);
        }
        value
    }

    fn has(&self, key: &str) -> bool {
        let mut guard = self.lock();
        self.live(&mut guard, key).is_some()
    }

    fn delete(&self, key: &str) -> bool {
        let mut guard = self.lock();
        let removed = guard.entries.remove(key).is_some();
        if removed {
            self.record_size(&guard);
        }
        removed
    }

    fn invalidate_domain(&self, domain: &str) -> usize {
        let mut guard = self.lock();
        let removed = guard.remove_where(|key, _| key_domain(key) == domain);
        guard.stats.invalidations += removed as u64;
        self.record_size(&guard);
        drop(guard);

        metrics::counter!("cache_invalidations_total").increment(removed as u64);
        tracing::debug!(domain = domain, removed = removed, "Invalidated cache domain");
        removed
    }

    fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.lock();
        let removed = guard.remove_where(|_, entry| entry.is_expired(now));
        guard.stats.expirations += removed as u64;
        self.record_size(&guard);
        drop(guard);

        if removed > 0 {
            metrics::counter!("cache_expirations_total").increment(removed as u64);
            tracing::debug!(removed = removed, "Swept expired cache entries");
        }
        removed
    }

    fn clear(&self) {
        let mut guard = self.lock();
        guard.entries.clear();
        self.record_size(&guard);
    }
}

/// Bus subscriber that drops the domains an event makes stale.
///
/// Holds the cache weakly so a forgotten subscription never keeps a dropped
/// cache alive.
struct InvalidationHandler<V> {
    cache: Weak<CacheShared<V>>,
    rules: Arc<InvalidationRules>,
}

impl<P, V> EventHandler<P> for InvalidationHandler<V>
where
    V: Clone + Send + Sync,
{
    fn handle(&self, event_name: &str, _payload: Option<&P>) -> Result<(), HandlerError> {
        let Some(cache) = self.cache.upgrade() else {
            return Ok(());
        };
        for domain in self.rules.domains_for(event_name) {
            cache.invalidate_domain(domain);
        }
        Ok(())
    }
}

type Detach = Box<dyn FnOnce() + Send>;

/// Domain-keyed TTL cache kept coherent by domain events.
///
/// Construction subscribes one invalidation handler to every event name in
/// the [`InvalidationRules`] and, when a Tokio runtime is available, starts the
/// background sweeper. Call [`stop`](Self::stop) to end the sweeper; dropping
/// the manager stops it and unsubscribes from the bus.
///
/// # Type Parameters
///
/// - `V`: cached value type, cloned out on every hit
pub struct CacheManager<V> {
    shared: Arc<CacheShared<V>>,
    rules: Arc<InvalidationRules>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    detach: Mutex<Option<Detach>>,
}

impl<V> CacheManager<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the default invalidation rules and the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails [`CacheConfig::validate`].
    pub fn new<P: 'static>(config: CacheConfig, bus: &Arc<EventBus<P>>) -> Result<Self, ConfigError> {
        Self::with_environment(
            config,
            bus,
            InvalidationRules::default_rules(),
            Arc::new(SystemClock),
        )
    }

    /// Create a cache with explicit invalidation rules and clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails [`CacheConfig::validate`].
    pub fn with_environment<P: 'static>(
        config: CacheConfig,
        bus: &Arc<EventBus<P>>,
        rules: InvalidationRules,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(CacheShared {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            clock,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                next_sequence: 0,
                stats: CacheStats::default(),
            }),
        });
        let rules = Arc::new(rules);

        let detach = Self::attach(&shared, &rules, bus);
        let sweeper = Self::spawn_sweeper(&shared);

        tracing::info!(
            cache = shared.id,
            max_size = config.max_size,
            default_ttl = ?config.default_ttl,
            cleanup_interval = ?config.cleanup_interval,
            sweeper = sweeper.is_some(),
            "Cache manager started"
        );

        Ok(Self {
            shared,
            rules,
            sweeper: Mutex::new(sweeper),
            detach: Mutex::new(Some(detach)),
        })
    }

    fn attach<P: 'static>(
        shared: &Arc<CacheShared<V>>,
        rules: &Arc<InvalidationRules>,
        bus: &Arc<EventBus<P>>,
    ) -> Detach {
        let handler: HandlerRef<P> = Arc::new(InvalidationHandler {
            cache: Arc::downgrade(shared),
            rules: Arc::clone(rules),
        });
        let names: Vec<String> = rules.event_names().into_iter().map(str::to_string).collect();

        for name in &names {
            bus.subscribe(name, Arc::clone(&handler));
        }

        let bus = Arc::clone(bus);
        Box::new(move || {
            for name in &names {
                bus.unsubscribe(name, &handler);
            }
        })
    }

    fn spawn_sweeper(shared: &Arc<CacheShared<V>>) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No Tokio runtime available, cache sweeper not started");
            return None;
        };

        let cache = Arc::downgrade(shared);
        let period = shared.config.cleanup_interval;
        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.cleanup_expired();
            }
        }))
    }

    /// Store `data` under `(domain, params)`.
    ///
    /// Uses `ttl` if given, otherwise the configured default. When the cache
    /// is full and the key is new, the oldest entry is evicted first.
    pub fn set(&self, domain: &str, params: &CacheParams, data: V, ttl: Option<Duration>) {
        self.shared.set(cache_key(domain, params), data, ttl);
    }

    /// The live value for `(domain, params)`, if any.
    #[must_use]
    pub fn get(&self, domain: &str, params: &CacheParams) -> Option<V> {
        self.shared.get(&cache_key(domain, params))
    }

    /// Whether a live value exists for `(domain, params)`.
    #[must_use]
    pub fn has(&self, domain: &str, params: &CacheParams) -> bool {
        self.shared.has(&cache_key(domain, params))
    }

    /// Remove one entry; returns whether it existed.
    pub fn delete(&self, domain: &str, params: &CacheParams) -> bool {
        self.shared.delete(&cache_key(domain, params))
    }

    /// Remove every entry of `domain`; returns how many were removed.
    pub fn invalidate_domain(&self, domain: &str) -> usize {
        self.shared.invalidate_domain(domain)
    }

    /// Apply the invalidation rule for `event_name` without going through the bus.
    pub fn invalidate_for_event(&self, event_name: &str) -> usize {
        self.rules
            .domains_for(event_name)
            .iter()
            .map(|domain| self.shared.invalidate_domain(domain))
            .sum()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Remove every expired entry now; returns how many were removed.
    ///
    /// This is what the sweeper runs every `cleanup_interval`.
    pub fn cleanup_expired(&self) -> usize {
        self.shared.cleanup_expired()
    }

    /// Cancel the background sweeper. Idempotent.
    pub fn stop(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
            tracing::info!("Cache sweeper stopped");
        }
    }

    /// Whether the background sweeper is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sweeper| !sweeper.is_finished())
    }

    /// Number of stored entries, expired ones included until removed
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.lock().entries.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Snapshot of the cache counters
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.shared.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }

    /// Process-unique id, used as the `cache` label of the `cache_entries` gauge
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The configuration in use
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// The invalidation table in use
    #[must_use]
    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }
}

impl<V> Drop for CacheManager<V> {
    fn drop(&mut self) {
        let sweeper = self
            .sweeper
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }

        let detach = self
            .detach
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(detach) = detach {
            detach();
        }

        metrics::gauge!("cache_entries", "cache" => self.shared.id.to_string()).set(0.0);
    }
}

impl<V> fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("id", &self.shared.id)
            .field("config", &self.shared.config)
            .field(
                "entries",
                &self
                    .shared
                    .inner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .len(),
            )
            .finish_non_exhaustive()
    }
}
