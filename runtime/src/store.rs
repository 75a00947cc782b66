//! Application state store.
//!
//! [`ApplicationStore`] is the one place UI adapters read and write
//! cross-cutting request state (loading flag, last error, entity collections)
//! and get told when it changes. Caching is delegated to an owned
//! [`CacheManager`], so adapters go through a single object for both.
//!
//! Every [`set_state`](ApplicationStore::set_state) replaces the whole state
//! record and notifies every listener, even when nothing changed.
//!
//! # Delivery order
//!
//! Listeners see states in the order they were written, whichever thread wrote
//! them. Each new state is queued while the state lock is still held, and one
//! caller at a time drains the queue. A `set_state` that finds a drain already
//! running (on another thread, or re-entrantly from a listener) returns once
//! its state is queued; the running drain delivers it.

use crate::cache::{CacheConfig, CacheManager, CacheParams};
use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use pocketsync_core::domain::{Account, Category, Goal, Operation};
use pocketsync_core::environment::{Clock, SystemClock};
use pocketsync_core::event_bus::EventBus;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

/// Application-wide UI state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppState {
    /// Loaded operations
    pub operations: Vec<Operation>,
    /// Loaded accounts
    pub accounts: Vec<Account>,
    /// Loaded categories
    pub categories: Vec<Category>,
    /// Loaded goals
    pub goals: Vec<Goal>,
    /// Whether a request is in flight
    pub loading: bool,
    /// Message of the last failed request
    pub error: Option<String>,
    /// When the state was last replaced
    pub last_updated: DateTime<Utc>,
}

impl AppState {
    /// Empty collections, not loading, no error.
    #[must_use]
    pub const fn initial(now: DateTime<Utc>) -> Self {
        Self {
            operations: Vec::new(),
            accounts: Vec::new(),
            categories: Vec::new(),
            goals: Vec::new(),
            loading: false,
            error: None,
            last_updated: now,
        }
    }

    fn merge(self, patch: StatePatch, now: DateTime<Utc>) -> Self {
        Self {
            operations: patch.operations.unwrap_or(self.operations),
            accounts: patch.accounts.unwrap_or(self.accounts),
            categories: patch.categories.unwrap_or(self.categories),
            goals: patch.goals.unwrap_or(self.goals),
            loading: patch.loading.unwrap_or(self.loading),
            error: patch.error.unwrap_or(self.error),
            last_updated: now,
        }
    }
}

/// A partial update to [`AppState`]. Fields left `None` keep their value.
///
/// # Example
///
/// ```
/// use pocketsync_runtime::store::StatePatch;
///
/// let patch = StatePatch::new().loading(false).error(Some("offline".to_string()));
/// assert_eq!(patch.loading, Some(false));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatePatch {
    /// Replacement operations
    pub operations: Option<Vec<Operation>>,
    /// Replacement accounts
    pub accounts: Option<Vec<Account>>,
    /// Replacement categories
    pub categories: Option<Vec<Category>>,
    /// Replacement goals
    pub goals: Option<Vec<Goal>>,
    /// New loading flag
    pub loading: Option<bool>,
    /// New error; `Some(None)` clears it
    pub error: Option<Option<String>>,
}

impl StatePatch {
    /// An empty patch
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace operations
    #[must_use]
    pub fn operations(mut self, operations: Vec<Operation>) -> Self {
        self.operations = Some(operations);
        self
    }

    /// Replace accounts
    #[must_use]
    pub fn accounts(mut self, accounts: Vec<Account>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    /// Replace categories
    #[must_use]
    pub fn categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = Some(categories);
        self
    }

    /// Replace goals
    #[must_use]
    pub fn goals(mut self, goals: Vec<Goal>) -> Self {
        self.goals = Some(goals);
        self
    }

    /// Set the loading flag
    #[must_use]
    pub const fn loading(mut self, loading: bool) -> Self {
        self.loading = Some(loading);
        self
    }

    /// Set or clear the error
    #[must_use]
    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }
}

/// Values the store caches on behalf of UI adapters.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedData {
    /// A page or list of operations
    Operations(Vec<Operation>),
    /// Accounts
    Accounts(Vec<Account>),
    /// Categories
    Categories(Vec<Category>),
    /// Goals
    Goals(Vec<Goal>),
    /// Anything else, e.g. a financial summary computed by a use-case
    Json(serde_json::Value),
}

type Listener = Arc<dyn Fn(&AppState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

#[derive(Default)]
struct Delivery {
    pending: VecDeque<AppState>,
    draining: bool,
}

/// Handle returned by [`ApplicationStore::subscribe`].
///
/// Dropping the handle keeps the listener registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl Subscription {
    /// Remove exactly the listener this handle was returned for.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Observer-pattern store for application state, owning the cache.
pub struct ApplicationStore {
    state: RwLock<AppState>,
    listeners: Arc<Mutex<Listeners>>,
    delivery: Mutex<Delivery>,
    cache: CacheManager<CachedData>,
    clock: Arc<dyn Clock>,
}

impl ApplicationStore {
    /// Create a store whose cache listens on `bus`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn new<P: 'static>(config: CacheConfig, bus: &Arc<EventBus<P>>) -> Result<Self, ConfigError> {
        let cache = CacheManager::new(config, bus)?;
        Ok(Self::with_cache(cache, Arc::new(SystemClock)))
    }

    /// Create a store around an existing cache and clock.
    #[must_use]
    pub fn with_cache(cache: CacheManager<CachedData>, clock: Arc<dyn Clock>) -> Self {
        let state = AppState::initial(clock.now());
        Self {
            state: RwLock::new(state),
            listeners: Arc::new(Mutex::new(Listeners::default())),
            delivery: Mutex::new(Delivery::default()),
            cache,
            clock,
        }
    }

    /// A copy of the current state.
    #[must_use]
    pub fn get_state(&self) -> AppState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge `patch` into the state, then notify every listener.
    ///
    /// See the module docs for how deliveries from concurrent writers are ordered.
    pub fn set_state(&self, patch: StatePatch) {
        let now = self.clock.now();
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let current = std::mem::replace(&mut *state, AppState::initial(now));
            *state = current.merge(patch, now);

            tracing::trace!(loading = state.loading, error = ?state.error, "State updated");
            // Queued under the state lock so queue order is write order.
            self.lock_delivery().pending.push_back(state.clone());
        }

        metrics::counter!("store_state_updates_total").increment(1);
        self.drain();
    }

    fn lock_delivery(&self) -> MutexGuard<'_, Delivery> {
        self.delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(&self) {
        {
            let mut delivery = self.lock_delivery();
            if delivery.draining {
                return;
            }
            delivery.draining = true;
        }

        loop {
            let next = {
                let mut delivery = self.lock_delivery();
                let Some(next) = delivery.pending.pop_front() else {
                    delivery.draining = false;
                    return;
                };
                next
            };
            self.notify(&next);
        }
    }

    fn notify(&self, state: &AppState) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(state))).is_err() {
                metrics::counter!("store_listener_failures_total").increment(1);
                tracing::warn!("State listener panicked, continuing with remaining listeners");
            }
        }
    }

    /// Register a listener called with the new state after every update.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AppState) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(listener)));

        Subscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Set the loading flag
    pub fn set_loading(&self, loading: bool) {
        self.set_state(StatePatch::new().loading(loading));
    }

    /// Set or clear the error message
    pub fn set_error(&self, error: Option<String>) {
        self.set_state(StatePatch::new().error(error));
    }

    /// Clear the error message
    pub fn clear_error(&self) {
        self.set_error(None);
    }

    /// Cache `data` under `(domain, params)`.
    pub fn set_cached_data(
        &self,
        domain: &str,
        params: &CacheParams,
        data: CachedData,
        ttl: Option<Duration>,
    ) {
        self.cache.set(domain, params, data, ttl);
    }

    /// Cached value for `(domain, params)`, if live.
    #[must_use]
    pub fn get_cached_data(&self, domain: &str, params: &CacheParams) -> Option<CachedData> {
        self.cache.get(domain, params)
    }

    /// Whether a live cached value exists for `(domain, params)`.
    #[must_use]
    pub fn has_cached_data(&self, domain: &str, params: &CacheParams) -> bool {
        self.cache.has(domain, params)
    }

    /// Drop every cached entry of `domain`.
    pub fn invalidate_cached_domain(&self, domain: &str) -> usize {
        self.cache.invalidate_domain(domain)
    }

    /// Drop every cached entry.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// The owned cache, e.g. to [`stop`](CacheManager::stop) its sweeper.
    #[must_use]
    pub const fn cache(&self) -> &CacheManager<CachedData> {
        &self.cache
    }

    /// Release every listener.
    ///
    /// The cache's sweeper keeps running; stop it through [`cache`](Self::cache).
    pub fn stop(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
        tracing::debug!("Application store listeners released");
    }
}

impl fmt::Debug for ApplicationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationStore")
            .field("state", &self.get_state())
            .field("listeners", &self.listener_count())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code
mod tests {
    use super::*;
    use crate::invalidation::InvalidationRules;
    use pocketsync_core::event::DomainEvent;
    use pocketsync_testing::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn store_with_clock() -> (ApplicationStore, ManualClock) {
        let bus = Arc::new(EventBus::<DomainEvent>::new());
        let clock = ManualClock::at_test_epoch();
        let cache = CacheManager::with_environment(
            CacheConfig::default(),
            &bus,
            InvalidationRules::default_rules(),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (ApplicationStore::with_cache(cache, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn starts_empty() {
        let (store, clock) = store_with_clock();
        assert_eq!(store.get_state(), AppState::initial(clock.now()));
    }

    #[test]
    fn set_state_merges_shallowly() {
        let (store, clock) = store_with_clock();
        store.set_state(StatePatch::new().accounts(vec![Account::new("a1", "Checking")]));
        clock.advance(Duration::from_secs(1));
        store.set_state(StatePatch::new().loading(true));

        let state = store.get_state();
        assert_eq!(state.accounts.len(), 1);
        assert!(state.loading);
        assert_eq!(state.last_updated, clock.now());
    }

    #[test]
    fn get_state_returns_a_copy() {
        let (store, _clock) = store_with_clock();
        let mut copy = store.get_state();
        copy.loading = true;

        assert!(!store.get_state().loading);
    }

    #[test]
    fn error_helpers() {
        let (store, _clock) = store_with_clock();
        store.set_error(Some("network down".to_string()));
        assert_eq!(store.get_state().error.as_deref(), Some("network down"));

        store.clear_error();
        assert_eq!(store.get_state().error, None);
    }

    #[test]
    fn listeners_are_notified_without_diffing() {
        let (store, _clock) = store_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_listener = Arc::clone(&calls);
        let _subscription = store.subscribe(move |_| {
            calls_in_listener.fetch_add(1, Ordering::SeqCst);
        });

        store.set_loading(false);
        store.set_loading(false);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let (store, _clock) = store_with_clock();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let first_in_listener = Arc::clone(&first);
        let first_subscription = store.subscribe(move |_| {
            first_in_listener.fetch_add(1, Ordering::SeqCst);
        });
        let second_in_listener = Arc::clone(&second);
        let _second_subscription = store.subscribe(move |_| {
            second_in_listener.fetch_add(1, Ordering::SeqCst);
        });

        first_subscription.unsubscribe();
        store.set_loading(true);

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(store.listener_count(), 1);
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_listener_does_not_block_others() {
        let (store, _clock) = store_with_clock();
        let calls = Arc::new(AtomicUsize::new(0));
        let _bad = store.subscribe(|_| panic!("listener bug"));
        let calls_in_listener = Arc::clone(&calls);
        let _good = store.subscribe(move |_| {
            calls_in_listener.fetch_add(1, Ordering::SeqCst);
        });

        store.set_loading(true);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_read_state() {
        let (store, _clock) = store_with_clock();
        let store = Arc::new(store);
        let seen = Arc::new(Mutex::new(None));

        let weak_store = Arc::downgrade(&store);
        let seen_in_listener = Arc::clone(&seen);
        let _subscription = store.subscribe(move |_| {
            if let Some(store) = weak_store.upgrade() {
                *seen_in_listener.lock().unwrap() = Some(store.get_state().loading);
            }
        });

        store.set_loading(true);
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn concurrent_writers_are_delivered_in_write_order() {
        let (store, _clock) = store_with_clock();
        let store = Arc::new(store);
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let (entered, entered_rx) = mpsc::channel();
        let entered = Mutex::new(entered);

        let seen_in_listener = Arc::clone(&seen);
        let _subscription = store.subscribe(move |state| {
            if state.error.as_deref() == Some("first") {
                entered.lock().unwrap().send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
            }
            seen_in_listener.lock().unwrap().push(state.error.clone());
        });

        let writer_store = Arc::clone(&store);
        let writer = thread::spawn(move || writer_store.set_error(Some("first".to_string())));
        entered_rx.recv().unwrap();
        store.set_error(Some("second".to_string()));
        writer.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Some("first".to_string()), Some("second".to_string())]
        );
        assert_eq!(seen.last().cloned().flatten(), store.get_state().error);
    }

    #[test]
    fn listener_may_write_state() {
        let (store, _clock) = store_with_clock();
        let store = Arc::new(store);
        let seen: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));

        let weak_store = Arc::downgrade(&store);
        let seen_in_listener = Arc::clone(&seen);
        let _subscription = store.subscribe(move |state| {
            seen_in_listener.lock().unwrap().push(state.error.clone());
            if state.error.is_some() {
                if let Some(store) = weak_store.upgrade() {
                    store.clear_error();
                }
            }
        });

        store.set_error(Some("retry".to_string()));

        assert_eq!(*seen.lock().unwrap(), vec![Some("retry".to_string()), None]);
        assert_eq!(store.get_state().error, None);
    }

    #[test]
    #[allow(clippy::panic)]
    fn panicking_listeners_are_counted() {
        let (store, _clock) = store_with_clock();
        let _bad = store.subscribe(|_| panic!("listener bug"));
        let _good = store.subscribe(|_| {});

        let rendered = crate::metrics::capture::render(|| {
            store.set_loading(true);
            store.set_loading(false);
        });

        assert_eq!(
            crate::metrics::capture::sample(&rendered, "store_listener_failures_total"),
            Some(2.0)
        );
        assert_eq!(
            crate::metrics::capture::sample(&rendered, "store_state_updates_total"),
            Some(2.0)
        );
    }

    #[test]
    fn stop_releases_listeners() {
        let (store, _clock) = store_with_clock();
        let _a = store.subscribe(|_| {});
        let _b = store.subscribe(|_| {});

        store.stop();
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn cache_helpers_delegate() {
        let (store, clock) = store_with_clock();
        let params = CacheParams::new().with("id", "g1");
        let goals = CachedData::Goals(vec![Goal::new("g1", "Bike", 50_000)]);

        store.set_cached_data("goals", &params, goals.clone(), Some(Duration::from_secs(1)));
        assert_eq!(store.get_cached_data("goals", &params), Some(goals));

        clock.advance(Duration::from_secs(2));
        assert!(!store.has_cached_data("goals", &params));

        store.set_cached_data("goals", &params, CachedData::Goals(vec![]), None);
        store.clear_cache();
        assert!(store.cache().is_empty());
    }
}
