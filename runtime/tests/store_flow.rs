//! End-to-end flow through the application store
//!
//! Mirrors how a screen loads data: flag loading, serve from cache or fetch,
//! publish a write event, and observe the cache go stale.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use pocketsync_core::domain::{Account, Operation, OperationKind};
use pocketsync_core::environment::Clock;
use pocketsync_core::event::DomainEvent;
use pocketsync_core::event_bus::DomainEventBus;
use pocketsync_runtime::cache::{CacheConfig, CacheManager, CacheParams};
use pocketsync_runtime::domains;
use pocketsync_runtime::invalidation::InvalidationRules;
use pocketsync_runtime::store::{AppState, ApplicationStore, CachedData, StatePatch};
use pocketsync_testing::{ManualClock, test_epoch};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn store() -> (ApplicationStore, Arc<DomainEventBus>, ManualClock) {
    let bus = Arc::new(DomainEventBus::new());
    let clock = ManualClock::at_test_epoch();
    let cache = CacheManager::with_environment(
        CacheConfig::default(),
        &bus,
        InvalidationRules::default_rules(),
        Arc::new(clock.clone()),
    )
    .unwrap();
    (ApplicationStore::with_cache(cache, Arc::new(clock.clone())), bus, clock)
}

fn salary(account_id: &str) -> Operation {
    Operation {
        id: "o1".to_string(),
        account_id: account_id.to_string(),
        category_id: None,
        kind: OperationKind::Income,
        amount_minor: 250_000,
        description: "Salary".to_string(),
        occurred_at: test_epoch(),
    }
}

#[test]
fn listeners_observe_loading_then_data() {
    let (store, _bus, _clock) = store();
    let seen: Arc<Mutex<Vec<AppState>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_listener = Arc::clone(&seen);
    let subscription = store.subscribe(move |state| {
        seen_in_listener.lock().unwrap().push(state.clone());
    });

    store.set_loading(true);
    store.set_state(
        StatePatch::new()
            .accounts(vec![Account::new("a1", "Checking")])
            .loading(false),
    );
    subscription.unsubscribe();
    store.set_loading(true);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].loading && seen[0].accounts.is_empty());
    assert!(!seen[1].loading);
    assert_eq!(seen[1].accounts, vec![Account::new("a1", "Checking")]);
}

#[test]
fn write_event_makes_cached_page_stale() {
    let (store, bus, _clock) = store();
    let page = CacheParams::new().with("account", "a1").with("page", 1);
    let summary = CacheParams::new().with("month", "2025-01");

    store.set_cached_data(
        domains::OPERATIONS,
        &page,
        CachedData::Operations(vec![salary("a1")]),
        None,
    );
    store.set_cached_data(
        domains::FINANCIAL_SUMMARY,
        &summary,
        CachedData::Json(serde_json::json!({ "income": 250_000, "expense": 0 })),
        None,
    );
    store.set_cached_data(
        domains::ACCOUNTS,
        &CacheParams::new(),
        CachedData::Accounts(vec![Account::new("a1", "Checking")]),
        None,
    );

    bus.publish_event(&DomainEvent::OperationCreated(salary("a1")));

    assert!(!store.has_cached_data(domains::OPERATIONS, &page));
    assert!(!store.has_cached_data(domains::FINANCIAL_SUMMARY, &summary));
    assert!(store.has_cached_data(domains::ACCOUNTS, &CacheParams::new()));
}

#[test]
fn cached_data_expires_with_the_store_clock() {
    let (store, _bus, clock) = store();
    let params = CacheParams::new().with("month", "2025-01");
    store.set_cached_data(
        domains::FINANCIAL_SUMMARY,
        &params,
        CachedData::Json(serde_json::json!({ "balance": 0 })),
        Some(Duration::from_secs(30)),
    );

    clock.advance(Duration::from_secs(30));
    assert!(store.get_cached_data(domains::FINANCIAL_SUMMARY, &params).is_some());

    clock.advance(Duration::from_millis(1));
    assert_eq!(store.get_cached_data(domains::FINANCIAL_SUMMARY, &params), None);
}

#[test]
fn failed_request_records_error_until_cleared() {
    let (store, _bus, clock) = store();

    store.set_loading(true);
    clock.advance(Duration::from_secs(2));
    store.set_state(
        StatePatch::new()
            .loading(false)
            .error(Some("sync failed".to_string())),
    );

    let state = store.get_state();
    assert!(!state.loading);
    assert_eq!(state.error.as_deref(), Some("sync failed"));
    assert_eq!(state.last_updated, clock.now());

    store.clear_error();
    assert_eq!(store.get_state().error, None);
}

#[test]
fn invalidate_cached_domain_reports_removed_count() {
    let (store, _bus, _clock) = store();
    for page in 1..=3 {
        store.set_cached_data(
            domains::OPERATIONS,
            &CacheParams::new().with("page", page),
            CachedData::Operations(Vec::new()),
            None,
        );
    }

    assert_eq!(store.invalidate_cached_domain(domains::OPERATIONS), 3);
    assert_eq!(store.invalidate_cached_domain(domains::OPERATIONS), 0);
}
