//! In-process event bus for decoupling use-cases from their consumers.
//!
//! This module provides [`EventBus`], a synchronous publish/subscribe registry
//! keyed by event name. Use-cases publish a domain event after a successful
//! write; cache invalidation, notifications and audit logging subscribe to the
//! names they care about.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │  Use-case   │
//! └──────┬──────┘
//!        │ 1. write through repository
//!        ▼
//! ┌─────────────────┐
//! │ 2. Publish to   │
//! │    Event Bus    │◄─── synchronous, in registration order
//! └────────┬────────┘
//!          │
//!     ┌────┴─────┬──────────┐
//!     │          │          │
//!     ▼          ▼          ▼
//! ┌───────┐ ┌─────────┐ ┌───────┐
//! │ Cache │ │ Notify  │ │ Audit │
//! └───────┘ └─────────┘ └───────┘
//! ```
//!
//! # Key Principles
//!
//! - **Synchronous fan-out**: `publish` returns only after every handler ran
//! - **Registration order**: handlers for one name run in the order they subscribed
//! - **Idempotent subscribe**: the same handler is registered at most once per name
//! - **Fault isolation**: a failing or panicking handler is captured in the
//!   [`PublishReport`] and never aborts the publisher or its siblings
//!
//! # Example
//!
//! ```
//! use pocketsync_core::event_bus::{EventBus, HandlerError, handler_fn};
//!
//! let bus: EventBus<String> = EventBus::new();
//!
//! bus.subscribe("E", handler_fn(|_, _| Err(HandlerError::failed("boom"))));
//! bus.subscribe("E", handler_fn(|_, payload: Option<&String>| {
//!     assert_eq!(payload.map(String::as_str), Some("x"));
//!     Ok(())
//! }));
//!
//! let report = bus.publish("E", Some(&"x".to_string()));
//! assert_eq!(report.handler_count(), 2);
//! assert_eq!(report.failed_count(), 1);
//! ```

use crate::event::DomainEvent;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors a handler can report back to the bus.
///
/// These never reach the publisher as `Err`; they are collected into the
/// [`PublishReport`] and logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("Handler failed: {0}")]
    Failed(String),

    /// The handler panicked while processing the event
    #[error("Handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Create a [`HandlerError::Failed`] from any message.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A subscriber callback.
///
/// Implementations receive the event name they were invoked for (one handler
/// may be subscribed under several names) and the optional payload.
///
/// # Thread Safety
///
/// Handlers must be `Send + Sync` since the bus may be shared across threads
/// behind an `Arc`.
pub trait EventHandler<P>: Send + Sync {
    /// Handle one published event.
    ///
    /// # Errors
    ///
    /// Any error is recorded as a failed [`HandlerOutcome`]; it does not stop
    /// delivery to the remaining handlers.
    fn handle(&self, event_name: &str, payload: Option<&P>) -> Result<(), HandlerError>;
}

/// Shared handle to a registered handler. Identity is the `Arc` allocation.
pub type HandlerRef<P> = Arc<dyn EventHandler<P>>;

/// Adapter turning a closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

impl<P, F> EventHandler<P> for FnHandler<F>
where
    F: Fn(&str, Option<&P>) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event_name: &str, payload: Option<&P>) -> Result<(), HandlerError> {
        (self.0)(event_name, payload)
    }
}

/// Wrap a closure as a [`HandlerRef`].
///
/// Keep the returned `Arc` around if you intend to unsubscribe later: the bus
/// compares handlers by allocation, so a second `handler_fn` call with the same
/// closure body is a different handler.
pub fn handler_fn<P, F>(f: F) -> HandlerRef<P>
where
    P: 'static,
    F: Fn(&str, Option<&P>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

fn same_handler<P: 'static>(a: &HandlerRef<P>, b: &HandlerRef<P>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Result of invoking one handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler returned `Ok(())`
    Succeeded,
    /// The handler returned an error or panicked
    Failed(HandlerError),
}

impl HandlerOutcome {
    /// Check if the handler succeeded
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Per-handler outcomes of a single `publish` call, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Name the event was published under
    pub event_name: String,

    /// One outcome per handler invoked
    pub outcomes: Vec<HandlerOutcome>,
}

impl PublishReport {
    fn empty(event_name: &str) -> Self {
        Self {
            event_name: event_name.to_string(),
            outcomes: Vec::new(),
        }
    }

    /// Number of handlers that were invoked
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.outcomes.len()
    }

    /// Number of handlers that succeeded
    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    /// Number of handlers that failed or panicked
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.handler_count() - self.succeeded_count()
    }

    /// True when every invoked handler succeeded (vacuously true with no handlers)
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(HandlerOutcome::is_success)
    }

    /// Errors of the failed handlers, in invocation order
    pub fn failures(&self) -> impl Iterator<Item = &HandlerError> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            HandlerOutcome::Failed(error) => Some(error),
            HandlerOutcome::Succeeded => None,
        })
    }
}

/// Synchronous publish/subscribe registry keyed by event name.
///
/// The registry is guarded by a lock so the bus can be shared as
/// `Arc<EventBus<P>>`. Handlers are invoked after the lock is released, so a
/// handler may itself subscribe, unsubscribe or publish.
///
/// # Type Parameters
///
/// - `P`: payload type delivered to handlers (see [`DomainEventBus`])
pub struct EventBus<P> {
    handlers: RwLock<HashMap<String, Vec<HandlerRef<P>>>>,
}

/// Event bus carrying [`DomainEvent`] payloads.
pub type DomainEventBus = EventBus<DomainEvent>;

impl<P: 'static> EventBus<P> {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` under `event_name`.
    ///
    /// No-op if this exact handler is already registered for the name.
    pub fn subscribe(&self, event_name: &str, handler: HandlerRef<P>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = handlers.entry(event_name.to_string()).or_default();

        if registered.iter().any(|existing| same_handler(existing, &handler)) {
            tracing::trace!(event = event_name, "Handler already subscribed, ignoring");
            return;
        }

        registered.push(handler);
        tracing::debug!(
            event = event_name,
            handlers = registered.len(),
            "Subscribed handler"
        );
    }

    /// Remove `handler` from `event_name`.
    ///
    /// No-op if the name or the handler is unknown. Removing the last handler
    /// drops the name from the registry.
    pub fn unsubscribe(&self, event_name: &str, handler: &HandlerRef<P>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(registered) = handlers.get_mut(event_name) else {
            return;
        };

        registered.retain(|existing| !same_handler(existing, handler));
        if registered.is_empty() {
            handlers.remove(event_name);
        }
        tracing::debug!(event = event_name, "Unsubscribed handler");
    }

    /// Invoke every handler registered for `event_name`, in order.
    ///
    /// The handler list is snapshotted when the call starts: handlers added
    /// during delivery are not called for this event. The call returns once
    /// every handler has run or failed.
    #[tracing::instrument(skip(self, payload), name = "event_bus_publish")]
    pub fn publish(&self, event_name: &str, payload: Option<&P>) -> PublishReport {
        let snapshot = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned();

        let Some(handlers) = snapshot else {
            tracing::trace!("No handlers registered");
            return PublishReport::empty(event_name);
        };

        let outcomes: Vec<HandlerOutcome> = handlers
            .iter()
            .enumerate()
            .map(|(position, handler)| Self::invoke(event_name, position, handler, payload))
            .collect();

        metrics::counter!("event_bus_events_published_total").increment(1);
        tracing::debug!(handlers = outcomes.len(), "Published event");

        PublishReport {
            event_name: event_name.to_string(),
            outcomes,
        }
    }

    fn invoke(
        event_name: &str,
        position: usize,
        handler: &HandlerRef<P>,
        payload: Option<&P>,
    ) -> HandlerOutcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event_name, payload)));

        let error = match result {
            Ok(Ok(())) => return HandlerOutcome::Succeeded,
            Ok(Err(error)) => error,
            Err(cause) => HandlerError::Panicked(panic_message(cause.as_ref())),
        };

        metrics::counter!("event_bus_handler_failures_total").increment(1);
        tracing::warn!(
            event = event_name,
            position = position,
            error = %error,
            "Event handler failed, continuing with remaining handlers"
        );
        HandlerOutcome::Failed(error)
    }

    /// Remove the registrations of one event, or of every event with `None`.
    pub fn clear(&self, event_name: Option<&str>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match event_name {
            Some(name) => {
                handlers.remove(name);
            },
            None => handlers.clear(),
        }
    }

    /// Number of handlers registered under `event_name`
    #[must_use]
    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Whether any handler is registered under `event_name`
    #[must_use]
    pub fn has_handlers(&self, event_name: &str) -> bool {
        self.handler_count(event_name) > 0
    }

    /// Names with at least one handler, sorted
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort_unstable();
        names
    }
}

impl EventBus<DomainEvent> {
    /// Publish a domain event under its own name.
    pub fn publish_event(&self, event: &DomainEvent) -> PublishReport {
        self.publish(event.name(), Some(event))
    }
}

impl<P: 'static> Default for EventBus<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> fmt::Debug for EventBus<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (name, registered) in handlers.iter() {
            map.entry(name, &registered.len());
        }
        map.finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> HandlerRef<String> {
        let log = Arc::clone(log);
        handler_fn(move |_, payload: Option<&String>| {
            log.lock()
                .unwrap()
                .push(format!("{label}:{}", payload.cloned().unwrap_or_default()));
            Ok(())
        })
    }

    #[test]
    fn subscribe_is_idempotent() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "a");

        bus.subscribe("E", Arc::clone(&handler));
        bus.subscribe("E", Arc::clone(&handler));

        assert_eq!(bus.handler_count("E"), 1);
        let report = bus.publish("E", Some(&"x".to_string()));
        assert_eq!(report.handler_count(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["a:x"]);
    }

    #[test]
    fn same_handler_may_serve_several_names() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "a");

        bus.subscribe("E1", Arc::clone(&handler));
        bus.subscribe("E2", Arc::clone(&handler));

        assert_eq!(bus.event_names(), vec!["E1", "E2"]);
    }

    #[test]
    fn unsubscribing_last_handler_removes_entry() {
        let bus: EventBus<String> = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = recorder(&log, "a");
        let second = recorder(&log, "b");

        bus.subscribe("E", Arc::clone(&first));
        bus.subscribe("E", Arc::clone(&second));

        bus.unsubscribe("E", &first);
        assert!(bus.has_handlers("E"));
        assert_eq!(bus.handler_count("E"), 1);

        bus.unsubscribe("E", &second);
        assert!(!bus.has_handlers("E"));
        assert!(bus.event_names().is_empty());
    }

    #[test]
    fn unsubscribe_unknown_is_noop() {
        let bus: EventBus<String> = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registered = recorder(&log, "a");
        let stranger = recorder(&log, "b");

        bus.unsubscribe("missing", &registered);
        bus.subscribe("E", Arc::clone(&registered));
        bus.unsubscribe("E", &stranger);

        assert_eq!(bus.handler_count("E"), 1);
    }

    #[test]
    fn publish_without_handlers_is_empty() {
        let bus: EventBus<String> = EventBus::new();
        let report = bus.publish("Nobody", None);

        assert_eq!(report.handler_count(), 0);
        assert!(report.all_succeeded());
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            bus.subscribe("E", recorder(&log, label));
        }
        bus.publish("E", Some(&"p".to_string()));

        assert_eq!(*log.lock().unwrap(), vec!["first:p", "second:p", "third:p"]);
    }

    #[test]
    fn failing_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("E", handler_fn(|_, _| Err(HandlerError::failed("A broke"))));
        bus.subscribe("E", recorder(&log, "B"));

        let report = bus.publish("E", Some(&"x".to_string()));

        assert_eq!(*log.lock().unwrap(), vec!["B:x"]);
        assert_eq!(
            report.outcomes,
            vec![
                HandlerOutcome::Failed(HandlerError::failed("A broke")),
                HandlerOutcome::Succeeded,
            ]
        );
    }

    #[test]
    fn panicking_handler_is_captured() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("E", handler_fn(|_, _| panic!("handler exploded")));
        bus.subscribe("E", recorder(&log, "B"));

        let report = bus.publish("E", None);

        assert_eq!(report.failed_count(), 1);
        assert_eq!(
            report.failures().next(),
            Some(&HandlerError::Panicked("handler exploded".to_string()))
        );
        assert_eq!(*log.lock().unwrap(), vec!["B:"]);
    }

    #[test]
    fn handler_may_subscribe_during_publish() {
        let bus: Arc<EventBus<String>> = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(&log, "late");

        let bus_in_handler = Arc::clone(&bus);
        let late_in_handler = Arc::clone(&late);
        bus.subscribe(
            "E",
            handler_fn(move |_, _| {
                bus_in_handler.subscribe("E", Arc::clone(&late_in_handler));
                Ok(())
            }),
        );

        let report = bus.publish("E", None);
        assert_eq!(report.handler_count(), 1);
        assert!(log.lock().unwrap().is_empty());

        let report = bus.publish("E", None);
        assert_eq!(report.handler_count(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["late:"]);
    }

    #[test]
    fn clear_one_or_all() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("E1", recorder(&log, "a"));
        bus.subscribe("E2", recorder(&log, "b"));

        bus.clear(Some("E1"));
        assert_eq!(bus.event_names(), vec!["E2"]);

        bus.clear(None);
        assert!(bus.event_names().is_empty());
    }

    #[test]
    fn publish_event_routes_on_event_name() {
        use crate::domain::Account;

        let bus = DomainEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        bus.subscribe(
            "AccountCreated",
            handler_fn(move |name, event: Option<&DomainEvent>| {
                seen_in_handler
                    .lock()
                    .unwrap()
                    .push((name.to_string(), event.map(|e| e.entity_id().to_string())));
                Ok(())
            }),
        );

        bus.publish_event(&DomainEvent::AccountCreated(Account::new("a1", "Checking")));
        bus.publish_event(&DomainEvent::AccountDeleted { id: "a1".to_string() });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("AccountCreated".to_string(), Some("a1".to_string()))]
        );
    }
}
