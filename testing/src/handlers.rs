//! Event handlers for bus tests.
//!
//! - [`RecordingHandler`]: remembers every delivery
//! - [`FailingHandler`]: errors or panics on every delivery, counting calls

use pocketsync_core::event_bus::{EventHandler, HandlerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Records every `(event_name, payload)` it receives, in order.
#[derive(Debug)]
pub struct RecordingHandler<P> {
    received: Mutex<Vec<(String, Option<P>)>>,
}

impl<P: Clone> RecordingHandler<P> {
    /// Create a handler with nothing recorded
    #[must_use]
    pub const fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
        }
    }

    /// Everything received so far
    #[must_use]
    pub fn received(&self) -> Vec<(String, Option<P>)> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Payloads received so far
    #[must_use]
    pub fn payloads(&self) -> Vec<Option<P>> {
        self.received().into_iter().map(|(_, payload)| payload).collect()
    }

    /// Event names received so far
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        self.received().into_iter().map(|(name, _)| name).collect()
    }

    /// Number of deliveries
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<P: Clone> Default for RecordingHandler<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Clone + Send> EventHandler<P> for RecordingHandler<P> {
    fn handle(&self, event_name: &str, payload: Option<&P>) -> Result<(), HandlerError> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event_name.to_string(), payload.cloned()));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureMode {
    Error,
    Panic,
}

/// Fails on every delivery, by error or by panic.
#[derive(Debug)]
pub struct FailingHandler {
    message: String,
    mode: FailureMode,
    calls: AtomicUsize,
}

impl FailingHandler {
    /// A handler returning [`HandlerError::Failed`] with `message`
    #[must_use]
    pub fn erroring(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: FailureMode::Error,
            calls: AtomicUsize::new(0),
        }
    }

    /// A handler panicking with `message`
    #[must_use]
    pub fn panicking(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: FailureMode::Panic,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of times the handler was invoked
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<P> EventHandler<P> for FailingHandler {
    #[allow(clippy::panic)] // Panicking on purpose is the point of this handler
    fn handle(&self, _event_name: &str, _payload: Option<&P>) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            FailureMode::Error => Err(HandlerError::failed(self.message.clone())),
            FailureMode::Panic => panic!("{}", self.message),
        }
    }
}
