//! Prometheus metrics for observability and monitoring.
//!
//! The bus, cache and store record through the `metrics` facade; nothing is
//! exported until a recorder is installed. [`MetricsServer`] installs the
//! Prometheus recorder and registers descriptions for:
//! - Event bus publishes and handler failures
//! - Cache hits, misses, evictions, expirations and invalidations
//! - Application store updates and listener failures
//!
//! # Example
//!
//! ```rust,no_run
//! use pocketsync_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Holds the handle used to render the scrape payload.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the host exposes metrics on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the recorder cannot be installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a warning
    /// and succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics recorder installed - scrape at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Event Bus Metrics
    describe_counter!(
        "event_bus_events_published_total",
        "Total number of events published to the in-process bus"
    );
    describe_counter!(
        "event_bus_handler_failures_total",
        "Total number of handler invocations that failed or panicked"
    );

    // Cache Metrics
    describe_counter!("cache_hits_total", "Total number of cache reads served");
    describe_counter!("cache_misses_total", "Total number of cache reads that missed");
    describe_counter!(
        "cache_evictions_total",
        "Total number of entries evicted to respect max_size"
    );
    describe_counter!(
        "cache_expirations_total",
        "Total number of expired entries removed"
    );
    describe_counter!(
        "cache_invalidations_total",
        "Total number of entries removed by domain invalidation"
    );
    describe_gauge!(
        "cache_entries",
        "Current number of cache entries, labelled by cache id"
    );

    // Store Metrics
    describe_counter!(
        "store_state_updates_total",
        "Total number of application state updates"
    );
    describe_counter!(
        "store_listener_failures_total",
        "Total number of state listener calls that panicked"
    );
}
