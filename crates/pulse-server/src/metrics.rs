//! Long-poll and dispatch instrumentation, exported for Prometheus scraping.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use tracing::info;

/// Metric names.
pub mod names {
    pub const LONG_POLLS_TOTAL: &str = "pulse_long_polls_total";
    pub const LONG_POLLS_ACTIVE: &str = "pulse_long_polls_active";
    pub const LONG_POLL_OUTCOMES: &str = "pulse_long_poll_outcomes_total";
    pub const LONG_POLL_SECONDS: &str = "pulse_long_poll_duration_seconds";
    pub const LISTENERS_WOKEN: &str = "pulse_listeners_woken_total";
    pub const LISTENERS_PENDING: &str = "pulse_listeners_pending";
    pub const EVENTS_TOTAL: &str = "pulse_events_total";
    pub const ERRORS_TOTAL: &str = "pulse_errors_total";
}

/// Register metric descriptions.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::LONG_POLLS_TOTAL,
        "Total number of long-poll requests since server start"
    );
    metrics::describe_gauge!(
        names::LONG_POLLS_ACTIVE,
        "Current number of long-poll requests in flight"
    );
    metrics::describe_counter!(
        names::LONG_POLL_OUTCOMES,
        "Long-poll results by outcome (events, empty, error)"
    );
    metrics::describe_histogram!(
        names::LONG_POLL_SECONDS,
        "Time from long-poll start to resolution in seconds"
    );
    metrics::describe_counter!(
        names::LISTENERS_WOKEN,
        "Listeners resolved by an event dispatch"
    );
    metrics::describe_gauge!(names::LISTENERS_PENDING, "Listeners currently registered");
    metrics::describe_counter!(names::EVENTS_TOTAL, "Total number of events appended");
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Install the Prometheus recorder and its scrape endpoint on `host:port`.
///
/// # Errors
///
/// Returns an error if the host is not an IP address or the exporter cannot
/// bind.
pub fn start_metrics_server(host: &str, port: u16) -> anyhow::Result<()> {
    let ip: IpAddr = host.parse()?;
    let addr = SocketAddr::new(ip, port);

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Record how a long-poll ended.
pub fn record_outcome(outcome: &'static str) {
    counter!(names::LONG_POLL_OUTCOMES, "outcome" => outcome).increment(1);
}

/// Record listeners woken by a dispatch.
pub fn record_woken(source: &'static str, count: usize) {
    counter!(names::LISTENERS_WOKEN, "source" => source).increment(count as u64);
}

/// Update the pending listener gauge.
pub fn set_pending_listeners(count: usize) {
    gauge!(names::LISTENERS_PENDING).set(count as f64);
}

/// Record an appended event.
pub fn record_event(kind: &str) {
    counter!(names::EVENTS_TOTAL, "type" => kind.to_string()).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard for one long-poll request.
///
/// Counts the request on creation and records its duration and the active
/// gauge on drop, so abandoned requests are accounted for too.
pub struct LongPollMetricsGuard {
    started: Instant,
}

impl LongPollMetricsGuard {
    /// Create a new metrics guard, recording a long-poll.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::LONG_POLLS_TOTAL).increment(1);
        gauge!(names::LONG_POLLS_ACTIVE).increment(1.0);
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for LongPollMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LongPollMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::LONG_POLLS_ACTIVE).decrement(1.0);
        histogram!(names::LONG_POLL_SECONDS).record(self.started.elapsed().as_secs_f64());
    }
}
