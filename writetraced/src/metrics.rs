//! Process-wide counters (spec §4.9) and their Prometheus text exposition.
//!
//! Counters are updated from the hot path (ring reader, sinks) so every
//! field is atomic; there is no lock on the read side either.

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

pub struct Metrics {
    pub events_total: AtomicU64,
    pub events_dropped_total: AtomicU64,
    pub decode_errors_total: AtomicU64,
    pub sink_errors_total: AtomicU64,
    pub tracked_pids: AtomicUsize,
    pub tracked_tids: AtomicUsize,
    pub start_time: SystemTime,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_total: AtomicU64::new(0),
            events_dropped_total: AtomicU64::new(0),
            decode_errors_total: AtomicU64::new(0),
            sink_errors_total: AtomicU64::new(0),
            tracked_pids: AtomicUsize::new(0),
            tracked_tids: AtomicUsize::new(0),
            start_time: SystemTime::now(),
        }
    }

    pub fn record_event(&self) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.events_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sink_error(&self) {
        self.sink_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_tracked_pids(&self, n: usize) {
        self.tracked_pids.store(n, Ordering::Relaxed);
    }

    pub fn set_tracked_tids(&self, n: usize) {
        self.tracked_tids.store(n, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the current counters in Prometheus text exposition format.
pub fn render(metrics: &Metrics) -> String {
    let events_total = metrics.events_total.load(Ordering::Relaxed);
    let dropped_total = metrics.events_dropped_total.load(Ordering::Relaxed);
    let decode_errors = metrics.decode_errors_total.load(Ordering::Relaxed);
    let sink_errors = metrics.sink_errors_total.load(Ordering::Relaxed);
    let tracked_pids = metrics.tracked_pids.load(Ordering::Relaxed);
    let tracked_tids = metrics.tracked_tids.load(Ordering::Relaxed);
    let uptime = metrics.uptime_seconds();

    let mut body = String::new();

    let _ = writeln!(body, "# HELP write_tracer_write_calls_total Total write(2) calls captured.");
    let _ = writeln!(body, "# TYPE write_tracer_write_calls_total counter");
    let _ = writeln!(body, "write_tracer_write_calls_total {events_total}");

    let _ = writeln!(body, "# HELP writetrace_events_total Total write events decoded from the ring buffer.");
    let _ = writeln!(body, "# TYPE writetrace_events_total counter");
    let _ = writeln!(body, "writetrace_events_total {events_total}");

    let _ = writeln!(body, "# HELP writetrace_events_dropped_total Events dropped on a full pipeline channel.");
    let _ = writeln!(body, "# TYPE writetrace_events_dropped_total counter");
    let _ = writeln!(body, "writetrace_events_dropped_total {dropped_total}");

    let _ = writeln!(body, "# HELP writetrace_decode_errors_total Ring records that failed to decode.");
    let _ = writeln!(body, "# TYPE writetrace_decode_errors_total counter");
    let _ = writeln!(body, "writetrace_decode_errors_total {decode_errors}");

    let _ = writeln!(body, "# HELP writetrace_sink_errors_total Sink write/push failures.");
    let _ = writeln!(body, "# TYPE writetrace_sink_errors_total counter");
    let _ = writeln!(body, "writetrace_sink_errors_total {sink_errors}");

    let _ = writeln!(body, "# HELP writetrace_tracked_pids Processes currently registered.");
    let _ = writeln!(body, "# TYPE writetrace_tracked_pids gauge");
    let _ = writeln!(body, "writetrace_tracked_pids {tracked_pids}");

    let _ = writeln!(body, "# HELP write_tracer_tracked_threads Threads currently present in the kernel TID map.");
    let _ = writeln!(body, "# TYPE write_tracer_tracked_threads gauge");
    let _ = writeln!(body, "write_tracer_tracked_threads {tracked_tids}");

    let _ = writeln!(body, "# HELP writetrace_tracked_tids Threads currently present in the kernel filter map.");
    let _ = writeln!(body, "# TYPE writetrace_tracked_tids gauge");
    let _ = writeln!(body, "writetrace_tracked_tids {tracked_tids}");

    let _ = writeln!(body, "# HELP writetrace_uptime_seconds Seconds since the daemon started.");
    let _ = writeln!(body, "# TYPE writetrace_uptime_seconds gauge");
    let _ = writeln!(body, "writetrace_uptime_seconds {uptime}");

    body
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&metrics),
    )
        .into_response()
}

/// Serves `GET /metrics` on `0.0.0.0:<port>` (spec §6). Binds on all
/// interfaces, unlike the loopback-only control API.
pub async fn serve(metrics: Arc<Metrics>, port: u16) -> std::io::Result<()> {
    let router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_all_counters() {
        let m = Metrics::new();
        m.record_event();
        m.record_drop();
        m.set_tracked_pids(2);
        let text = render(&m);
        assert!(text.contains("writetrace_events_total 1"));
        assert!(text.contains("writetrace_events_dropped_total 1"));
        assert!(text.contains("writetrace_tracked_pids 2"));
    }

    #[test]
    fn render_includes_the_mandated_series_names() {
        let m = Metrics::new();
        m.record_event();
        m.set_tracked_tids(3);
        let text = render(&m);
        assert!(text.contains("# TYPE write_tracer_write_calls_total counter"));
        assert!(text.contains("write_tracer_write_calls_total 1"));
        assert!(text.contains("# TYPE write_tracer_tracked_threads gauge"));
        assert!(text.contains("write_tracer_tracked_threads 3"));
    }
}
