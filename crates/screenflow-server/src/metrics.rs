//! Prometheus recorder and metric names.

use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{info, warn};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder, once per process.
///
/// Later calls return the first handle. If another recorder was already
/// installed the handle still renders, but stays empty.
pub fn install_recorder() -> PrometheusHandle {
    HANDLE
        .get_or_init(|| {
            let recorder = PrometheusBuilder::new().build_recorder();
            let handle = recorder.handle();
            match metrics::set_global_recorder(recorder) {
                Ok(()) => info!("prometheus metrics recorder installed"),
                Err(e) => warn!(error = %e, "metrics recorder already installed"),
            }
            handle
        })
        .clone()
}

/// HTTP requests (counter, labels: method, route, status).
pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
/// HTTP request duration seconds (histogram, labels: route).
pub const GATEWAY_REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Messages not delivered because a client queue was full or closed (counter).
pub const PRESENCE_MESSAGES_DROPPED_TOTAL: &str = "presence_messages_dropped_total";
/// Connections removed by the idle sweep (counter).
pub const PRESENCE_EVICTIONS_TOTAL: &str = "presence_evictions_total";
/// Engine events skipped because the bridge fell behind (counter).
pub const EVENT_BRIDGE_LAGGED_TOTAL: &str = "event_bridge_lagged_total";
