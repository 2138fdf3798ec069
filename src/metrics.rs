//! Label-free instruments plus a Prometheus text renderer.

use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters and gauges shared by both protocol layers.
///
/// `current_clients` tracks live transport sockets, `total_sockets` tracks
/// registered application sockets (one user can hold several) and
/// `emits_total` counts per-user emit calls.
#[derive(Debug, Default)]
pub struct SocketIOMetrics {
    current_clients: AtomicI64,
    total_sockets: AtomicI64,
    emits_total: AtomicU64,
}

impl SocketIOMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_client_connected(&self) {
        self.current_clients.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_client_disconnected(&self) {
        self.current_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_socket_added(&self) {
        self.total_sockets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_socket_removed(&self) {
        self.total_sockets.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_emit(&self) {
        self.emits_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn current_clients(&self) -> i64 {
        self.current_clients.load(Ordering::Relaxed)
    }

    pub fn total_sockets(&self) -> i64 {
        self.total_sockets.load(Ordering::Relaxed)
    }

    pub fn emits_total(&self) -> u64 {
        self.emits_total.load(Ordering::Relaxed)
    }

    /// Render all instruments in the Prometheus text exposition format.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(
            out,
            "# HELP socketio_current_clients Number of currently connected transport sockets"
        );
        let _ = writeln!(out, "# TYPE socketio_current_clients gauge");
        let _ = writeln!(out, "socketio_current_clients {}", self.current_clients());
        let _ = writeln!(out);

        let _ = writeln!(
            out,
            "# HELP socketio_total_sockets Number of registered application sockets"
        );
        let _ = writeln!(out, "# TYPE socketio_total_sockets gauge");
        let _ = writeln!(out, "socketio_total_sockets {}", self.total_sockets());
        let _ = writeln!(out);

        let _ = writeln!(
            out,
            "# HELP socketio_emits_total Number of per-user emit calls"
        );
        let _ = writeln!(out, "# TYPE socketio_emits_total counter");
        let _ = writeln!(out, "socketio_emits_total {}", self.emits_total());

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_move_both_ways() {
        let metrics = SocketIOMetrics::new();
        metrics.record_client_connected();
        metrics.record_client_connected();
        metrics.record_client_disconnected();
        metrics.record_socket_added();
        metrics.record_emit();

        assert_eq!(metrics.current_clients(), 1);
        assert_eq!(metrics.total_sockets(), 1);
        assert_eq!(metrics.emits_total(), 1);
    }

    #[test]
    fn prometheus_export_contains_all_instruments() {
        let metrics = SocketIOMetrics::new();
        metrics.record_client_connected();

        let text = metrics.export_prometheus();
        assert!(text.contains("# TYPE socketio_current_clients gauge"));
        assert!(text.contains("socketio_current_clients 1"));
        assert!(text.contains("# TYPE socketio_total_sockets gauge"));
        assert!(text.contains("# TYPE socketio_emits_total counter"));
    }
}
