//! Prometheus metrics for the relay.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

pub fn record_peer_join() {
    metrics::gauge!("relay_peers_active").increment(1.0);
}

pub fn record_peer_leave() {
    metrics::gauge!("relay_peers_active").decrement(1.0);
}

/// Record one relayed envelope and its fan-out.
pub fn record_forward(kind: &str, fan_out: usize) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("relay_envelopes_total", &labels).increment(1);
    metrics::histogram!("relay_fan_out").record(fan_out as f64);
}

/// Record a dropped inbound frame, labelled with why.
pub fn record_dropped(reason: &str) {
    let labels = [("reason", reason.to_string())];
    metrics::counter!("relay_frames_dropped_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // Only one recorder per process; a second install reports an error.
        if let Ok(handle) = install_prometheus_recorder() {
            record_forward("state-update", 2);
            assert!(handle.render().contains("relay_envelopes_total"));
        }
    }

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        record_peer_join();
        record_peer_leave();
        record_dropped("oversize");
    }
}
