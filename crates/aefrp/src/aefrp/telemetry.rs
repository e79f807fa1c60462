use std::sync::Arc;

use anyhow::Context;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CONNECTIONS_TOTAL: &str = "aefrp_connections_total";
pub const ACTIVE_CONNECTIONS: &str = "aefrp_active_connections";
pub const HANDSHAKE_REJECTS_TOTAL: &str = "aefrp_handshake_rejects_total";
pub const BYTES_INGRESS_TOTAL: &str = "aefrp_bytes_ingress_total";
pub const BYTES_EGRESS_TOTAL: &str = "aefrp_bytes_egress_total";
pub const UDP_DROPPED_TOTAL: &str = "aefrp_udp_dropped_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_counter!(CONNECTIONS_TOTAL, "Raw connections accepted by the relay.");
    describe_gauge!(ACTIVE_CONNECTIONS, "Multiplexed peer sessions currently open.");
    describe_counter!(
        HANDSHAKE_REJECTS_TOTAL,
        "Handshakes rejected, labelled by reason."
    );
    describe_counter!(BYTES_INGRESS_TOTAL, "Bytes received from tunnel streams.");
    describe_counter!(BYTES_EGRESS_TOTAL, "Bytes sent into tunnel streams.");
    describe_counter!(
        UDP_DROPPED_TOTAL,
        "UDP datagrams dropped for lack of window or unknown sender."
    );
}

pub fn connection_accepted() {
    counter!(CONNECTIONS_TOTAL).increment(1);
}

pub fn handshake_rejected(reason: &str) {
    counter!(HANDSHAKE_REJECTS_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn bytes_ingress(n: usize) {
    counter!(BYTES_INGRESS_TOTAL).increment(n as u64);
}

pub fn bytes_egress(n: usize) {
    counter!(BYTES_EGRESS_TOTAL).increment(n as u64);
}

pub fn udp_dropped() {
    counter!(UDP_DROPPED_TOTAL).increment(1);
}

/// Counts one open session in `aefrp_active_connections` for as long as it lives.
#[derive(Debug)]
pub struct ActiveSession(());

impl ActiveSession {
    pub fn start() -> Self {
        gauge!(ACTIVE_CONNECTIONS).increment(1.0);
        Self(())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        gauge!(ACTIVE_CONNECTIONS).decrement(1.0);
    }
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_session_gauge_render() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            udp_dropped();
            handshake_rejected("room");
            let first = ActiveSession::start();
            let _second = ActiveSession::start();
            drop(first);
        });
        let out = handle.render();
        assert!(out.contains(&format!("{UDP_DROPPED_TOTAL} 1")), "{out}");
        assert!(out.contains(r#"reason="room""#), "{out}");
        assert!(out.contains(&format!("{ACTIVE_CONNECTIONS} 1")), "{out}");
    }
}
