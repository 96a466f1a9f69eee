//! Glue between the relay/transport metric traits and the Prometheus
//! recorder in `vr-metrics`.

use std::sync::Arc;

use vr_metrics::relay::RelayMetricsImpl;
use vr_metrics::transport::TransportMetricsImpl;
use vr_metrics::LabelPolicy;
use vr_transport::TransportMetrics;

use crate::relay::RelayMetrics;

pub fn relay_metrics(namespace: &'static str) -> Arc<dyn RelayMetrics> {
    Arc::new(RelayMetricsAdapter {
        inner: RelayMetricsImpl::new(namespace, LabelPolicy::default()),
    })
}

pub fn transport_metrics(namespace: &'static str) -> Arc<dyn TransportMetrics> {
    Arc::new(TransportMetricsAdapter {
        inner: TransportMetricsImpl::new(namespace),
    })
}

struct RelayMetricsAdapter {
    inner: RelayMetricsImpl,
}

impl RelayMetrics for RelayMetricsAdapter {
    fn player_joined(&self) {
        self.inner.player_joined();
    }
    fn player_left(&self) {
        self.inner.player_left();
    }
    fn players_connected(&self, count: usize) {
        self.inner.players_connected(count);
    }
    fn fanout(&self, destinations: usize) {
        self.inner.fanout(destinations);
    }
    fn disconnect(&self, reason: &'static str) {
        self.inner.disconnect(reason);
    }
    fn error(&self, subsystem: &'static str) {
        self.inner.error(subsystem);
    }
    fn poll_duration(&self, seconds: f64) {
        self.inner.poll_duration(seconds);
    }
    fn poll_overrun(&self) {
        self.inner.poll_overrun();
    }
}

struct TransportMetricsAdapter {
    inner: TransportMetricsImpl,
}

impl TransportMetrics for TransportMetricsAdapter {
    fn rx_packet(&self, bytes: usize) {
        self.inner.rx_packet(bytes);
    }
    fn tx_packet(&self, bytes: usize) {
        self.inner.tx_packet(bytes);
    }
    fn send_error(&self) {
        self.inner.send_error();
    }
}
