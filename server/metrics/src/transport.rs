use metrics::counter;

/// Datagram-level series under `{ns}_transport_*`.
pub struct TransportMetricsImpl {
    ns: &'static str,
}

impl TransportMetricsImpl {
    pub fn new(namespace: &'static str) -> Self {
        Self { ns: namespace }
    }

    #[inline]
    pub fn rx_packet(&self, bytes: usize) {
        counter!(format!("{}_transport_rx_packets_total", self.ns)).increment(1);
        counter!(format!("{}_transport_rx_bytes_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn tx_packet(&self, bytes: usize) {
        counter!(format!("{}_transport_tx_packets_total", self.ns)).increment(1);
        counter!(format!("{}_transport_tx_bytes_total", self.ns)).increment(bytes as u64);
    }

    #[inline]
    pub fn send_error(&self) {
        counter!(format!("{}_transport_send_errors_total", self.ns)).increment(1);
    }
}
