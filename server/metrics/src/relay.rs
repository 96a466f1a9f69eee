use metrics::{counter, gauge, histogram};

use crate::labels::LabelPolicy;

/// Relay-level series under `{ns}_relay_*`.
pub struct RelayMetricsImpl {
    ns: &'static str,
    policy: LabelPolicy,
}

impl RelayMetricsImpl {
    pub fn new(namespace: &'static str, policy: LabelPolicy) -> Self {
        Self { ns: namespace, policy }
    }

    #[inline]
    pub fn player_joined(&self) {
        counter!(format!("{}_relay_players_joined_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn player_left(&self) {
        counter!(format!("{}_relay_players_left_total", self.ns)).increment(1);
    }

    #[inline]
    pub fn players_connected(&self, count: usize) {
        gauge!(format!("{}_relay_players_connected", self.ns)).set(count as f64);
    }

    #[inline]
    pub fn fanout(&self, destinations: usize) {
        counter!(format!("{}_relay_fanouts_total", self.ns)).increment(1);
        histogram!(format!("{}_relay_fanout_size", self.ns)).record(destinations as f64);
    }

    #[inline]
    pub fn disconnect(&self, reason: &'static str) {
        counter!(
            format!("{}_relay_disconnects_total", self.ns),
            "reason" => self.policy.reason(reason).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn error(&self, subsystem: &'static str) {
        counter!(
            format!("{}_relay_errors_total", self.ns),
            "subsystem" => self.policy.subsystem(subsystem).as_str().to_string()
        )
        .increment(1);
    }

    #[inline]
    pub fn poll_duration(&self, seconds: f64) {
        histogram!(format!("{}_relay_poll_duration_seconds", self.ns)).record(seconds);
    }

    #[inline]
    pub fn poll_overrun(&self) {
        counter!(format!("{}_relay_poll_overruns_total", self.ns)).increment(1);
    }
}
