use serde::Serialize;
use std::time::Duration;

#[derive(Default, Serialize, Clone)]
pub struct Counters {
    pub connected: u64,
    pub connect_failed: u64,
    pub handshakes_ok: u64,
    pub voice_sent: u64,
    pub voice_received: u64,
    pub bytes_received: u64,
}

#[derive(Default, Serialize, Clone)]
pub struct Timings {
    pub handshake_ms_p50: u64,
    pub handshake_ms_p95: u64,
}

#[derive(Default, Serialize, Clone)]
pub struct SoakReport {
    pub counters: Counters,
    pub timings: Timings,
}

pub fn quantiles_ms(samples: &mut Vec<u64>) -> (u64, u64) {
    if samples.is_empty() {
        return (0, 0);
    }
    samples.sort_unstable();
    let p50 = samples[(samples.len() * 50) / 100];
    let p95 = samples[(samples.len() * 95) / 100];
    (p50, p95)
}

pub fn dur_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
