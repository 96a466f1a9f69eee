use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "vr-relay", about = "UDP voice-chat relay server")]
pub struct Config {
    /// UDP address the relay listens on
    #[arg(long, default_value = "0.0.0.0:10515")]
    pub listen: String,

    /// Shared key clients present during the transport handshake
    #[arg(long, env = "VR_CONNECTION_KEY", default_value = "vr-relay/1")]
    pub connection_key: String,

    /// Bind address of the Prometheus scrape endpoint
    #[arg(long, default_value = "0.0.0.0:9100")]
    pub metrics_listen: String,

    /// Sleep between poll cycles, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub poll_interval_ms: u64,
}
