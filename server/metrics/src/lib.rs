pub mod config;
pub mod http;
pub mod labels;
pub mod relay;
pub mod transport;

pub use config::MetricsConfig;
pub use http::MetricsServer;
pub use labels::{BoundedLabel, LabelPolicy};
