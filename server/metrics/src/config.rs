/// Where the scrape endpoint binds and the series prefix it exports.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    /// Bind address of the Prometheus endpoint, e.g. 0.0.0.0:9100
    pub listen: String,

    /// Prefix on every exported series name.
    pub namespace: &'static str,
}

impl MetricsConfig {
    pub const DEFAULT_NAMESPACE: &'static str = "vr";

    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            namespace: Self::DEFAULT_NAMESPACE,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self::new("0.0.0.0:9100")
    }
}
