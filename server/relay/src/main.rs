use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use vr_metrics::{MetricsConfig, MetricsServer};
use vr_relay::config::Config;
use vr_relay::driver::Driver;
use vr_relay::metrics_adapter::{relay_metrics, transport_metrics};

const METRICS_NAMESPACE: &str = "vr";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();

    let ms = MetricsServer::install(MetricsConfig {
        listen: cfg.metrics_listen.clone(),
        namespace: METRICS_NAMESPACE,
    })?;
    tokio::spawn(async move {
        let _ = ms.serve().await;
    });

    let shutdown = Arc::new(AtomicBool::new(false));

    // The driver is single-threaded by design; it lives on its own thread
    // while the runtime handles metrics and signals.
    let (ready_tx, ready_rx) = mpsc::channel::<Option<String>>();
    let driver_shutdown = shutdown.clone();
    let driver_cfg = cfg.clone();
    let driver_thread = std::thread::Builder::new()
        .name("relay-driver".into())
        .spawn(move || -> Result<()> {
            let mut driver = match Driver::new(
                &driver_cfg,
                driver_shutdown,
                relay_metrics(METRICS_NAMESPACE),
                transport_metrics(METRICS_NAMESPACE),
            ) {
                Ok(driver) => {
                    let _ = ready_tx.send(None);
                    driver
                }
                Err(error) => {
                    let _ = ready_tx.send(Some(format!("{error:#}")));
                    return Ok(());
                }
            };
            driver.run()
        })?;

    if let Ok(Some(error)) = ready_rx.recv() {
        anyhow::bail!("relay failed to start: {error}");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    shutdown.store(true, Ordering::Relaxed);

    match driver_thread.join() {
        Ok(result) => result,
        Err(_) => anyhow::bail!("relay driver panicked"),
    }
}
