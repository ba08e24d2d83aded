//! Thumbnail worker binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use thumbly_worker::{JobExecutor, Pipeline, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production.
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("thumbly=info".parse().expect("valid directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("starting thumbly-worker");

    let config = WorkerConfig::from_env();
    info!("worker config: {:?}", config);

    let pipeline = match Pipeline::connect(config.clone()).await {
        Ok(p) => p,
        Err(e) => {
            error!("failed to connect pipeline: {}", e);
            std::process::exit(1);
        }
    };

    let executor = Arc::new(JobExecutor::new(
        config,
        pipeline.jobs().clone(),
        Arc::clone(pipeline.queue()),
        Arc::clone(pipeline.events()),
    ));

    let signal_executor = Arc::clone(&executor);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        signal_executor.shutdown();
    });

    if let Err(e) = executor.run().await {
        error!("executor error: {}", e);
        std::process::exit(1);
    }

    info!("worker shutdown complete");
}
