use anyhow::{Context, Result};
use std::sync::Arc;
use telemetry_archiver::health::{start_health_server, HealthState};
use telemetry_archiver::{
    Config, KeyBuilder, MessageArchiver, MqttSession, PipelineHealth, PipelineSupervisor,
    RetryPolicy, S3ObjectStore, SupervisorOptions, Uploader,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        run_mode = ?config.service.run_mode,
        "Starting telemetry archiver"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let time_zone = config
        .reference_time_zone()
        .context("Invalid reference time zone")?;
    let key_builder = KeyBuilder::new(config.key_prefix(), time_zone);

    let store = Arc::new(S3ObjectStore::new(&config.s3).await);
    let uploader = Uploader::new(store, config.s3.bucket.clone());

    let health = Arc::new(PipelineHealth::new());
    let archiver = Arc::new(MessageArchiver::new(
        key_builder,
        uploader,
        RetryPolicy::from(&config.retry),
        health.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Spawn health server task
    let health_state = HealthState {
        health: health.clone(),
        service_name: config.service.name.clone(),
    };
    let health_port = config.service.health_port;
    let health_shutdown = shutdown.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port, health_shutdown).await {
            error!(error = %e, "Health server error");
        }
    });

    // Cancel the pipeline on SIGINT or SIGTERM
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let session = MqttSession::new(&config.mqtt).context("Failed to create MQTT session")?;
    let supervisor = PipelineSupervisor::new(
        session,
        config.topic_patterns(),
        archiver,
        SupervisorOptions::from(&config),
    );

    let result = supervisor.run(shutdown.clone()).await;

    // Stop the health server whichever way the pipeline ended
    shutdown.cancel();
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task did not finish cleanly");
    }

    let report = result.context("Pipeline failed to start")?;
    if report.abandoned > 0 {
        warn!(abandoned = report.abandoned, "Exited with uploads still in flight");
    }

    info!("Telemetry archiver stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
