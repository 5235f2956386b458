use crate::archiver::MessageArchiver;
use crate::config::{Config, RunMode};
use crate::envelope::MessageEnvelope;
use crate::health::HealthSnapshot;
use crate::subscription::{BrokerSession, SubscriptionManager};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, instrument, warn};

/// Payload of the synthetic startup message
pub const SELF_TEST_PAYLOAD: &str = r#"{"example":"test message"}"#;

/// Startup-class failures. These abort the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("MQTT connection error: {0}")]
    Connection(String),

    #[error("Subscription error for {patterns:?}: {reason}")]
    Subscription {
        patterns: Vec<String>,
        reason: String,
    },
}

impl PipelineError {
    pub fn classification(&self) -> &'static str {
        match self {
            PipelineError::Connection(_) => "connection_error",
            PipelineError::Subscription { .. } => "subscription_error",
        }
    }
}

/// Why the pipeline stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested
    Shutdown,
    /// Single-shot mode archived its message
    SingleShotComplete,
}

/// Outcome of an orderly pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub stop_reason: StopReason,
    pub health: HealthSnapshot,
    /// Message tasks still running when the drain timeout elapsed
    pub abandoned: usize,
}

impl PipelineReport {
    pub fn archived_any(&self) -> bool {
        self.health.messages_archived > 0
    }
}

/// Supervisor settings
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub run_mode: RunMode,
    pub drain_timeout: Duration,
    pub self_test_on_startup: bool,
    pub upload_concurrency: usize,
    pub reconnect_delay: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            run_mode: RunMode::Continuous,
            drain_timeout: Duration::from_secs(10),
            self_test_on_startup: false,
            upload_concurrency: 10,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for SupervisorOptions {
    fn from(config: &Config) -> Self {
        Self {
            run_mode: config.service.run_mode,
            drain_timeout: config.drain_timeout(),
            self_test_on_startup: config.archive.self_test_on_startup,
            upload_concurrency: config.s3.upload_concurrency,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

/// Top-level orchestration: starts the subscription, keeps it alive until
/// shutdown, then drains in-flight uploads.
pub struct PipelineSupervisor<S: BrokerSession> {
    session: S,
    patterns: Vec<String>,
    archiver: Arc<MessageArchiver>,
    options: SupervisorOptions,
}

impl<S: BrokerSession> PipelineSupervisor<S> {
    pub fn new(
        session: S,
        patterns: Vec<String>,
        archiver: Arc<MessageArchiver>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            session,
            patterns,
            archiver,
            options,
        }
    }

    /// Run the pipeline until `shutdown` is cancelled (or, in single-shot
    /// mode, until one message is archived).
    ///
    /// Returns an error only for startup failures; per-message failures are
    /// visible in the report's health snapshot.
    #[instrument(skip_all, fields(run_mode = ?self.options.run_mode))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<PipelineReport, PipelineError> {
        let Self {
            session,
            patterns,
            archiver,
            options,
        } = self;

        let health = archiver.health().clone();
        let tracker = TaskTracker::new();
        let stop = shutdown.child_token();

        let mut manager = SubscriptionManager::new(
            session,
            patterns,
            archiver,
            tracker.clone(),
            options.upload_concurrency,
        )
        .with_reconnect_delay(options.reconnect_delay);

        if options.run_mode == RunMode::SingleShot {
            manager = manager.cancel_on_first_archive(stop.clone());
        }

        info!(topics = ?manager.patterns(), "Starting pipeline");

        let started = tokio::select! {
            result = manager.start() => result,
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before the subscription was established");
                return Ok(PipelineReport {
                    stop_reason: StopReason::Shutdown,
                    health: health.snapshot(),
                    abandoned: 0,
                });
            }
        };

        if let Err(e) = started {
            error!(
                error = %e,
                classification = e.classification(),
                "Pipeline failed to start"
            );
            return Err(e);
        }

        if options.self_test_on_startup {
            if let Some(pattern) = manager.patterns().first() {
                let topic = self_test_topic(pattern);
                info!(topic = %topic, "Running startup self-test");
                manager
                    .dispatch(MessageEnvelope::new(topic, SELF_TEST_PAYLOAD))
                    .await;
            }
        }

        manager.run(stop).await;

        let stop_reason = if shutdown.is_cancelled() {
            StopReason::Shutdown
        } else {
            StopReason::SingleShotComplete
        };

        let abandoned = drain(&tracker, options.drain_timeout).await;
        let report = PipelineReport {
            stop_reason,
            health: health.snapshot(),
            abandoned,
        };

        info!(
            stop_reason = ?report.stop_reason,
            received = report.health.messages_received,
            archived = report.health.messages_archived,
            failed = report.health.messages_failed,
            broker_errors = report.health.broker_errors,
            abandoned = report.abandoned,
            "Pipeline stopped"
        );

        Ok(report)
    }
}

/// Wait for in-flight message tasks, up to `timeout`. Returns how many were
/// still running when the timeout elapsed.
async fn drain(tracker: &TaskTracker, timeout: Duration) -> usize {
    tracker.close();

    let in_flight = tracker.len();
    if in_flight > 0 {
        info!(in_flight = in_flight, "Waiting for in-flight uploads");
    }

    match tokio::time::timeout(timeout, tracker.wait()).await {
        Ok(()) => 0,
        Err(_) => {
            let abandoned = tracker.len();
            warn!(
                abandoned = abandoned,
                timeout_secs = timeout.as_secs(),
                "Drain timeout elapsed, abandoning in-flight uploads"
            );
            abandoned
        }
    }
}

/// Concrete topic for the self-test message: wildcard levels become `self-test`
fn self_test_topic(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|level| match level {
            "#" | "+" => "self-test",
            other => other,
        })
        .collect::<Vec<_>>()
        .join("/")
}
