use crate::config::RetryConfig;
use crate::envelope::{ArchivedMessage, MessageEnvelope};
use crate::health::PipelineHealth;
use crate::storage_key::{KeyBuilder, StorageKey};
use crate::topic_router::{categorize, Category};
use crate::uploader::{UploadError, Uploader};
use backoff::future::retry_notify;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, info_span, instrument, warn, Instrument, Span};

/// Failure to archive a single message. Never escapes the message's task.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to serialize archived message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl MessageError {
    pub fn reason(&self) -> &'static str {
        match self {
            MessageError::Serialization(_) => "serialization",
            MessageError::Upload(e) => e.reason(),
        }
    }
}

/// Bounded exponential backoff for transient upload failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; 1 disables retries
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// One attempt, no retries
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::from_millis(0),
            max_interval: Duration::from_millis(0),
            multiplier: 1.0,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            // attempts are bounded by max_attempts instead
            .with_max_elapsed_time(None)
            .build()
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            max_interval: Duration::from_millis(config.max_interval_ms),
            multiplier: config.multiplier,
        }
    }
}

/// Where a message ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReceipt {
    pub category: Category,
    pub key: StorageKey,
    pub attempts: u32,
}

/// Per-message unit of work: categorize, build the key, serialize, upload.
pub struct MessageArchiver {
    key_builder: KeyBuilder,
    uploader: Uploader,
    retry: RetryPolicy,
    health: Arc<PipelineHealth>,
}

impl MessageArchiver {
    pub fn new(
        key_builder: KeyBuilder,
        uploader: Uploader,
        retry: RetryPolicy,
        health: Arc<PipelineHealth>,
    ) -> Self {
        Self {
            key_builder,
            uploader,
            retry,
            health,
        }
    }

    pub fn health(&self) -> &Arc<PipelineHealth> {
        &self.health
    }

    /// Archive one message and record the outcome in pipeline health.
    ///
    /// Runs under its own root span so each message is an independent trace.
    pub async fn handle(&self, envelope: MessageEnvelope) -> Option<ArchiveReceipt> {
        let span = info_span!(
            parent: None,
            "mqtt_message",
            topic = %envelope.topic,
            payload_size = envelope.payload.len(),
            category = tracing::field::Empty,
            s3_key = tracing::field::Empty,
        );

        async move {
            match self.archive(envelope).await {
                Ok(receipt) => {
                    self.health.record_archived();
                    info!(
                        s3_key = %receipt.key,
                        attempts = receipt.attempts,
                        "Message archived"
                    );
                    Some(receipt)
                }
                Err(e) => {
                    self.health.record_failed(e.reason(), e.to_string());
                    error!(error = %e, reason = e.reason(), "Failed to archive message");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Archive one message, propagating the failure
    pub async fn archive(&self, envelope: MessageEnvelope) -> Result<ArchiveReceipt, MessageError> {
        let category = categorize(&envelope.topic);
        let key = self.key_builder.build_key(category, &envelope.received_at);

        let span = Span::current();
        span.record("category", category.as_str());
        span.record("s3_key", key.as_str());

        let body = ArchivedMessage::from_envelope(&envelope).to_json()?;
        let attempts = self.upload_with_retry(&key, body).await?;

        Ok(ArchiveReceipt {
            category,
            key,
            attempts,
        })
    }

    /// Retry transient failures up to the policy's attempt bound.
    /// Returns the number of attempts made.
    #[instrument(skip(self, body), fields(s3_key = %key))]
    async fn upload_with_retry(&self, key: &StorageKey, body: Bytes) -> Result<u32, UploadError> {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.retry.max_attempts;

        let operation = || {
            let body = body.clone();
            let attempts = &attempts;
            async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                match self.uploader.upload(key, body).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        };

        let notify = |e: UploadError, wait: Duration| {
            self.health.record_retry();
            warn!(
                error = %e,
                retry_in_ms = wait.as_millis() as u64,
                "Upload failed, retrying"
            );
        };

        retry_notify(self.retry.backoff(), operation, notify).await?;

        Ok(attempts.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_key::ReferenceTimeZone;
    use crate::uploader::{MockObjectStore, StoreError};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            multiplier: 1.5,
        }
    }

    fn archiver_with(store: MockObjectStore, retry: RetryPolicy) -> MessageArchiver {
        MessageArchiver::new(
            KeyBuilder::new("dev/ingest/sv1/mqtt", ReferenceTimeZone::Utc),
            Uploader::new(Arc::new(store), "telemetry-archive"),
            retry,
            Arc::new(PipelineHealth::new()),
        )
    }

    fn entry_message() -> MessageEnvelope {
        MessageEnvelope::received_at(
            "/carparks/X/events/entries/lane1",
            r#"{"car":"ABC123"}"#,
            Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap()
                + chrono::Duration::milliseconds(123),
        )
    }

    #[tokio::test]
    async fn test_entry_scenario_key_and_body() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .withf(|_, key: &str, body: &Bytes, _| {
                key.starts_with("dev/ingest/sv1/mqtt/entry_logs/2024/03/05/1709632800123-")
                    && key.ends_with(".json")
                    && &body[..]
                        == br#"{"topic":"/carparks/X/events/entries/lane1","msg":"{\"car\":\"ABC123\"}"}"#
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let archiver = archiver_with(store, fast_retry(3));
        let receipt = archiver.archive(entry_message()).await.unwrap();

        assert_eq!(receipt.category, Category::EntryLogs);
        assert_eq!(receipt.attempts, 1);
    }

    #[tokio::test]
    async fn test_same_message_twice_yields_two_objects() {
        let mut store = MockObjectStore::new();
        store.expect_put().times(2).returning(|_, _, _, _| Ok(()));

        let archiver = archiver_with(store, fast_retry(1));
        let first = archiver.archive(entry_message()).await.unwrap();
        let second = archiver.archive(entry_message()).await.unwrap();

        assert_ne!(first.key, second.key);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut store = MockObjectStore::new();
        store.expect_put().times(3).returning(move |_, _, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::new(Some("InternalError"), "try again"))
            } else {
                Ok(())
            }
        });

        let archiver = archiver_with(store, fast_retry(3));
        let receipt = archiver.archive(entry_message()).await.unwrap();

        assert_eq!(receipt.attempts, 3);
        assert_eq!(archiver.health().snapshot().upload_retries, 2);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .times(2)
            .returning(|_, _, _, _| Err(StoreError::new(None, "connection reset")));

        let archiver = archiver_with(store, fast_retry(2));
        let err = archiver.archive(entry_message()).await.unwrap_err();

        assert!(matches!(err, MessageError::Upload(UploadError::Store(_))));
    }

    #[tokio::test]
    async fn test_access_denied_is_not_retried() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _, _, _| Err(StoreError::new(Some("AccessDenied"), "denied")));

        let archiver = archiver_with(store, fast_retry(5));
        let err = archiver.archive(entry_message()).await.unwrap_err();

        assert!(matches!(
            err,
            MessageError::Upload(UploadError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_single_attempt_policy_never_retries() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _, _, _| Err(StoreError::new(None, "timeout")));

        let archiver = archiver_with(store, RetryPolicy::single_attempt());
        assert!(archiver.archive(entry_message()).await.is_err());
    }

    #[tokio::test]
    async fn test_handle_records_failure_in_health() {
        let mut store = MockObjectStore::new();
        store
            .expect_put()
            .times(1)
            .returning(|_, _, _, _| Err(StoreError::new(Some("AccessDenied"), "denied")));

        let archiver = archiver_with(store, fast_retry(3));
        let receipt = archiver.handle(entry_message()).await;

        assert!(receipt.is_none());
        let snapshot = archiver.health().snapshot();
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.messages_archived, 0);
        assert!(snapshot
            .last_upload_error
            .unwrap()
            .starts_with("S3 Access Denied"));
    }

    #[tokio::test]
    async fn test_handle_records_success_in_health() {
        let mut store = MockObjectStore::new();
        store.expect_put().times(1).returning(|_, _, _, _| Ok(()));

        let archiver = archiver_with(store, fast_retry(3));
        assert!(archiver.handle(entry_message()).await.is_some());
        assert_eq!(archiver.health().messages_archived(), 1);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig {
            max_attempts: 0,
            initial_interval_ms: 100,
            max_interval_ms: 1000,
            multiplier: 3.0,
        });

        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_interval, Duration::from_millis(100));
    }

    /// Recorder that keeps every histogram sample with its key
    #[derive(Default)]
    struct CapturingRecorder {
        samples: Arc<parking_lot::Mutex<Vec<(metrics::Key, f64)>>>,
    }

    struct CapturedHistogram {
        key: metrics::Key,
        samples: Arc<parking_lot::Mutex<Vec<(metrics::Key, f64)>>>,
    }

    impl metrics::HistogramFn for CapturedHistogram {
        fn record(&self, value: f64) {
            self.samples.lock().push((self.key.clone(), value));
        }
    }

    impl metrics::Recorder for CapturingRecorder {
        fn describe_counter(
            &self,
            _: metrics::KeyName,
            _: Option<metrics::Unit>,
            _: metrics::SharedString,
        ) {
        }
        fn describe_gauge(
            &self,
            _: metrics::KeyName,
            _: Option<metrics::Unit>,
            _: metrics::SharedString,
        ) {
        }
        fn describe_histogram(
            &self,
            _: metrics::KeyName,
            _: Option<metrics::Unit>,
            _: metrics::SharedString,
        ) {
        }

        fn register_counter(
            &self,
            _: &metrics::Key,
            _: &metrics::Metadata<'_>,
        ) -> metrics::Counter {
            metrics::Counter::noop()
        }

        fn register_gauge(&self, _: &metrics::Key, _: &metrics::Metadata<'_>) -> metrics::Gauge {
            metrics::Gauge::noop()
        }

        fn register_histogram(
            &self,
            key: &metrics::Key,
            _: &metrics::Metadata<'_>,
        ) -> metrics::Histogram {
            metrics::Histogram::from_arc(Arc::new(CapturedHistogram {
                key: key.clone(),
                samples: self.samples.clone(),
            }))
        }
    }

    #[test]
    fn test_upload_duration_recorded_per_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut store = MockObjectStore::new();
        store.expect_put().times(3).returning(move |_, _, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::new(Some("SlowDown"), "reduce your request rate"))
            } else {
                Ok(())
            }
        });
        let archiver = archiver_with(store, fast_retry(3));

        let recorder = CapturingRecorder::default();
        let samples = recorder.samples.clone();

        metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            runtime.block_on(archiver.handle(entry_message())).unwrap();
        });

        let outcomes: Vec<String> = samples
            .lock()
            .iter()
            .filter(|(key, _)| key.name() == "archiver.upload.duration_seconds")
            .map(|(key, _)| {
                key.labels()
                    .find(|label| label.key() == "outcome")
                    .map(|label| label.value().to_string())
                    .unwrap_or_default()
            })
            .collect();

        assert_eq!(outcomes, vec!["error", "error", "ok"]);
    }
}
