use crate::config::S3Config;
use crate::storage_key::StorageKey;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Error reported by an object store, carrying the service error code if any
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    /// Service error code, e.g. `AccessDenied`
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Already-authorized object storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key` in `bucket`, replacing any existing object
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

/// Classified failure of a single upload
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("S3 Access Denied: Ensure the bucket policy allows write access.")]
    AccessDenied { bucket: String },

    #[error("S3 Bucket Not Found: The bucket \"{bucket}\" does not exist.")]
    NoSuchBucket { bucket: String },

    #[error("S3 upload failed: {0}")]
    Store(#[source] StoreError),
}

impl UploadError {
    /// Only unclassified failures may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, UploadError::Store(_))
    }

    /// Short label for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            UploadError::AccessDenied { .. } => "access_denied",
            UploadError::NoSuchBucket { .. } => "no_such_bucket",
            UploadError::Store(_) => "store_error",
        }
    }
}

/// Uploads one archived message per call. Never retries.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Issue exactly one put for `key`. Every attempt is timed, whatever
    /// its outcome.
    #[instrument(skip(self, body), fields(bucket = %self.bucket, s3_key = %key, size_bytes = body.len()))]
    pub async fn upload(&self, key: &StorageKey, body: Bytes) -> Result<(), UploadError> {
        let started = Instant::now();
        let result = self
            .store
            .put(&self.bucket, key.as_str(), body, JSON_CONTENT_TYPE)
            .await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::histogram!("archiver.upload.duration_seconds", "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());

        result.map_err(|e| self.classify(e))?;

        debug!("Object uploaded");
        Ok(())
    }

    fn classify(&self, error: StoreError) -> UploadError {
        match error.code.as_deref() {
            Some("AccessDenied") => UploadError::AccessDenied {
                bucket: self.bucket.clone(),
            },
            Some("NoSuchBucket") => UploadError::NoSuchBucket {
                bucket: self.bucket.clone(),
            },
            _ => UploadError::Store(error),
        }
    }
}

/// [`ObjectStore`] backed by the AWS S3 SDK
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 client from the ambient AWS credentials chain
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 client initialized"
        );

        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|err| {
                let code = err.as_service_error().and_then(|e| e.code());
                StoreError::new(code, DisplayErrorContext(&err).to_string())
            })?;

        Ok(())
    }
}
