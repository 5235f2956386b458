//! Telemetry Archiver
//!
//! Archives car-park telemetry from an MQTT broker into S3. Every message
//! received on the facility event topics becomes one JSON object, filed under
//! a category derived from its topic and partitioned by calendar date.
//!
//! ## Features
//!
//! - **Topic Categorization**: entries, exits, payment transactions and door
//!   transitions are filed separately; anything else lands in `other_logs`
//! - **Date-Partitioned Keys**: `{env}/ingest/{version}/mqtt/{category}/{YYYY}/{MM}/{DD}/{token}.json`
//!   with a collision-free token per object
//! - **Isolated Uploads**: each message is archived in its own task; a failed
//!   upload never affects other messages or the subscription
//! - **Bounded Retry**: transient S3 failures are retried with exponential
//!   backoff, permission and missing-bucket errors are not
//! - **Health Endpoints**: `/health` and `/ready` backed by live pipeline state
//!
//! ## Architecture
//!
//! ```text
//! MQTT Broker                                              S3 Bucket
//! ┌──────────────┐                                        ┌──────────────┐
//! │ /carparks/…/ │                                        │ {prefix}/    │
//! │  events/#    │                                        │   {category}/│
//! └──────────────┘                                        │   {date}/    │
//!        │                                                └──────────────┘
//!        ▼                                                       ▲
//! ┌──────────────┐   spawn    ┌──────────────┐           ┌──────────────┐
//! │ Subscription │───────────▶│ Message      │──────────▶│ Uploader     │
//! │ Manager      │ per message│ Archiver     │  retry    │              │
//! └──────────────┘            └──────────────┘           └──────────────┘
//!        ▲                       │        │
//!        │                       ▼        ▼
//! ┌──────────────┐        ┌──────────┐ ┌──────────────┐
//! │ Pipeline     │        │ Topic    │ │ Key          │
//! │ Supervisor   │        │ Router   │ │ Builder      │
//! └──────────────┘        └──────────┘ └──────────────┘
//! ```

pub mod archiver;
pub mod config;
pub mod envelope;
pub mod health;
pub mod storage_key;
pub mod subscription;
pub mod supervisor;
pub mod topic_router;
pub mod uploader;

pub use archiver::{ArchiveReceipt, MessageArchiver, MessageError, RetryPolicy};
pub use config::{Config, ConfigError, RunMode};
pub use envelope::{ArchivedMessage, MessageEnvelope};
pub use health::{HealthSnapshot, HealthState, PipelineHealth};
pub use storage_key::{KeyBuilder, ReferenceTimeZone, StorageKey};
pub use subscription::{
    BrokerError, BrokerEvent, BrokerSession, MqttSession, SubscriptionManager, SubscriptionState,
};
pub use supervisor::{
    PipelineError, PipelineReport, PipelineSupervisor, StopReason, SupervisorOptions,
};
pub use topic_router::{categorize, Category};
pub use uploader::{ObjectStore, S3ObjectStore, StoreError, UploadError, Uploader};
