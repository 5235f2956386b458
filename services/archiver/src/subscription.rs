use crate::archiver::MessageArchiver;
use crate::config::MqttConfig;
use crate::envelope::MessageEnvelope;
use crate::health::PipelineHealth;
use crate::supervisor::PipelineError;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode, Transport,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of the broker subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribing,
    Subscribed,
    /// Startup failed; terminal
    Errored,
}

/// Broker event relevant to the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Connection acknowledgement
    ConnAck { accepted: bool, session_present: bool },
    /// Subscription acknowledgement, one entry per requested filter in order
    SubAck { granted: Vec<bool> },
    Publish { topic: String, payload: Bytes },
    /// Keep-alives, outgoing packets and anything else
    Other,
}

/// Errors raised by the broker session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Broker client error: {0}")]
    Client(String),

    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
}

/// Connected, authenticated broker channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerSession: Send {
    /// Request a subscription to every pattern with a single call
    async fn subscribe(&mut self, patterns: &[String]) -> Result<(), BrokerError>;

    /// Wait for the next broker event. After an error the next poll reconnects.
    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError>;

    async fn disconnect(&mut self);
}

/// [`BrokerSession`] over a rumqttc client and event loop
pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttSession {
    pub fn new(config: &MqttConfig) -> Result<Self, BrokerError> {
        let endpoint = parse_broker_url(&config.broker_url)?;

        let mut options = MqttOptions::new(&config.client_id, endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
        options.set_clean_session(config.clean_session);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        if endpoint.tls || config.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, config.channel_capacity);

        info!(
            client_id = %config.client_id,
            tls = endpoint.tls || config.use_tls,
            "MQTT session created"
        );

        Ok(Self { client, eventloop })
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn subscribe(&mut self, patterns: &[String]) -> Result<(), BrokerError> {
        let filters = patterns
            .iter()
            .map(|pattern| SubscribeFilter::new(pattern.clone(), QoS::AtLeastOnce));

        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| BrokerError::Client(e.to_string()))
    }

    async fn poll(&mut self) -> Result<BrokerEvent, BrokerError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => Ok(BrokerEvent::ConnAck {
                accepted: ack.code == ConnectReturnCode::Success,
                session_present: ack.session_present,
            }),
            Ok(Event::Incoming(Packet::SubAck(ack))) => Ok(BrokerEvent::SubAck {
                granted: ack
                    .return_codes
                    .iter()
                    .map(|code| !matches!(code, SubscribeReasonCode::Failure))
                    .collect(),
            }),
            Ok(Event::Incoming(Packet::Publish(publish))) => Ok(BrokerEvent::Publish {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Ok(_) => Ok(BrokerEvent::Other),
            Err(e) => Err(BrokerError::Connection(e.to_string())),
        }
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BrokerEndpoint<'a> {
    host: &'a str,
    port: u16,
    tls: bool,
}

/// Parse broker URL in format mqtts://host:port, mqtt://host:port, tcp://host:port or host:port
fn parse_broker_url(url: &str) -> Result<BrokerEndpoint<'_>, BrokerError> {
    let (rest, tls) = if let Some(rest) = url
        .strip_prefix("mqtts://")
        .or_else(|| url.strip_prefix("ssl://"))
    {
        (rest, true)
    } else {
        let rest = url.trim_start_matches("mqtt://");
        (rest.trim_start_matches("tcp://"), false)
    };
    let rest = rest.trim_end_matches('/');
    let default_port = if tls { 8883 } else { 1883 };

    let parts: Vec<&str> = rest.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok(BrokerEndpoint {
            host: *host,
            port: default_port,
            tls,
        }),
        [host, port] if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| BrokerError::InvalidUrl(format!("invalid port in '{}'", url)))?;
            Ok(BrokerEndpoint {
                host: *host,
                port,
                tls,
            })
        }
        _ => Err(BrokerError::InvalidUrl(url.to_string())),
    }
}

/// Owns the broker session: connects, subscribes the full pattern set with
/// one request, then spawns one archive task per delivered message.
pub struct SubscriptionManager<S: BrokerSession> {
    session: S,
    patterns: Vec<String>,
    archiver: Arc<MessageArchiver>,
    health: Arc<PipelineHealth>,
    tracker: TaskTracker,
    upload_permits: Arc<Semaphore>,
    reconnect_delay: Duration,
    on_first_archive: Option<CancellationToken>,
}

impl<S: BrokerSession> SubscriptionManager<S> {
    pub fn new(
        session: S,
        patterns: Vec<String>,
        archiver: Arc<MessageArchiver>,
        tracker: TaskTracker,
        upload_concurrency: usize,
    ) -> Self {
        let health = archiver.health().clone();
        Self {
            session,
            patterns,
            archiver,
            health,
            tracker,
            upload_permits: Arc::new(Semaphore::new(upload_concurrency.max(1))),
            reconnect_delay: Duration::from_secs(1),
            on_first_archive: None,
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Cancel `token` once any message has been archived
    pub fn cancel_on_first_archive(mut self, token: CancellationToken) -> Self {
        self.on_first_archive = Some(token);
        self
    }

    pub fn state(&self) -> SubscriptionState {
        self.health.state()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn set_state(&self, state: SubscriptionState) {
        debug!(state = ?state, "Subscription state changed");
        self.health.set_state(state);
    }

    fn fail(&self, error: PipelineError) -> PipelineError {
        self.set_state(SubscriptionState::Errored);
        error
    }

    /// Drive the session from `Disconnected` to `Subscribed`.
    ///
    /// Connection and subscription failures are fatal and not retried here.
    #[instrument(skip(self), fields(patterns = self.patterns.len()))]
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        self.set_state(SubscriptionState::Connecting);
        self.await_connection().await?;
        self.set_state(SubscriptionState::Connected);
        info!("Connected to MQTT broker");

        self.set_state(SubscriptionState::Subscribing);
        if let Err(e) = self.session.subscribe(&self.patterns).await {
            return Err(self.fail(PipelineError::Subscription {
                patterns: self.patterns.clone(),
                reason: e.to_string(),
            }));
        }
        self.await_subscription().await?;
        self.set_state(SubscriptionState::Subscribed);

        info!(topics = ?self.patterns, "Subscribed to topics");
        Ok(())
    }

    async fn await_connection(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.session.poll().await {
                Ok(BrokerEvent::ConnAck { accepted: true, .. }) => return Ok(()),
                Ok(BrokerEvent::ConnAck { accepted: false, .. }) => {
                    return Err(self.fail(PipelineError::Connection(
                        "broker refused the connection".to_string(),
                    )));
                }
                Ok(_) => continue,
                Err(e) => return Err(self.fail(PipelineError::Connection(e.to_string()))),
            }
        }
    }

    async fn await_subscription(&mut self) -> Result<(), PipelineError> {
        loop {
            match self.session.poll().await {
                Ok(BrokerEvent::SubAck { granted }) => {
                    let rejected = rejected_patterns(&self.patterns, &granted);
                    if rejected.is_empty() {
                        return Ok(());
                    }
                    return Err(self.fail(PipelineError::Subscription {
                        patterns: rejected,
                        reason: "broker rejected the subscription".to_string(),
                    }));
                }
                // A persisted session may deliver before the acknowledgement
                Ok(BrokerEvent::Publish { topic, payload }) => {
                    self.dispatch(MessageEnvelope::new(topic, payload)).await;
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(self.fail(PipelineError::Subscription {
                        patterns: self.patterns.clone(),
                        reason: e.to_string(),
                    }));
                }
            }
        }
    }

    /// Spawn the archive task for one message. Tasks share nothing but health.
    ///
    /// Waits for a free upload slot first, so a slow store holds back intake
    /// instead of piling up tasks.
    pub async fn dispatch(&self, envelope: MessageEnvelope) {
        self.health.record_received();
        debug!(topic = %envelope.topic, size_bytes = envelope.payload.len(), "Received message");

        // Acquire semaphore permit to limit concurrency
        let Ok(permit) = self.upload_permits.clone().acquire_owned().await else {
            return;
        };

        let archiver = self.archiver.clone();
        let on_first_archive = self.on_first_archive.clone();

        self.tracker.spawn(async move {
            let _permit = permit;
            if archiver.handle(envelope).await.is_some() {
                if let Some(token) = on_first_archive {
                    token.cancel();
                }
            }
        });
    }

    /// Receive and dispatch messages until `shutdown` is cancelled.
    ///
    /// Broker errors are reported to health and the session is polled again
    /// after the reconnect delay; they never affect in-flight messages.
    #[instrument(skip_all)]
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!("Starting message dispatch loop");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, leaving dispatch loop");
                    break;
                }
                event = self.session.poll() => match event {
                    Ok(BrokerEvent::Publish { topic, payload }) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                warn!("Shutdown requested while waiting for an upload slot, message dropped");
                                break;
                            }
                            _ = self.dispatch(MessageEnvelope::new(topic, payload)) => {}
                        }
                    }
                    Ok(BrokerEvent::ConnAck { accepted: true, session_present }) => {
                        self.on_reconnected(session_present).await;
                    }
                    Ok(BrokerEvent::ConnAck { accepted: false, .. }) => {
                        self.health
                            .record_broker_error("broker refused the reconnection".to_string());
                        warn!("Broker refused the reconnection");
                    }
                    Ok(BrokerEvent::SubAck { granted }) => {
                        let rejected = rejected_patterns(&self.patterns, &granted);
                        if rejected.is_empty() {
                            self.set_state(SubscriptionState::Subscribed);
                            info!("Subscription restored");
                        } else {
                            self.health.record_broker_error(format!(
                                "broker rejected re-subscription to {:?}",
                                rejected
                            ));
                            error!(rejected = ?rejected, "Broker rejected re-subscription");
                        }
                    }
                    Ok(BrokerEvent::Other) => {}
                    Err(e) => {
                        self.health.record_broker_error(e.to_string());
                        self.set_state(SubscriptionState::Connecting);
                        warn!(error = %e, "MQTT broker error, reconnecting");

                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.reconnect_delay) => {}
                        }
                    }
                }
            }
        }

        self.session.disconnect().await;
        self.set_state(SubscriptionState::Disconnected);
    }

    async fn on_reconnected(&mut self, session_present: bool) {
        if session_present {
            self.set_state(SubscriptionState::Subscribed);
            info!("Reconnected to MQTT broker with persisted session");
            return;
        }

        info!("Reconnected to MQTT broker, re-subscribing");
        self.set_state(SubscriptionState::Subscribing);
        if let Err(e) = self.session.subscribe(&self.patterns).await {
            self.health.record_broker_error(e.to_string());
            error!(error = %e, "Failed to re-subscribe after reconnect");
        }
    }
}

fn rejected_patterns(patterns: &[String], granted: &[bool]) -> Vec<String> {
    patterns
        .iter()
        .enumerate()
        .filter(|(i, _)| !granted.get(*i).copied().unwrap_or(false))
        .map(|(_, pattern)| pattern.clone())
        .collect()
}
