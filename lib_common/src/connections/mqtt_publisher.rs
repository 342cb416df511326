//! # MQTT Publisher
//!
//! Publishes the latest record to the configured topic with QoS 1 and tracks
//! whether the broker acknowledged it.
//!
//! ## Connection Model:
//! - The session is created lazily on the first non-empty publish. `connect`
//!   waits for the broker's CONNACK and then hands the `rumqttc` event loop to
//!   a background task.
//! - The background task is the only concurrent activity of the agent. It
//!   reports [`LinkEvent`]s (`Sent`, `Acked`, `Lost`) over an unbounded mpsc
//!   channel and never touches publisher state directly.
//! - `publish` polls that channel for the PUBACK of its own packet id. A lost
//!   link flips the state to `Disconnected`, and the next publish reconnects.
//!   A loss reported between two publishes is noticed before sending, so the
//!   record goes out over a fresh session instead of being dropped.
//! - Publishes that timed out before their PUBLISH left are counted, and their
//!   late `Sent` events are skipped when matching the next packet id.
//!
//! A publish that was handed to the client but not acknowledged within
//! [`AckPolicy::timeout`] is reported as [`Delivery::Unconfirmed`] and logged
//! with [`UNCONFIRMED_DELIVERY_MARKER`].

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::configs::config_relay::RelayConfig;

/// Port used when the server address carries none.
pub const DEFAULT_MQTT_PORT: u16 = 1883;
/// Log marker for publishes whose acknowledgement never arrived.
pub const UNCONFIRMED_DELIVERY_MARKER: &str = "UNCONFIRMED_DELIVERY";

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const CONNACK_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Whether a broker session is currently believed to be up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; the next publish connects first.
    Disconnected,
    /// CONNACK received and the network task is running.
    Connected,
}

/// # Delivery
///
/// The successful result of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The broker acknowledged the packet in time.
    Confirmed {
        /// MQTT packet id of the publish.
        message_id: u16,
    },
    /// The publish was queued but no acknowledgement arrived in time.
    Unconfirmed {
        /// Packet id, when the network task reported one.
        message_id: Option<u16>,
    },
    /// Nothing was sent because the payload was empty.
    Skipped,
}

impl Delivery {
    /// `true` only for [`Delivery::Confirmed`].
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Delivery::Confirmed { .. })
    }
}

/// # Publish Error
///
/// A failed delivery. It is logged by the scheduler and never ends the loop.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker could not be reached or refused the session.
    #[error("MQTT connect failed: {0}")]
    Connect(String),

    /// The client had no usable session when the publish was issued.
    #[error("MQTT client is not connected")]
    NotConnected,

    /// The network task reported the link as gone.
    #[error("MQTT connection lost: {0}")]
    ConnectionLost(String),

    /// The client refused the request itself.
    #[error("MQTT publish rejected: {0}")]
    Rejected(String),
}

impl PublishError {
    /// Whether the error means the session is unusable and must be rebuilt.
    pub fn forces_reconnect(&self) -> bool {
        matches!(
            self,
            PublishError::Connect(_) | PublishError::NotConnected | PublishError::ConnectionLost(_)
        )
    }
}

/// What the network task observes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A PUBLISH left with this packet id.
    Sent(u16),
    /// The broker acknowledged this packet id.
    Acked(u16),
    /// The event loop failed; the session is gone.
    Lost(String),
}

/// Bounds of the acknowledgement wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    /// Total time to wait for the PUBACK.
    pub timeout: Duration,
    /// Pause between two looks at the event channel.
    pub step: Duration,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            step: Duration::from_millis(100),
        }
    }
}

/// # Delivery Ticket
///
/// A publish in flight: the packet id once the network task reported it, and
/// when the publish was issued.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryTicket {
    /// Packet id of this publish, once its `Sent` event was seen.
    pub message_id: Option<u16>,
    /// Earlier publishes still queued ahead of this one. Their `Sent` events
    /// come first and are skipped.
    pub earlier_unsent: usize,
    /// When the publish was handed to the client.
    pub issued_at: Instant,
}

impl DeliveryTicket {
    fn issue(earlier_unsent: usize) -> Self {
        Self {
            message_id: None,
            earlier_unsent,
            issued_at: Instant::now(),
        }
    }

    /// Publishes of this session whose PUBLISH has not left yet, counting this
    /// one when it is still queued.
    fn still_unsent(&self) -> usize {
        self.earlier_unsent + usize::from(self.message_id.is_none())
    }
}

/// How an acknowledgement wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckWait {
    /// The PUBACK for this packet id arrived.
    Confirmed(u16),
    /// The wait bound elapsed first.
    TimedOut(Option<u16>),
    /// The link dropped while waiting.
    Lost(String),
}

/// Polls `events` in `policy.step` increments until the publish tracked by
/// `ticket` is acknowledged, the link is lost or `policy.timeout` elapses.
pub async fn wait_for_ack(
    events: &mut UnboundedReceiver<LinkEvent>,
    ticket: &mut DeliveryTicket,
    policy: AckPolicy,
) -> AckWait {
    loop {
        loop {
            match events.try_recv() {
                Ok(LinkEvent::Sent(id)) => {
                    if ticket.earlier_unsent > 0 {
                        ticket.earlier_unsent -= 1;
                    } else if ticket.message_id.is_none() {
                        ticket.message_id = Some(id);
                    }
                }
                Ok(LinkEvent::Acked(id)) => {
                    if ticket.message_id == Some(id) {
                        return AckWait::Confirmed(id);
                    }
                }
                Ok(LinkEvent::Lost(reason)) => return AckWait::Lost(reason),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    return AckWait::Lost("network task ended".to_string())
                }
            }
        }
        if ticket.issued_at.elapsed() >= policy.timeout {
            return AckWait::TimedOut(ticket.message_id);
        }
        tokio::time::sleep(policy.step).await;
    }
}

/// Why `topic` cannot carry a publish, if it cannot.
fn topic_problem(topic: &str) -> Option<String> {
    if topic.is_empty() {
        Some("topic is empty".to_string())
    } else if topic.contains(['+', '#']) {
        Some(format!("topic {} contains a wildcard", topic))
    } else {
        None
    }
}

/// Splits `tcp://host:port`, `mqtt://host` or `host` into host and port.
/// A suffix after the last `:` is only taken as a port when it is all digits
/// and fits in a `u16`.
pub fn parse_server_address(server: &str) -> (String, u16) {
    let trimmed = server.trim();
    let without_scheme = trimmed
        .strip_prefix("tcp://")
        .or_else(|| trimmed.strip_prefix("mqtt://"))
        .unwrap_or(trimmed);

    if let Some((host, port)) = without_scheme.rsplit_once(':') {
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(port) = port.parse::<u16>() {
                return (host.to_string(), port);
            }
        }
    }
    (without_scheme.to_string(), DEFAULT_MQTT_PORT)
}

/// # Record Publisher
///
/// The delivery side of a cycle.
#[async_trait]
pub trait RecordPublisher: Send {
    /// Publishes one record. An empty payload is skipped without connecting.
    async fn publish(&mut self, payload: &str) -> Result<Delivery, PublishError>;

    /// Closes the session, if any. Safe to call repeatedly.
    async fn disconnect(&mut self);
}

/// A live broker session.
struct Session {
    client: AsyncClient,
    network: JoinHandle<()>,
    events: UnboundedReceiver<LinkEvent>,
}

/// # MQTT Publisher
///
/// Owns the broker session and its connection state.
pub struct MqttPublisher {
    host: String,
    port: u16,
    client_id: String,
    topic: String,
    credentials: Option<(String, String)>,
    ack_policy: AckPolicy,
    state: ConnectionState,
    session: Option<Session>,
    /// Publishes of the current session whose `Sent` event is still due.
    unsent: usize,
}

impl MqttPublisher {
    /// Creates a disconnected publisher for the broker named in `config`.
    pub fn from_config(config: &RelayConfig) -> Self {
        let (host, port) = parse_server_address(&config.mqtt_server);
        let client_id = if config.mqtt_client_id.trim().is_empty() {
            format!("magnet-monitor-{}", std::process::id())
        } else {
            config.mqtt_client_id.trim().to_string()
        };
        let credentials = if config.mqtt_user.is_empty() {
            None
        } else {
            Some((config.mqtt_user.clone(), config.mqtt_pass.clone()))
        };
        Self {
            host,
            port,
            client_id,
            topic: config.mqtt_topic.clone(),
            credentials,
            ack_policy: AckPolicy::default(),
            state: ConnectionState::Disconnected,
            session: None,
            unsent: 0,
        }
    }

    /// Overrides the acknowledgement wait bounds.
    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The client id sent to the broker.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.as_str(), self.host.as_str(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((user, pass)) = &self.credentials {
            options.set_credentials(user.as_str(), pass.as_str());
        }
        options
    }

    /// Opens a session and waits for the broker's CONNACK. A no-op when
    /// already connected.
    pub async fn connect(&mut self) -> Result<(), PublishError> {
        if self.state == ConnectionState::Connected && self.session.is_some() {
            return Ok(());
        }
        self.drop_session();

        log::info!(
            "MQTT: connecting to {}:{} as {}",
            self.host,
            self.port,
            self.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);

        match tokio::time::timeout(CONNACK_TIMEOUT, await_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(PublishError::Connect(format!(
                    "no CONNACK from {}:{} within {}s",
                    self.host,
                    self.port,
                    CONNACK_TIMEOUT.as_secs()
                )))
            }
        }

        let (tx, events) = mpsc::unbounded_channel();
        let network = tokio::spawn(drive_network(eventloop, tx));
        self.session = Some(Session {
            client,
            network,
            events,
        });
        self.state = ConnectionState::Connected;
        log::info!("MQTT: connected to {}:{}", self.host, self.port);
        Ok(())
    }

    fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.network.abort();
        }
        self.state = ConnectionState::Disconnected;
        self.unsent = 0;
    }

    fn mark_lost(&mut self, reason: &str) {
        log::warn!("MQTT: connection to {}:{} lost: {}", self.host, self.port, reason);
        self.drop_session();
    }

    /// Consumes events left over from earlier publishes. Returns why the
    /// session is gone when the network task reported a loss or has ended.
    fn settle_session(&mut self) -> Option<String> {
        let session = self.session.as_mut()?;
        loop {
            match session.events.try_recv() {
                Ok(LinkEvent::Sent(_)) => self.unsent = self.unsent.saturating_sub(1),
                Ok(LinkEvent::Acked(_)) => {}
                Ok(LinkEvent::Lost(reason)) => return Some(reason),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return Some("network task ended".to_string()),
            }
        }
        if session.network.is_finished() {
            return Some("network task ended".to_string());
        }
        None
    }

    async fn publish_connected(&mut self, payload: &str) -> Result<Delivery, PublishError> {
        let session = self.session.as_mut().ok_or(PublishError::NotConnected)?;

        let mut ticket = DeliveryTicket::issue(self.unsent);
        if let Err(e) = session
            .client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
        {
            return Err(if session.network.is_finished() {
                PublishError::ConnectionLost(e.to_string())
            } else {
                PublishError::Rejected(e.to_string())
            });
        }

        let outcome = wait_for_ack(&mut session.events, &mut ticket, self.ack_policy).await;
        self.unsent = ticket.still_unsent();
        match outcome {
            AckWait::Confirmed(message_id) => {
                log::info!(
                    "MQTT: delivered message {} to {} ({} bytes)",
                    message_id,
                    self.topic,
                    payload.len()
                );
                Ok(Delivery::Confirmed { message_id })
            }
            AckWait::TimedOut(message_id) => {
                let id = message_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                log::warn!(
                    "{}: message {} to {} not acknowledged within {}ms, left queued",
                    UNCONFIRMED_DELIVERY_MARKER,
                    id,
                    self.topic,
                    self.ack_policy.timeout.as_millis()
                );
                Ok(Delivery::Unconfirmed { message_id })
            }
            AckWait::Lost(reason) => Err(PublishError::ConnectionLost(reason)),
        }
    }
}

/// Polls the event loop until the broker accepts or refuses the session.
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), PublishError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(PublishError::Connect(format!("broker refused session: {:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(e) => return Err(PublishError::Connect(e.to_string())),
        }
    }
}

/// Drives the MQTT event loop and reports publish progress until the session
/// ends.
async fn drive_network(mut eventloop: EventLoop, events: UnboundedSender<LinkEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = events.send(LinkEvent::Sent(pkid));
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = events.send(LinkEvent::Acked(ack.pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("MQTT: disconnect sent, network task ending");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events.send(LinkEvent::Lost(e.to_string()));
                break;
            }
        }
    }
}

#[async_trait]
impl RecordPublisher for MqttPublisher {
    async fn publish(&mut self, payload: &str) -> Result<Delivery, PublishError> {
        if payload.is_empty() {
            log::debug!("MQTT: empty payload, nothing to publish");
            return Ok(Delivery::Skipped);
        }
        if let Some(problem) = topic_problem(&self.topic) {
            log::warn!("MQTT: not publishing, {}", problem);
            return Err(PublishError::Rejected(problem));
        }
        if let Some(reason) = self.settle_session() {
            self.mark_lost(&reason);
        }
        if self.state == ConnectionState::Disconnected {
            if let Err(e) = self.connect().await {
                self.drop_session();
                return Err(e);
            }
        }

        let result = self.publish_connected(payload).await;
        if let Err(e) = &result {
            if e.forces_reconnect() {
                self.mark_lost(&e.to_string());
            }
        }
        result
    }

    async fn disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            self.state = ConnectionState::Disconnected;
            return;
        };
        self.state = ConnectionState::Disconnected;

        if let Err(e) = session.client.disconnect().await {
            log::debug!("MQTT: disconnect request failed: {}", e);
        }
        let mut network = session.network;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut network).await.is_err() {
            log::debug!("MQTT: network task still running, aborting it");
            network.abort();
        }
        log::info!("MQTT: disconnected from {}:{}", self.host, self.port);
    }
}
