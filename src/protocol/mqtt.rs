// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT transport.
//!
//! [`MqttTransport`] drives a `rumqttc` client from a background task. The
//! task keeps reconnecting at the configured retry interval, reports
//! connection changes to the run loop and resolves a [`Completion`] for
//! every request once the broker acknowledges it.
//!
//! # Examples
//!
//! ```no_run
//! use homie_runtime::protocol::MqttTransport;
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), homie_runtime::error::TransportError> {
//! let transport = MqttTransport::builder()
//!     .host("192.168.1.50")
//!     .port(1883)
//!     .credentials("user", "password")
//!     .retry_interval(Duration::from_secs(5))
//!     .build()?;
//!
//! // Or from a URL
//! let transport = MqttTransport::from_url("tcp://192.168.1.50:1883")?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, SubscribeReasonCode,
};
use tokio::task::JoinHandle;

use super::{Completion, CompletionSender, Publication, QoS, SessionOptions, Transport, TransportEvents};
use crate::error::TransportError;

/// Broker used when nothing else is configured.
pub const DEFAULT_BROKER_URL: &str = "tcp://127.0.0.1:1883";

const REQUEST_CAPACITY: usize = 64;

/// Configuration for an MQTT transport.
#[derive(Debug, Clone)]
struct MqttTransportConfig {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    keep_alive: Duration,
    connection_timeout: Duration,
    retry_interval: Duration,
    ack_timeout: Duration,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

/// Builder for an [`MqttTransport`].
#[derive(Debug, Default)]
pub struct MqttTransportBuilder {
    config: MqttTransportConfig,
}

impl MqttTransportBuilder {
    /// Sets the broker host address.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the broker port (default: 1883).
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets authentication credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.credentials = Some((username.into(), password.into()));
        self
    }

    /// Sets the keep-alive interval (default: 60 seconds).
    #[must_use]
    pub fn keep_alive(mut self, duration: Duration) -> Self {
        self.config.keep_alive = duration;
        self
    }

    /// Sets how long [`Transport::connect`] waits for the first
    /// acknowledgement before leaving the session to the retry loop
    /// (default: 10 seconds).
    #[must_use]
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connection_timeout = duration;
        self
    }

    /// Sets the delay between connection attempts (default: 60 seconds).
    #[must_use]
    pub fn retry_interval(mut self, duration: Duration) -> Self {
        self.config.retry_interval = duration;
        self
    }

    /// Sets how long a request may wait for its acknowledgement
    /// (default: 10 seconds).
    #[must_use]
    pub fn ack_timeout(mut self, duration: Duration) -> Self {
        self.config.ack_timeout = duration;
        self
    }

    /// Builds the transport. No connection is made until
    /// [`Transport::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if no host is set.
    pub fn build(self) -> Result<MqttTransport, TransportError> {
        if self.config.host.is_empty() {
            return Err(TransportError::InvalidAddress(
                "MQTT broker host is required".to_string(),
            ));
        }

        Ok(MqttTransport {
            config: self.config,
            tracker: Arc::new(Mutex::new(AckTracker::default())),
            session: Mutex::new(None),
        })
    }
}

struct Session {
    client: AsyncClient,
    stopping: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// MQTT transport backed by `rumqttc`.
pub struct MqttTransport {
    config: MqttTransportConfig,
    tracker: Arc<Mutex<AckTracker>>,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> MqttTransportBuilder {
        MqttTransportBuilder::default()
    }

    /// Creates a transport from a broker URL such as
    /// `tcp://192.168.1.50:1883` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] for a malformed URL.
    pub fn from_url(url: &str) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(url)?;
        Self::builder().host(host).port(port).build()
    }

    /// Returns the broker host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Returns the broker port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    fn mqtt_options(&self, options: &SessionOptions) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(&options.client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        mqtt_options.set_clean_session(true);

        if let Some((ref username, ref password)) = self.config.credentials {
            mqtt_options.set_credentials(username, password);
        }

        let will = &options.last_will;
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            to_mqtt_qos(will.qos),
            will.retained,
        ));
        mqtt_options
    }
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("session", &self.session.lock().is_some())
            .finish()
    }
}

impl Transport for MqttTransport {
    async fn connect(
        &self,
        options: SessionOptions,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        if self.session.lock().is_some() {
            return Err(TransportError::ConnectionFailed(
                "session already started".to_string(),
            ));
        }

        let (client, event_loop) = AsyncClient::new(self.mqtt_options(&options), REQUEST_CAPACITY);
        let stopping = Arc::new(AtomicBool::new(false));
        let (first_connack_tx, first_connack_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(handle_events(
            event_loop,
            EventContext {
                events,
                tracker: Arc::clone(&self.tracker),
                stopping: Arc::clone(&stopping),
                retry_interval: self.config.retry_interval,
                first_connack: Some(first_connack_tx),
            },
        ));

        *self.session.lock() = Some(Session {
            client,
            stopping,
            task,
        });

        tracing::info!(
            host = %self.config.host,
            port = %self.config.port,
            client_id = %options.client_id,
            "Connecting to MQTT broker"
        );

        // Retries continue in the background either way
        let timeout = self.config.connection_timeout;
        if tokio::time::timeout(timeout, first_connack_rx).await.is_err() {
            tracing::warn!(
                host = %self.config.host,
                timeout_secs = timeout.as_secs(),
                "MQTT broker not reachable yet, retrying in background"
            );
        }
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<Completion, TransportError> {
        let client = self.client()?;
        let qos = to_mqtt_qos(publication.qos);
        let (seq, completion) = self.tracker.lock().register(
            RequestKind::Publish,
            publication.qos == QoS::AtMostOnce,
            &publication.topic,
        );

        if let Err(e) = client
            .publish(&publication.topic, qos, publication.retained, publication.payload)
            .await
        {
            self.tracker.lock().cancel(RequestKind::Publish, seq);
            return Err(e.into());
        }
        Ok(completion.with_timeout(self.config.ack_timeout))
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<Completion, TransportError> {
        let client = self.client()?;
        let (seq, completion) = self
            .tracker
            .lock()
            .register(RequestKind::Subscribe, false, filter);

        if let Err(e) = client.subscribe(filter, to_mqtt_qos(qos)).await {
            self.tracker.lock().cancel(RequestKind::Subscribe, seq);
            return Err(e.into());
        }
        tracing::debug!(filter = %filter, "Subscribing");
        Ok(completion.with_timeout(self.config.ack_timeout))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<Completion, TransportError> {
        let client = self.client()?;
        let (seq, completion) = self
            .tracker
            .lock()
            .register(RequestKind::Unsubscribe, false, filter);

        if let Err(e) = client.unsubscribe(filter).await {
            self.tracker.lock().cancel(RequestKind::Unsubscribe, seq);
            return Err(e.into());
        }
        Ok(completion.with_timeout(self.config.ack_timeout))
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        tracing::info!(
            host = %self.config.host,
            port = %self.config.port,
            "Disconnecting from MQTT broker"
        );
        session.stopping.store(true, Ordering::Release);
        let result = session.client.disconnect().await;

        let mut task = session.task;
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::debug!("MQTT event loop still busy after grace period, aborting");
            task.abort();
        }
        self.tracker
            .lock()
            .fail_all(&TransportError::ConnectionFailed("disconnected".to_string()));

        result.map_err(TransportError::from)
    }
}

struct EventContext {
    events: TransportEvents,
    tracker: Arc<Mutex<AckTracker>>,
    stopping: Arc<AtomicBool>,
    retry_interval: Duration,
    first_connack: Option<tokio::sync::oneshot::Sender<()>>,
}

/// Polls the event loop until an orderly disconnect completes.
async fn handle_events(mut event_loop: EventLoop, mut ctx: EventContext) {
    let mut connected = false;

    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                tracing::debug!(?connack, "MQTT broker connected");
                connected = true;
                if let Some(tx) = ctx.first_connack.take() {
                    let _ = tx.send(());
                }
                ctx.events.connected().await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                tracing::debug!(topic = %publish.topic, "MQTT message received");
                ctx.events.deliver(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                ctx.tracker
                    .lock()
                    .acknowledge(RequestKind::Publish, ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubComp(ack))) => {
                ctx.tracker
                    .lock()
                    .acknowledge(RequestKind::Publish, ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::SubAck(suback))) => {
                tracing::debug!(?suback, "MQTT subscription acknowledged");
                let rejected = suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                ctx.tracker
                    .lock()
                    .acknowledge_subscription(suback.pkid, rejected);
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                ctx.tracker
                    .lock()
                    .acknowledge(RequestKind::Unsubscribe, ack.pkid, Ok(()));
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                ctx.tracker.lock().sent(RequestKind::Publish, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                ctx.tracker.lock().sent(RequestKind::Subscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                ctx.tracker.lock().sent(RequestKind::Unsubscribe, pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if ctx.stopping.load(Ordering::Acquire) {
                    break;
                }
                tracing::warn!(error = %e, "MQTT connection error");
                ctx.tracker
                    .lock()
                    .fail_in_flight(&TransportError::ConnectionFailed(e.to_string()));
                if connected {
                    connected = false;
                    ctx.events.connection_lost().await;
                }
                tokio::time::sleep(ctx.retry_interval).await;
                if ctx.stopping.load(Ordering::Acquire) {
                    break;
                }
            }
        }
    }
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// Parses an MQTT URL into host and port.
///
/// Accepts `mqtt://host:port`, `tcp://host:port`, or `host:port`.
fn parse_mqtt_url(url: &str) -> Result<(String, u16), TransportError> {
    let url = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    let (host, port) = if let Some((h, p)) = url.rsplit_once(':') {
        let port = p
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("Invalid port: {p}")))?;
        (h.to_string(), port)
    } else {
        (url.to_string(), 1883)
    };

    if host.is_empty() {
        return Err(TransportError::InvalidAddress(
            "MQTT broker host is required".to_string(),
        ));
    }
    Ok((host, port))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RequestKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug)]
struct Waiting {
    seq: u64,
    at_most_once: bool,
    label: String,
    sender: CompletionSender,
}

/// Matches acknowledgements to requests.
///
/// `rumqttc` assigns packet ids only when a request leaves the client, and
/// reports that through an outgoing event. Requests are written in the
/// order they were queued, so each kind keeps a FIFO of requests waiting
/// for their packet id and a map of requests waiting for their ack.
#[derive(Debug, Default)]
struct AckTracker {
    next_seq: u64,
    queued: HashMap<RequestKind, VecDeque<Waiting>>,
    in_flight: HashMap<(RequestKind, u16), Waiting>,
    /// Packet ids of requests failed by a connection error, which the
    /// client may still retransmit after reconnecting.
    orphaned: HashSet<(RequestKind, u16)>,
}

impl AckTracker {
    fn register(&mut self, kind: RequestKind, at_most_once: bool, label: &str) -> (u64, Completion) {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (sender, completion) = Completion::pending(label);
        self.queued.entry(kind).or_default().push_back(Waiting {
            seq,
            at_most_once,
            label: label.to_string(),
            sender,
        });
        (seq, completion)
    }

    /// Drops a request the client refused to queue.
    fn cancel(&mut self, kind: RequestKind, seq: u64) {
        if let Some(queue) = self.queued.get_mut(&kind) {
            queue.retain(|w| w.seq != seq);
        }
    }

    fn sent(&mut self, kind: RequestKind, pkid: u16) {
        if self.orphaned.remove(&(kind, pkid)) {
            tracing::debug!(?kind, pkid, "Ignoring retransmission of failed request");
            return;
        }
        let Some(waiting) = self.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };
        if waiting.at_most_once || pkid == 0 {
            waiting.sender.complete(Ok(()));
        } else {
            self.in_flight.insert((kind, pkid), waiting);
        }
    }

    fn acknowledge(&mut self, kind: RequestKind, pkid: u16, result: Result<(), TransportError>) {
        if let Some(waiting) = self.in_flight.remove(&(kind, pkid)) {
            waiting.sender.complete(result);
        }
    }

    fn acknowledge_subscription(&mut self, pkid: u16, rejected: bool) {
        let Some(waiting) = self.in_flight.remove(&(RequestKind::Subscribe, pkid)) else {
            return;
        };
        let result = if rejected {
            Err(TransportError::SubscriptionRejected(waiting.label.clone()))
        } else {
            Ok(())
        };
        waiting.sender.complete(result);
    }

    /// Fails every request that was written but not acknowledged.
    fn fail_in_flight(&mut self, error: &TransportError) {
        for (key, waiting) in self.in_flight.drain() {
            self.orphaned.insert(key);
            waiting.sender.complete(Err(error.clone()));
        }
    }

    /// Fails every outstanding request.
    fn fail_all(&mut self, error: &TransportError) {
        self.fail_in_flight(error);
        self.orphaned.clear();
        for (_, queue) in self.queued.drain() {
            for waiting in queue {
                waiting.sender.complete(Err(error.clone()));
            }
        }
    }
}
