// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Broker transport abstraction and the Homie topic grammar.
//!
//! The run loop never talks to a broker client directly. It drives a
//! [`Transport`], which hands back a [`Completion`] for every request and
//! reports connection changes and inbound messages through
//! [`TransportEvents`]. Transport callbacks only ever enqueue work for the
//! run loop; they never touch device state.
//!
//! # Transports
//!
//! - [`MqttTransport`]: MQTT over TCP using `rumqttc` (feature `mqtt`)
//! - [`MemoryBroker`]: in-process broker with a retained store, used for
//!   tests and simulations
//!
//! # Topic Tree
//!
//! [`Topics`] builds and parses the topic grammar, and [`encoder`] turns a
//! device tree into the ordered list of retained publications announced on
//! every (re)connect.

pub mod encoder;
mod memory;
#[cfg(feature = "mqtt")]
mod mqtt;
mod topics;

pub use memory::{MemoryBroker, MemoryTransport, PEER_CLIENT_ID, Record};
#[cfg(feature = "mqtt")]
pub use mqtt::{DEFAULT_BROKER_URL, MqttTransport, MqttTransportBuilder};
pub use topics::{Inbound, Topics, topic_matches};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::TransportError;

/// Quality of service for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery; the convention's level for device topics.
    #[default]
    AtLeastOnce,
    /// Assured single delivery.
    ExactlyOnce,
}

/// A single message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Full topic.
    pub topic: String,
    /// UTF-8 payload.
    pub payload: String,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Whether the broker keeps the message for future subscribers.
    pub retained: bool,
}

impl Publication {
    /// Creates a retained, at-least-once publication.
    #[must_use]
    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retained: true,
        }
    }
}

/// Parameters fixed for the lifetime of a transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Message the broker publishes if the session ends abnormally.
    pub last_will: Publication,
}

/// Callback receiving every inbound message as `(topic, payload)`.
pub type InboundHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Notification sink handed to a transport on connect.
///
/// Connection changes are forwarded onto the run loop's connect-signal
/// queue. Inbound messages are handed to the device's router, which runs
/// the command dispatch chain on the calling task.
#[derive(Clone)]
pub struct TransportEvents {
    connect_tx: mpsc::Sender<bool>,
    inbound: InboundHandler,
}

impl TransportEvents {
    /// Creates an event sink feeding `connect_tx` and `inbound`.
    #[must_use]
    pub fn new(connect_tx: mpsc::Sender<bool>, inbound: InboundHandler) -> Self {
        Self {
            connect_tx,
            inbound,
        }
    }

    /// Signals that a session with the broker was established.
    pub async fn connected(&self) {
        if self.connect_tx.send(true).await.is_err() {
            tracing::debug!("Run loop gone, dropping connect signal");
        }
    }

    /// Signals that the session with the broker was lost.
    pub async fn connection_lost(&self) {
        if self.connect_tx.send(false).await.is_err() {
            tracing::debug!("Run loop gone, dropping connection-lost signal");
        }
    }

    /// Delivers an inbound message.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        (self.inbound)(topic, payload);
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("run_loop_alive", &!self.connect_tx.is_closed())
            .finish_non_exhaustive()
    }
}

/// Resolves a pending [`Completion`].
#[derive(Debug)]
pub struct CompletionSender {
    tx: oneshot::Sender<Result<(), TransportError>>,
}

impl CompletionSender {
    /// Reports the outcome of the request.
    pub fn complete(self, result: Result<(), TransportError>) {
        // The run loop may have stopped tracking this request.
        let _ = self.tx.send(result);
    }
}

/// Handle to the outcome of a transport request.
///
/// A completion resolves once the broker acknowledges the request, the
/// transport gives up on it, or its acknowledgement timeout expires.
#[derive(Debug)]
pub struct Completion {
    label: String,
    rx: oneshot::Receiver<Result<(), TransportError>>,
    timeout: Option<(Instant, Duration)>,
}

impl Completion {
    /// Creates an unresolved completion and the sender that resolves it.
    #[must_use]
    pub fn pending(label: impl Into<String>) -> (CompletionSender, Self) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            label: label.into(),
            rx,
            timeout: None,
        };
        (CompletionSender { tx }, completion)
    }

    /// Creates an already resolved completion.
    #[must_use]
    pub fn done(label: impl Into<String>, result: Result<(), TransportError>) -> Self {
        let (sender, completion) = Self::pending(label);
        sender.complete(result);
        completion
    }

    /// Fails the completion with [`TransportError::Timeout`] if it is not
    /// resolved within `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some((Instant::now() + timeout, timeout));
        self
    }

    /// Returns a description of the request, typically its topic.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the outcome without blocking, or `None` while unresolved.
    pub fn try_result(&mut self) -> Option<Result<(), TransportError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(TransportError::ChannelClosed(self.label.clone())))
            }
            Err(oneshot::error::TryRecvError::Empty) => match self.timeout {
                Some((deadline, timeout)) if Instant::now() >= deadline => {
                    Some(Err(timeout_error(timeout)))
                }
                _ => None,
            },
        }
    }

    /// Waits for the outcome.
    ///
    /// # Errors
    ///
    /// Returns the transport's failure, [`TransportError::Timeout`] when the
    /// acknowledgement timeout expires, or [`TransportError::ChannelClosed`]
    /// when the transport dropped the request.
    pub async fn wait(self) -> Result<(), TransportError> {
        let Self { label, rx, timeout } = self;
        let received = match timeout {
            Some((deadline, timeout)) => match tokio::time::timeout_at(deadline, rx).await {
                Ok(received) => received,
                Err(_) => return Err(timeout_error(timeout)),
            },
            None => rx.await,
        };
        received.unwrap_or(Err(TransportError::ChannelClosed(label)))
    }
}

fn timeout_error(timeout: Duration) -> TransportError {
    // Acknowledgement timeouts are seconds, never anywhere near u64::MAX ms
    #[allow(clippy::cast_possible_truncation)]
    TransportError::Timeout(timeout.as_millis() as u64)
}

/// A publish/subscribe session with a broker.
///
/// Implementations own reconnection: after [`connect`](Transport::connect)
/// returns they keep the session alive, call
/// [`TransportEvents::connected`] on every successful (re)connect and
/// [`TransportEvents::connection_lost`] whenever an established session
/// drops. The last will in [`SessionOptions`] must be registered with every
/// connect and discarded by [`disconnect`](Transport::disconnect).
pub trait Transport: Send + Sync + 'static {
    /// Starts the session. Returns once connection attempts are under way.
    fn connect(
        &self,
        options: SessionOptions,
        events: TransportEvents,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Publishes a message.
    fn publish(
        &self,
        publication: Publication,
    ) -> impl Future<Output = Result<Completion, TransportError>> + Send;

    /// Subscribes to a topic filter. Matching messages arrive through
    /// [`TransportEvents::deliver`].
    fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<Completion, TransportError>> + Send;

    /// Removes a subscription.
    fn unsubscribe(
        &self,
        filter: &str,
    ) -> impl Future<Output = Result<Completion, TransportError>> + Send;

    /// Ends the session in an orderly way, waiting at most `grace` for
    /// outstanding traffic to drain.
    fn disconnect(&self, grace: Duration)
    -> impl Future<Output = Result<(), TransportError>> + Send;
}
