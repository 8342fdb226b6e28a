// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process broker.
//!
//! [`MemoryBroker`] keeps a retained store, a log of every publication and
//! the subscriptions of each attached [`MemoryTransport`]. Connection loss
//! can be simulated with [`MemoryBroker::drop_connections`], which publishes
//! the last will of every session exactly as a real broker would.
//!
//! # Examples
//!
//! ```
//! use homie_runtime::protocol::MemoryBroker;
//!
//! let broker = MemoryBroker::new();
//! broker.publish_from_peer("homie/dev/$state", "ready", true);
//! assert_eq!(broker.retained("homie/dev/$state").as_deref(), Some("ready"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{
    Completion, Publication, QoS, SessionOptions, Transport, TransportEvents, topic_matches,
};
use crate::error::TransportError;

/// Client id recorded for messages injected with
/// [`MemoryBroker::publish_from_peer`].
pub const PEER_CLIENT_ID: &str = "peer";

/// A publication as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Client that published the message, or the will owner.
    pub client_id: String,
    /// The message.
    pub publication: Publication,
}

#[derive(Debug)]
struct Session {
    client_id: String,
    events: TransportEvents,
    subscriptions: Vec<String>,
    will: Publication,
    connected: bool,
}

#[derive(Debug)]
struct BrokerState {
    retained: HashMap<String, String>,
    log: Vec<Record>,
    sessions: HashMap<u64, Session>,
    next_session: u64,
    online: bool,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            retained: HashMap::new(),
            log: Vec::new(),
            sessions: HashMap::new(),
            next_session: 0,
            online: true,
        }
    }
}

type Delivery = (TransportEvents, String, String);

impl BrokerState {
    /// Stores and logs a publication and returns the deliveries it causes.
    fn accept(&mut self, client_id: &str, publication: Publication) -> Vec<Delivery> {
        if publication.retained {
            if publication.payload.is_empty() {
                self.retained.remove(&publication.topic);
            } else {
                self.retained
                    .insert(publication.topic.clone(), publication.payload.clone());
            }
        }

        let deliveries = self
            .sessions
            .values()
            .filter(|s| s.connected)
            .filter(|s| {
                s.subscriptions
                    .iter()
                    .any(|f| topic_matches(f, &publication.topic))
            })
            .map(|s| {
                (
                    s.events.clone(),
                    publication.topic.clone(),
                    publication.payload.clone(),
                )
            })
            .collect();

        self.log.push(Record {
            client_id: client_id.to_string(),
            publication,
        });
        deliveries
    }
}

fn deliver_all(deliveries: Vec<Delivery>) {
    for (events, topic, payload) in deliveries {
        events.deliver(&topic, payload.as_bytes());
    }
}

/// In-process broker shared by any number of [`MemoryTransport`]s.
///
/// Cheap to clone; all clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport attached to this broker.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            session: Mutex::new(None),
        }
    }

    /// Returns the retained payload of `topic`.
    #[must_use]
    pub fn retained(&self, topic: &str) -> Option<String> {
        self.state.lock().retained.get(topic).cloned()
    }

    /// Returns every retained topic, sorted.
    #[must_use]
    pub fn retained_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.lock().retained.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Returns every publication accepted so far, in order.
    #[must_use]
    pub fn log(&self) -> Vec<Record> {
        self.state.lock().log.clone()
    }

    /// Forgets the publication log. The retained store is kept.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Returns the number of attached sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Returns whether any connected session subscribed to exactly `filter`.
    #[must_use]
    pub fn is_subscribed(&self, filter: &str) -> bool {
        self.state
            .lock()
            .sessions
            .values()
            .any(|s| s.connected && s.subscriptions.iter().any(|f| f == filter))
    }

    /// Publishes a message as an outside client, such as a controller
    /// sending a command.
    pub fn publish_from_peer(&self, topic: &str, payload: &str, retained: bool) {
        let publication = Publication {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: QoS::AtLeastOnce,
            retained,
        };
        let deliveries = self.state.lock().accept(PEER_CLIENT_ID, publication);
        deliver_all(deliveries);
    }

    /// Drops every session without an orderly disconnect.
    ///
    /// Each session's last will is published and its transport is told the
    /// connection was lost. New sessions stay offline until
    /// [`restore_connections`](Self::restore_connections).
    pub async fn drop_connections(&self) {
        let lost: Vec<TransportEvents> = {
            let mut state = self.state.lock();
            state.online = false;

            let wills: Vec<(String, Publication, TransportEvents)> = state
                .sessions
                .values_mut()
                .filter(|s| s.connected)
                .map(|s| {
                    s.connected = false;
                    (s.client_id.clone(), s.will.clone(), s.events.clone())
                })
                .collect();

            wills
                .into_iter()
                .map(|(client_id, will, events)| {
                    tracing::debug!(client = %client_id, topic = %will.topic, "Publishing last will");
                    // Nobody is connected to receive it
                    let _ = state.accept(&client_id, will);
                    events
                })
                .collect()
        };

        for events in lost {
            events.connection_lost().await;
        }
    }

    /// Reconnects every session dropped by
    /// [`drop_connections`](Self::drop_connections).
    ///
    /// Subscriptions do not survive the drop; clients resubscribe.
    pub async fn restore_connections(&self) {
        let restored: Vec<TransportEvents> = {
            let mut state = self.state.lock();
            state.online = true;
            state
                .sessions
                .values_mut()
                .filter(|s| !s.connected)
                .map(|s| {
                    s.connected = true;
                    s.subscriptions.clear();
                    s.events.clone()
                })
                .collect()
        };

        for events in restored {
            events.connected().await;
        }
    }
}

/// A [`Transport`] attached to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    session: Mutex<Option<u64>>,
}

impl MemoryTransport {
    /// Returns the broker this transport is attached to.
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut BrokerState, u64) -> Result<R, TransportError>,
    ) -> Result<R, TransportError> {
        let id = (*self.session.lock()).ok_or(TransportError::NotConnected)?;
        let mut state = self.broker.state.lock();
        let connected = state.sessions.get(&id).is_some_and(|s| s.connected);
        if !connected {
            return Err(TransportError::NotConnected);
        }
        f(&mut state, id)
    }
}

impl Transport for MemoryTransport {
    async fn connect(
        &self,
        options: SessionOptions,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        let online = {
            let mut state = self.broker.state.lock();
            let id = state.next_session;
            state.next_session += 1;
            let online = state.online;
            state.sessions.insert(
                id,
                Session {
                    client_id: options.client_id.clone(),
                    events: events.clone(),
                    subscriptions: Vec::new(),
                    will: options.last_will,
                    connected: online,
                },
            );
            *self.session.lock() = Some(id);
            online
        };

        tracing::debug!(client = %options.client_id, online, "Memory session attached");
        if online {
            events.connected().await;
        }
        Ok(())
    }

    async fn publish(&self, publication: Publication) -> Result<Completion, TransportError> {
        let label = publication.topic.clone();
        let deliveries = match self.with_session(|state, id| {
            let client_id = state
                .sessions
                .get(&id)
                .map(|s| s.client_id.clone())
                .unwrap_or_default();
            Ok(state.accept(&client_id, publication))
        }) {
            Ok(deliveries) => deliveries,
            Err(e) => return Ok(Completion::done(label, Err(e))),
        };
        deliver_all(deliveries);
        Ok(Completion::done(label, Ok(())))
    }

    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<Completion, TransportError> {
        let result = self.with_session(|state, id| {
            let retained: Vec<(String, String)> = state
                .retained
                .iter()
                .filter(|(topic, _)| topic_matches(filter, topic))
                .map(|(topic, payload)| (topic.clone(), payload.clone()))
                .collect();
            let session = state
                .sessions
                .get_mut(&id)
                .ok_or(TransportError::NotConnected)?;
            if !session.subscriptions.iter().any(|f| f == filter) {
                session.subscriptions.push(filter.to_string());
            }
            Ok(retained
                .into_iter()
                .map(|(topic, payload)| (session.events.clone(), topic, payload))
                .collect::<Vec<Delivery>>())
        });

        match result {
            Ok(deliveries) => {
                deliver_all(deliveries);
                Ok(Completion::done(filter, Ok(())))
            }
            Err(e) => Ok(Completion::done(filter, Err(e))),
        }
    }

    async fn unsubscribe(&self, filter: &str) -> Result<Completion, TransportError> {
        let result = self.with_session(|state, id| {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.subscriptions.retain(|f| f != filter);
            }
            Ok(())
        });
        Ok(Completion::done(filter, result))
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), TransportError> {
        let Some(id) = self.session.lock().take() else {
            return Ok(());
        };
        // Orderly disconnect: the will is discarded with the session
        if let Some(session) = self.broker.state.lock().sessions.remove(&id) {
            tracing::debug!(client = %session.client_id, "Memory session detached");
        }
        Ok(())
    }
}
