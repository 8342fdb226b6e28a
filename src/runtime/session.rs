// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport session owned by the run loop.

use std::collections::VecDeque;

use crate::error::TransportError;
use crate::protocol::{Completion, Publication, QoS, Transport};

/// Maximum number of unresolved completions kept before the oldest one is
/// awaited.
pub(crate) const COMPLETION_QUEUE_CAPACITY: usize = 256;

/// A transport plus the completions of everything sent through it.
pub(crate) struct Session<T> {
    transport: T,
    pending: VecDeque<Completion>,
    // First failure since the last flush
    failure: Option<TransportError>,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(transport: T) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
            failure: None,
        }
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    pub(crate) async fn publish(&mut self, publication: Publication) {
        let topic = publication.topic.clone();
        match self.transport.publish(publication).await {
            Ok(completion) => self.track(completion).await,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "Publish failed");
                self.fail(e);
            }
        }
    }

    pub(crate) async fn subscribe(&mut self, filter: &str) {
        match self.transport.subscribe(filter, QoS::AtLeastOnce).await {
            Ok(completion) => self.track(completion).await,
            Err(e) => {
                tracing::warn!(filter = %filter, error = %e, "Subscribe failed");
                self.fail(e);
            }
        }
    }

    /// Logs and forgets every completion that has resolved, without waiting.
    pub(crate) fn drain_ready(&mut self) {
        let mut failure = None;
        self.pending.retain_mut(|completion| match completion.try_result() {
            None => true,
            Some(result) => {
                log_outcome(completion.label(), &result);
                if let Err(e) = result {
                    failure.get_or_insert(e);
                }
                false
            }
        });
        if let Some(e) = failure {
            self.fail(e);
        }
    }

    /// Waits for every outstanding completion.
    ///
    /// Each completion carries the transport's acknowledgement timeout, so
    /// this never blocks longer than that per request.
    ///
    /// # Errors
    ///
    /// Returns the first failure seen since the previous flush, including
    /// requests the transport refused outright. Every completion is awaited
    /// and logged either way.
    pub(crate) async fn flush(&mut self) -> Result<(), TransportError> {
        while let Some(completion) = self.pending.pop_front() {
            self.settle(completion).await;
        }
        self.failure.take().map_or(Ok(()), Err)
    }

    async fn track(&mut self, completion: Completion) {
        if self.pending.len() >= COMPLETION_QUEUE_CAPACITY {
            self.drain_ready();
        }
        if self.pending.len() >= COMPLETION_QUEUE_CAPACITY
            && let Some(oldest) = self.pending.pop_front()
        {
            self.settle(oldest).await;
        }
        self.pending.push_back(completion);
    }

    async fn settle(&mut self, completion: Completion) {
        let label = completion.label().to_string();
        let result = completion.wait().await;
        log_outcome(&label, &result);
        if let Err(e) = result {
            self.fail(e);
        }
    }

    fn fail(&mut self, error: TransportError) {
        self.failure.get_or_insert(error);
    }
}

fn log_outcome(label: &str, result: &Result<(), TransportError>) {
    if let Err(e) = result {
        tracing::warn!(topic = %label, error = %e, "Request not acknowledged");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MemoryBroker, SessionOptions, TransportEvents};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn connected_session(broker: &MemoryBroker) -> Session<crate::protocol::MemoryTransport> {
        let transport = broker.transport();
        let (tx, _rx) = mpsc::channel(16);
        let events = TransportEvents::new(tx, Arc::new(|_: &str, _: &[u8]| {}));
        transport
            .connect(
                SessionOptions {
                    client_id: "test".to_string(),
                    last_will: Publication::retained("homie/test/$state", "lost"),
                },
                events,
            )
            .await
            .unwrap();
        Session::new(transport)
    }

    #[tokio::test]
    async fn publish_tracks_and_flushes() {
        let broker = MemoryBroker::new();
        let mut session = connected_session(&broker).await;

        session.publish(Publication::retained("homie/test/$name", "Test")).await;
        session.subscribe("homie/test/node/prop/set").await;
        assert_eq!(session.pending(), 2);

        session.flush().await.unwrap();
        assert_eq!(session.pending(), 0);
        assert_eq!(broker.retained("homie/test/$name").as_deref(), Some("Test"));
    }

    #[tokio::test]
    async fn drain_ready_drops_resolved() {
        let broker = MemoryBroker::new();
        let mut session = connected_session(&broker).await;

        session.publish(Publication::retained("a/b", "c")).await;
        session.drain_ready();
        assert_eq!(session.pending(), 0);
    }

    #[tokio::test]
    async fn completion_queue_is_bounded() {
        let broker = MemoryBroker::new();
        let mut session = connected_session(&broker).await;

        for i in 0..(COMPLETION_QUEUE_CAPACITY + 10) {
            session
                .publish(Publication::retained(format!("a/{i}"), "x"))
                .await;
        }
        assert!(session.pending() <= COMPLETION_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn flush_reports_first_failure() {
        let broker = MemoryBroker::new();
        let mut session = connected_session(&broker).await;

        session.publish(Publication::retained("a/b", "c")).await;
        session
            .track(Completion::done(
                "a/d",
                Err(TransportError::ConnectionFailed("refused".to_string())),
            ))
            .await;
        session
            .track(Completion::done("a/e", Err(TransportError::NotConnected)))
            .await;

        assert_eq!(
            session.flush().await,
            Err(TransportError::ConnectionFailed("refused".to_string()))
        );
        assert_eq!(session.pending(), 0);
        // The failure is reported once
        assert_eq!(session.flush().await, Ok(()));
    }

    #[tokio::test]
    async fn unacknowledged_subscribe_fails_flush() {
        let broker = MemoryBroker::new();
        let mut session = Session::new(broker.transport());

        // Never connected, so every request fails
        session.subscribe("homie/test/node/prop/set").await;
        assert_eq!(session.pending(), 1);
        assert_eq!(session.flush().await, Err(TransportError::NotConnected));
    }
}
