// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device run loop.
//!
//! A running device is driven by a single task, the run loop, which is the
//! only writer of property values and of the connection state. Everything
//! else talks to it through queues:
//!
//! - the publish queue, fed by [`PropertyMessage`](crate::model::PropertyMessage)
//!   and by command handlers returning an update
//! - the connect-signal queue, fed by the transport on connect and on loss
//! - the completions of everything the loop itself sent

mod dispatch;
mod lifecycle;
mod session;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Device, Outbound};
use crate::protocol::{Publication, SessionOptions, Topics, Transport, TransportEvents, encoder};
use crate::types::DeviceState;
use session::Session;

/// Prefix of the client id presented to the broker.
pub const CLIENT_ID_PREFIX: &str = "homie_runtime-";

const CONNECT_QUEUE_CAPACITY: usize = 16;
const MIN_PERIOD: Duration = Duration::from_millis(1);

impl Device {
    /// Runs the device until `cancel` fires.
    ///
    /// Freezes the tree, connects `transport` and then keeps the broker's
    /// view of the device current: the whole tree is announced on every
    /// (re)connect, property updates are published as they are queued and
    /// `$stats/uptime` is refreshed every stats interval.
    ///
    /// On cancellation the device publishes `disconnected` and disconnects
    /// in an orderly way, which discards its last will. Transport errors
    /// never end the loop; they are logged and repaired by the next
    /// announcement.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::AlreadyRunning`](crate::error::ConfigError::AlreadyRunning)
    ///   if the device was run before
    /// - [`Error::Transport`](crate::Error::Transport) if the transport
    ///   refuses to start a session
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use homie_runtime::model::DeviceRegistry;
    /// use homie_runtime::protocol::MqttTransport;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # async fn example() -> homie_runtime::Result<()> {
    /// let registry = DeviceRegistry::new();
    /// let device = registry.create_device("test-device-0001", "Test Device")?;
    ///
    /// let transport = MqttTransport::from_url("tcp://127.0.0.1:1883")?;
    /// let cancel = CancellationToken::new();
    /// device.run(transport, cancel).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<T: Transport>(&self, transport: T, cancel: CancellationToken) -> Result<()> {
        let mut publish_rx = self.freeze()?;
        let settings = self.settings();
        let topics = self.topics();
        let started = Instant::now();
        let mut periodic = self.take_periodic();

        let (connect_tx, mut connect_rx) = mpsc::channel(CONNECT_QUEUE_CAPACITY);
        let events = TransportEvents::new(connect_tx, dispatch::router(self));
        let mut session = Session::new(transport);

        self.set_state(DeviceState::Init);
        let options = SessionOptions {
            client_id: format!("{CLIENT_ID_PREFIX}{}", self.id()),
            last_will: encoder::state(&topics, DeviceState::Lost),
        };
        tracing::info!(device = %self.id(), client_id = %options.client_id, "Starting device");
        session.transport().connect(options, events).await?;

        let mut tick = settings.period.map(|period| {
            let mut tick = tokio::time::interval(period.max(MIN_PERIOD));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick
        });
        let stats_interval = settings.stats_interval.max(MIN_PERIOD);
        let mut stats = tokio::time::interval_at(started + stats_interval, stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // With a period the callback is paced by the tick, otherwise it runs
        // on every wake-up
        let mut callback_due = true;
        loop {
            if callback_due && let Some(callback) = periodic.as_mut() {
                callback(self);
            }
            callback_due = tick.is_none();

            session.drain_ready();
            while let Ok(outbound) = publish_rx.try_recv() {
                self.apply(outbound, &topics, &mut session).await;
            }
            while let Ok(up) = connect_rx.try_recv() {
                self.connection_changed(up, &mut session, started).await;
            }

            tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                Some(outbound) = publish_rx.recv() => {
                    self.apply(outbound, &topics, &mut session).await;
                }
                Some(up) = connect_rx.recv() => {
                    self.connection_changed(up, &mut session, started).await;
                }
                _ = stats.tick() => {
                    if self.is_connected() {
                        session.publish(encoder::uptime(&topics, started.elapsed())).await;
                    }
                }
                () = next_tick(tick.as_mut()) => callback_due = true,
            }
        }

        tracing::debug!(device = %self.id(), "Cancellation requested");
        session.drain_ready();
        while let Ok(outbound) = publish_rx.try_recv() {
            self.apply(outbound, &topics, &mut session).await;
        }
        lifecycle::shutdown(self, &mut session, settings.disconnect_grace).await;
        Ok(())
    }

    /// Stores a queued value and publishes it if the device is online.
    async fn apply<T: Transport>(
        &self,
        outbound: Outbound,
        topics: &Topics,
        session: &mut Session<T>,
    ) {
        if !self.store_value(&outbound.node, &outbound.property, &outbound.value) {
            tracing::debug!(
                node = %outbound.node,
                property = %outbound.property,
                "Dropping update for unknown property"
            );
            return;
        }
        if self.is_connected() {
            session
                .publish(Publication::retained(
                    topics.value(&outbound.node, &outbound.property),
                    outbound.value,
                ))
                .await;
        }
    }

    async fn connection_changed<T: Transport>(
        &self,
        up: bool,
        session: &mut Session<T>,
        started: Instant,
    ) {
        if up {
            lifecycle::announce(self, session, started.elapsed()).await;
        } else if self.is_connected() || self.state() != DeviceState::Init {
            lifecycle::connection_lost(self);
        }
    }
}

async fn next_tick(tick: Option<&mut Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error};
    use crate::model::DeviceRegistry;
    use crate::error::TransportError;
    use crate::protocol::{Completion, MemoryBroker, QoS};
    use crate::types::Datatype;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Connects, then fails every request it is given.
    #[derive(Default)]
    struct RejectingTransport {
        published: Arc<Mutex<Vec<Publication>>>,
    }

    impl Transport for RejectingTransport {
        async fn connect(
            &self,
            _options: SessionOptions,
            events: TransportEvents,
        ) -> std::result::Result<(), TransportError> {
            events.connected().await;
            Ok(())
        }

        async fn publish(
            &self,
            publication: Publication,
        ) -> std::result::Result<Completion, TransportError> {
            let label = publication.topic.clone();
            self.published.lock().push(publication);
            Ok(Completion::done(
                label,
                Err(TransportError::ConnectionFailed("rejected".to_string())),
            ))
        }

        async fn subscribe(
            &self,
            filter: &str,
            _qos: QoS,
        ) -> std::result::Result<Completion, TransportError> {
            Ok(Completion::done(
                filter,
                Err(TransportError::ConnectionFailed("rejected".to_string())),
            ))
        }

        async fn unsubscribe(&self, filter: &str) -> std::result::Result<Completion, TransportError> {
            Ok(Completion::done(filter, Ok(())))
        }

        async fn disconnect(&self, _grace: Duration) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    async fn wait_for_state(device: &Device, state: DeviceState) {
        let mut rx = device.watch_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_announces_and_stops() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let device = device.clone();
            let transport = broker.transport();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });

        wait_for_state(&device, DeviceState::Ready).await;
        assert!(device.is_connected());
        assert_eq!(broker.retained("homie/dev/$state").as_deref(), Some("ready"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(device.state(), DeviceState::Disconnected);
        assert_eq!(
            broker.retained("homie/dev/$state").as_deref(),
            Some("disconnected")
        );
    }

    #[tokio::test]
    async fn failed_announcement_never_reports_ready() {
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("outlet", "Outlet", "relay").unwrap();
        node.advertise("on", "On", Datatype::Boolean).unwrap();
        let transport = RejectingTransport::default();
        let published = transport.published.clone();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let device = device.clone();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(device.state(), DeviceState::Init);
        assert!(!device.is_connected());
        // Stopped at the first barrier: only `init` was attempted
        let topics: Vec<String> = published
            .lock()
            .iter()
            .map(|p| format!("{}={}", p.topic, p.payload))
            .collect();
        assert_eq!(topics, vec!["homie/dev/$state=init".to_string()]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[tokio::test]
    async fn property_updates_publish_retained_at_least_once() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("outlet", "Outlet", "relay").unwrap();
        let on = node.advertise("on", "On", Datatype::Boolean).unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let device = device.clone();
            let transport = broker.transport();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });
        wait_for_state(&device, DeviceState::Ready).await;
        broker.clear_log();

        on.message().send("true").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.retained("homie/dev/outlet/on").as_deref() != Some("true") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let update = broker
            .log()
            .into_iter()
            .find(|r| r.publication.topic == "homie/dev/outlet/on")
            .unwrap();
        assert_eq!(update.publication.qos, QoS::AtLeastOnce);
        assert!(update.publication.retained);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn second_run_is_rejected() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let device = device.clone();
            let transport = broker.transport();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });
        wait_for_state(&device, DeviceState::Ready).await;

        let err = device
            .run(broker.transport(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::AlreadyRunning(id)) if id == "dev"
        ));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_callback_ignores_other_wake_ups() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("counter", "Counter", "counter").unwrap();
        let value = node.advertise("value", "Value", Datatype::Integer).unwrap();

        let runs = Arc::new(AtomicU32::new(0));
        device.set_period(Duration::from_secs(3600)).unwrap();
        device
            .set_loop({
                let runs = runs.clone();
                move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let device = device.clone();
            let transport = broker.transport();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });
        wait_for_state(&device, DeviceState::Ready).await;

        for i in 0..20 {
            value.message().send(i.to_string()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while value.value() != "19" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Once on entry and once for the interval's immediate first tick
        assert!(runs.load(Ordering::SeqCst) <= 2);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_callback_runs_with_period() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("counter", "Counter", "counter").unwrap();
        let ticks = node.advertise("ticks", "Ticks", Datatype::Integer).unwrap();

        let mut count = 0_u32;
        let property = ticks.clone();
        device.set_period(Duration::from_millis(10)).unwrap();
        device
            .set_loop(move |_| {
                count += 1;
                let _ = property.message().try_send(count.to_string());
            })
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let device = device.clone();
            let transport = broker.transport();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while ticks.value().parse::<u32>().unwrap_or(0) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
