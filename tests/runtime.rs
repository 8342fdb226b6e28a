// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end tests of the device run loop against the in-memory broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use homie_runtime::model::{CommandOutcome, DeviceRegistry, HOMIE_VERSION, IMPLEMENTATION};
use homie_runtime::protocol::{MemoryBroker, Publication};
use homie_runtime::types::{Datatype, DeviceState};
use homie_runtime::{CLIENT_ID_PREFIX, ConfigError, Device};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    device: Device,
    cancel: CancellationToken,
    handle: JoinHandle<homie_runtime::Result<()>>,
}

impl Running {
    async fn stop(self) -> Device {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("run loop should stop")
            .unwrap()
            .unwrap();
        self.device
    }
}

async fn start(broker: &MemoryBroker, device: &Device) -> Running {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let device = device.clone();
        let transport = broker.transport();
        let cancel = cancel.clone();
        async move { device.run(transport, cancel).await }
    });
    wait_for_state(device, DeviceState::Ready).await;
    Running {
        device: device.clone(),
        cancel,
        handle,
    }
}

async fn wait_for_state(device: &Device, state: DeviceState) {
    let mut rx = device.watch_state();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("device never reached {state:?}"))
        .unwrap();
}

async fn wait_retained(broker: &MemoryBroker, topic: &str, value: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.retained(topic).as_deref() != Some(value) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{topic} never became {value:?}"));
}

/// Publications made by the device's own client, in order.
fn published_by(broker: &MemoryBroker, device_id: &str) -> Vec<Publication> {
    let client_id = format!("{CLIENT_ID_PREFIX}{device_id}");
    broker
        .log()
        .into_iter()
        .filter(|record| record.client_id == client_id)
        .map(|record| record.publication)
        .collect()
}

fn topics(publications: &[Publication]) -> Vec<&str> {
    publications.iter().map(|p| p.topic.as_str()).collect()
}

// ============================================================================
// Announcement
// ============================================================================

mod announcement {
    use super::*;

    #[tokio::test]
    async fn zero_node_device_sequence() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();

        let running = start(&broker, &device).await;
        let published = published_by(&broker, "dev");

        assert_eq!(
            topics(&published),
            vec![
                "homie/dev/$state",
                "homie/dev/$homie",
                "homie/dev/$name",
                "homie/dev/$extensions",
                "homie/dev/$implementation",
                "homie/dev/$stats/interval",
                "homie/dev/$stats/uptime",
                "homie/dev/$fw/name",
                "homie/dev/$fw/version",
                "homie/dev/$nodes",
                "homie/dev/$state",
            ]
        );
        assert_eq!(published[0].payload, "init");
        assert_eq!(published[1].payload, HOMIE_VERSION);
        assert_eq!(published[2].payload, "Dev");
        assert_eq!(published[4].payload, IMPLEMENTATION);
        assert_eq!(published[9].payload, "");
        assert_eq!(published[10].payload, "ready");
        assert!(published.iter().all(|p| p.retained));

        running.stop().await;
    }

    #[tokio::test]
    async fn end_to_end_outlet_value_and_ready() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry
            .create_device("test-device-0001", "Test Device")
            .unwrap();
        let outlet = device.new_node("outlet", "Outlet", "relay").unwrap();
        let on = outlet.advertise("on", "On", Datatype::String).unwrap();
        on.message().try_send("off").unwrap();

        let running = start(&broker, &device).await;
        assert_eq!(
            broker.retained("homie/test-device-0001/$state").as_deref(),
            Some("ready")
        );
        assert_eq!(
            broker.retained("homie/test-device-0001/outlet/on").as_deref(),
            Some("off")
        );

        on.message().send("on").await.unwrap();
        wait_retained(&broker, "homie/test-device-0001/outlet/on", "on").await;
        assert_eq!(on.value(), "on");

        running.stop().await;
    }

    #[tokio::test]
    async fn registration_is_frozen_after_run() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("sensor", "Sensor", "climate").unwrap();
        let temperature = node
            .advertise("temperature", "Temperature", Datatype::Float)
            .unwrap();

        let running = start(&broker, &device).await;

        let frozen = |err: ConfigError| matches!(err, ConfigError::ConfigFrozen(_));
        assert!(frozen(device.new_node("extra", "Extra", "misc").unwrap_err()));
        assert!(frozen(
            node.advertise("humidity", "Humidity", Datatype::Float)
                .unwrap_err()
        ));
        assert!(frozen(temperature.set_unit("°C").unwrap_err()));
        assert!(frozen(temperature.set_format("0:100").unwrap_err()));
        assert!(frozen(device.set_topic_base("other").unwrap_err()));

        // Values still flow
        temperature.message().send("21.5").await.unwrap();
        wait_retained(&broker, "homie/dev/sensor/temperature", "21.5").await;

        running.stop().await;
    }
}

// ============================================================================
// Connection Loss
// ============================================================================

mod connection_loss {
    use super::*;

    #[tokio::test]
    async fn reconnect_republishes_tree_with_last_values() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("sensor", "Sensor", "climate").unwrap();
        let temperature = node
            .advertise("temperature", "Temperature", Datatype::Float)
            .unwrap();
        temperature.set_unit("°C").unwrap();
        temperature.message().try_send("21.5").unwrap();

        let running = start(&broker, &device).await;
        let first = published_by(&broker, "dev");

        broker.drop_connections().await;
        wait_for_state(&device, DeviceState::Init).await;
        assert!(!device.is_connected());
        assert_eq!(broker.retained("homie/dev/$state").as_deref(), Some("lost"));

        broker.clear_log();
        broker.restore_connections().await;
        wait_for_state(&device, DeviceState::Ready).await;
        let second = published_by(&broker, "dev");

        assert_eq!(topics(&first), topics(&second));
        for (before, after) in first.iter().zip(&second) {
            if before.topic != "homie/dev/$stats/uptime" {
                assert_eq!(before, after);
            }
        }
        assert_eq!(
            broker.retained("homie/dev/sensor/temperature").as_deref(),
            Some("21.5")
        );

        running.stop().await;
    }

    #[tokio::test]
    async fn value_queued_offline_goes_out_on_reconnect() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("sensor", "Sensor", "climate").unwrap();
        let temperature = node
            .advertise("temperature", "Temperature", Datatype::Float)
            .unwrap();
        temperature.message().try_send("21.5").unwrap();

        let running = start(&broker, &device).await;

        broker.drop_connections().await;
        wait_for_state(&device, DeviceState::Init).await;

        temperature.message().send("23").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while temperature.value() != "23" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            broker.retained("homie/dev/sensor/temperature").as_deref(),
            Some("21.5")
        );

        broker.restore_connections().await;
        wait_for_state(&device, DeviceState::Ready).await;
        assert_eq!(
            broker.retained("homie/dev/sensor/temperature").as_deref(),
            Some("23")
        );

        running.stop().await;
    }

    #[tokio::test]
    async fn graceful_shutdown_publishes_disconnected_without_will() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();

        let running = start(&broker, &device).await;
        let device = running.stop().await;

        assert_eq!(device.state(), DeviceState::Disconnected);
        assert_eq!(
            broker.retained("homie/dev/$state").as_deref(),
            Some("disconnected")
        );
        assert_eq!(broker.session_count(), 0);
        assert!(
            !published_by(&broker, "dev")
                .iter()
                .any(|p| p.payload == "lost")
        );

        // The session is gone, so a later drop publishes nothing
        broker.drop_connections().await;
        assert_eq!(
            broker.retained("homie/dev/$state").as_deref(),
            Some("disconnected")
        );
    }
}

// ============================================================================
// Commands
// ============================================================================

mod commands {
    use super::*;

    fn counter(
        calls: &Arc<AtomicUsize>,
        outcome: CommandOutcome,
    ) -> impl Fn(&homie_runtime::Command<'_>) -> CommandOutcome + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome.clone()
        }
    }

    #[tokio::test]
    async fn set_update_is_published() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("outlet", "Outlet", "relay").unwrap();
        let on = node.advertise("on", "On", Datatype::Boolean).unwrap();
        on.settable(|cmd| match cmd.payload {
            "true" | "false" => CommandOutcome::Update(cmd.payload.to_string()),
            _ => CommandOutcome::Handled,
        })
        .unwrap();
        on.message().try_send("false").unwrap();

        let running = start(&broker, &device).await;
        assert!(broker.is_subscribed("homie/dev/outlet/on/set"));
        assert_eq!(
            broker.retained("homie/dev/outlet/on/$settable").as_deref(),
            Some("true")
        );

        broker.publish_from_peer("homie/dev/outlet/on/set", "maybe", false);
        broker.publish_from_peer("homie/dev/outlet/on/set", "true", false);
        wait_retained(&broker, "homie/dev/outlet/on", "true").await;
        assert_eq!(on.value(), "true");

        running.stop().await;
    }

    #[tokio::test]
    async fn device_handler_short_circuits_chain() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("outlet", "Outlet", "relay").unwrap();
        let on = node.advertise("on", "On", Datatype::Boolean).unwrap();

        let device_calls = Arc::new(AtomicUsize::new(0));
        let node_calls = Arc::new(AtomicUsize::new(0));
        let property_calls = Arc::new(AtomicUsize::new(0));
        device
            .set_global_handler(counter(&device_calls, CommandOutcome::Handled))
            .unwrap();
        node.on_command(counter(&node_calls, CommandOutcome::Handled))
            .unwrap();
        on.settable(counter(&property_calls, CommandOutcome::Handled))
            .unwrap();

        let running = start(&broker, &device).await;
        broker.publish_from_peer("homie/dev/outlet/on/set", "true", false);

        assert_eq!(device_calls.load(Ordering::SeqCst), 1);
        assert_eq!(node_calls.load(Ordering::SeqCst), 0);
        assert_eq!(property_calls.load(Ordering::SeqCst), 0);

        running.stop().await;
    }

    #[tokio::test]
    async fn broadcast_reaches_handler_once() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        device.set_topic_base("testing").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        device
            .set_broadcast_handler(move |level, value| {
                sink.lock().push((level.to_string(), value.to_string()));
            })
            .unwrap();

        let running = start(&broker, &device).await;
        assert!(broker.is_subscribed("testing/$broadcast/#"));

        broker.publish_from_peer("testing/$broadcast/alarming!", "now!", false);

        assert_eq!(
            seen.lock().clone(),
            vec![("alarming!".to_string(), "now!".to_string())]
        );

        running.stop().await;
    }

    #[tokio::test]
    async fn commands_for_unknown_targets_are_ignored() {
        let broker = MemoryBroker::new();
        let registry = DeviceRegistry::new();
        let device = registry.create_device("dev", "Dev").unwrap();
        let node = device.new_node("outlet", "Outlet", "relay").unwrap();
        let on = node.advertise("on", "On", Datatype::Boolean).unwrap();
        on.settable(|cmd| CommandOutcome::Update(cmd.payload.to_string()))
            .unwrap();
        on.message().try_send("false").unwrap();

        let running = start(&broker, &device).await;
        broker.publish_from_peer("homie/dev/outlet/missing/set", "true", false);
        broker.publish_from_peer("homie/dev/missing/on/set", "true", false);
        broker.publish_from_peer("homie/other/outlet/on/set", "true", false);

        assert_eq!(on.value(), "false");
        assert_eq!(device.state(), DeviceState::Ready);

        running.stop().await;
    }
}
