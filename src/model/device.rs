// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device handle and its settings.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

use super::command::{BroadcastHandler, Command, CommandHandler, CommandOutcome};
use super::node::Node;
use super::property::Outbound;
use super::{DeviceTree, NodeSpec};
use crate::error::ConfigError;
use crate::protocol::Topics;
use crate::types::DeviceState;
use crate::validate::validate;

/// Convention version published on `$homie`.
pub const HOMIE_VERSION: &str = "4.0.0";

/// Value published on `$implementation`.
pub const IMPLEMENTATION: &str = concat!("homie_runtime ", env!("CARGO_PKG_VERSION"));

/// Root of the topic tree unless changed with [`Device::set_topic_base`].
pub const DEFAULT_TOPIC_BASE: &str = "homie";

const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_FIRMWARE: &str = "unknown";
const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_millis(250);
const PUBLISH_QUEUE_CAPACITY: usize = 128;

/// Callback run by the run loop, see [`Device::set_loop`].
pub(crate) type PeriodicCallback = Box<dyn FnMut(&Device) + Send>;

/// Device-wide settings, fixed once the device runs.
#[derive(Clone)]
pub(crate) struct DeviceSettings {
    pub topic_base: String,
    pub period: Option<Duration>,
    pub stats_interval: Duration,
    pub firmware_name: String,
    pub firmware_version: String,
    pub disconnect_grace: Duration,
    pub global_handler: Option<CommandHandler>,
    pub broadcast_handler: Option<BroadcastHandler>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            topic_base: DEFAULT_TOPIC_BASE.to_string(),
            period: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
            firmware_name: DEFAULT_FIRMWARE.to_string(),
            firmware_version: DEFAULT_FIRMWARE.to_string(),
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            global_handler: None,
            broadcast_handler: None,
        }
    }
}

impl fmt::Debug for DeviceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSettings")
            .field("topic_base", &self.topic_base)
            .field("period", &self.period)
            .field("stats_interval", &self.stats_interval)
            .field("firmware_name", &self.firmware_name)
            .field("firmware_version", &self.firmware_version)
            .field("disconnect_grace", &self.disconnect_grace)
            .field("global_handler", &self.global_handler.is_some())
            .field("broadcast_handler", &self.broadcast_handler.is_some())
            .finish()
    }
}

pub(crate) struct DeviceInner {
    id: String,
    name: String,
    config_done: AtomicBool,
    connected: AtomicBool,
    state_tx: watch::Sender<DeviceState>,
    tree: RwLock<DeviceTree>,
    settings: RwLock<DeviceSettings>,
    periodic: Mutex<Option<PeriodicCallback>>,
    publish_tx: mpsc::Sender<Outbound>,
    publish_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
}

/// A Homie device.
///
/// Cheap to clone; all clones share the same tree and run state. Devices
/// are created through a [`DeviceRegistry`](super::DeviceRegistry), set up
/// with nodes and properties, and then driven by [`Device::run`].
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

/// Non-owning reference to a [`Device`].
#[derive(Clone)]
pub struct WeakDevice {
    inner: Weak<DeviceInner>,
}

impl WeakDevice {
    /// Returns the device if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Device> {
        self.inner.upgrade().map(|inner| Device { inner })
    }
}

impl fmt::Debug for WeakDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakDevice")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Device {
    /// Creates a device with an already validated id.
    pub(crate) fn new(id: String, name: String) -> Self {
        let (state_tx, _) = watch::channel(DeviceState::Init);
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);

        Self {
            inner: Arc::new(DeviceInner {
                id,
                name,
                config_done: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                state_tx,
                tree: RwLock::new(DeviceTree::default()),
                settings: RwLock::new(DeviceSettings::default()),
                periodic: Mutex::new(None),
                publish_tx,
                publish_rx: Mutex::new(Some(publish_rx)),
            }),
        }
    }

    /// Returns the device id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Returns the human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DeviceState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribes to lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<DeviceState> {
        self.inner.state_tx.subscribe()
    }

    /// Returns whether the transport session is established and announced.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Returns whether the tree is frozen because the device runs.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.inner.config_done.load(Ordering::Acquire)
    }

    /// Returns the topic set for the configured topic base.
    #[must_use]
    pub fn topics(&self) -> Topics {
        Topics::new(self.inner.settings.read().topic_base.clone(), self.id())
    }

    /// Returns a non-owning reference to this device.
    #[must_use]
    pub fn downgrade(&self) -> WeakDevice {
        WeakDevice {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::InvalidIdentifier`] if `id` is not a valid identifier
    /// - [`ConfigError::ConfigFrozen`] once the device runs
    /// - [`ConfigError::DuplicateNode`] if the node exists
    pub fn new_node(
        &self,
        id: &str,
        name: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Result<Node, ConfigError> {
        let id = validate(id, false)?;
        let mut tree = self.inner.tree.write();
        self.ensure_configurable(&id)?;

        if tree.nodes.contains_key(&id) {
            return Err(ConfigError::DuplicateNode {
                device: self.id().to_string(),
                node: id,
            });
        }

        tree.nodes.insert(
            id.clone(),
            NodeSpec {
                name: name.into(),
                node_type: node_type.into(),
                handler: None,
                properties: std::collections::BTreeMap::new(),
            },
        );
        tracing::debug!(device = %self.id(), node = %id, "Node added");

        Ok(Node::new(self.clone(), id))
    }

    /// Returns a handle to an existing node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<Node> {
        let id = validate(id, false).ok()?;
        self.inner
            .tree
            .read()
            .nodes
            .contains_key(&id)
            .then(|| Node::new(self.clone(), id))
    }

    /// Returns the ids of all nodes, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        self.inner.tree.read().nodes.keys().cloned().collect()
    }

    /// Sets the root of the topic tree (default `homie`).
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidIdentifier`] for an empty base or one with
    /// wildcards, [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_topic_base(&self, base: &str) -> Result<(), ConfigError> {
        let base = base.trim_end_matches('/');
        if base.is_empty() || base.contains(['+', '#']) {
            return Err(ConfigError::InvalidIdentifier {
                id: base.to_string(),
                reason: "topic base must be non-empty and free of wildcards",
            });
        }
        self.update_settings("topic base", |s| s.topic_base = base.to_string())
    }

    /// Makes the run loop wake up at least every `period`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_period(&self, period: Duration) -> Result<(), ConfigError> {
        self.update_settings("period", |s| s.period = Some(period))
    }

    /// Registers a callback run by the run loop.
    ///
    /// With a [`set_period`](Self::set_period) the callback runs once per
    /// period and is skipped when anything else wakes the loop (queued
    /// updates, connect signals, the stats timer). Without a period it runs
    /// on every wake-up. A callback that queues property updates needs a
    /// period, or it keeps waking the loop itself.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_loop<F>(&self, callback: F) -> Result<(), ConfigError>
    where
        F: FnMut(&Device) + Send + 'static,
    {
        let mut periodic = self.inner.periodic.lock();
        self.ensure_configurable("loop")?;
        *periodic = Some(Box::new(callback));
        Ok(())
    }

    /// Registers the device-level command handler, consulted before any
    /// node or property handler.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_global_handler<F>(&self, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&Command<'_>) -> CommandOutcome + Send + Sync + 'static,
    {
        let handler: CommandHandler = Arc::new(handler);
        self.update_settings("global handler", |s| s.global_handler = Some(handler))
    }

    /// Registers the handler for `<base>/$broadcast/<level>` messages.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_broadcast_handler<F>(&self, handler: F) -> Result<(), ConfigError>
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let handler: BroadcastHandler = Arc::new(handler);
        self.update_settings("broadcast handler", |s| {
            s.broadcast_handler = Some(handler);
        })
    }

    /// Sets how often `$stats/uptime` is refreshed and the value announced
    /// on `$stats/interval` (default 60 s).
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_stats_interval(&self, interval: Duration) -> Result<(), ConfigError> {
        self.update_settings("stats interval", |s| s.stats_interval = interval)
    }

    /// Sets the values announced on `$fw/name` and `$fw/version`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_firmware(
        &self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let (name, version) = (name.into(), version.into());
        self.update_settings("firmware", |s| {
            s.firmware_name = name;
            s.firmware_version = version;
        })
    }

    /// Sets how long shutdown waits for the transport to drain.
    ///
    /// # Errors
    ///
    /// [`ConfigError::ConfigFrozen`] once the device runs.
    pub fn set_disconnect_grace(&self, grace: Duration) -> Result<(), ConfigError> {
        self.update_settings("disconnect grace", |s| s.disconnect_grace = grace)
    }

    fn update_settings(
        &self,
        what: &str,
        apply: impl FnOnce(&mut DeviceSettings),
    ) -> Result<(), ConfigError> {
        let mut settings = self.inner.settings.write();
        self.ensure_configurable(what)?;
        apply(&mut settings);
        Ok(())
    }

    // Crate-internal access for handles and the run loop

    pub(crate) fn ensure_configurable(&self, what: &str) -> Result<(), ConfigError> {
        if self.is_frozen() {
            return Err(ConfigError::ConfigFrozen(format!("{}: {what}", self.id())));
        }
        Ok(())
    }

    pub(crate) fn tree(&self) -> &RwLock<DeviceTree> {
        &self.inner.tree
    }

    pub(crate) fn settings(&self) -> DeviceSettings {
        self.inner.settings.read().clone()
    }

    pub(crate) fn publish_sender(&self) -> &mpsc::Sender<Outbound> {
        &self.inner.publish_tx
    }

    /// Freezes the tree and hands out the publish queue receiver.
    ///
    /// Only the first call succeeds; the device can run once.
    pub(crate) fn freeze(&self) -> Result<mpsc::Receiver<Outbound>, ConfigError> {
        let _tree = self.inner.tree.write();
        let _settings = self.inner.settings.write();
        let receiver = self
            .inner
            .publish_rx
            .lock()
            .take()
            .ok_or_else(|| ConfigError::AlreadyRunning(self.id().to_string()))?;
        self.inner.config_done.store(true, Ordering::Release);
        Ok(receiver)
    }

    pub(crate) fn take_periodic(&self) -> Option<PeriodicCallback> {
        self.inner.periodic.lock().take()
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        let previous = self.inner.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(device = %self.id(), from = %previous, to = %state, "State changed");
        }
    }

    /// Stores a property value. Returns `false` for unknown properties.
    pub(crate) fn store_value(&self, node: &str, property: &str, value: &str) -> bool {
        match self.inner.tree.write().property_mut(node, property) {
            Some(spec) => {
                value.clone_into(&mut spec.value);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("connected", &self.is_connected())
            .field("frozen", &self.is_frozen())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device::new("test-device".to_string(), "Test Device".to_string())
    }

    #[test]
    fn new_device_is_init_and_unfrozen() {
        let device = device();
        assert_eq!(device.id(), "test-device");
        assert_eq!(device.name(), "Test Device");
        assert_eq!(device.state(), DeviceState::Init);
        assert!(!device.is_connected());
        assert!(!device.is_frozen());
    }

    #[test]
    fn new_node_validates_and_folds_id() {
        let device = device();
        let node = device.new_node("Outlet", "Outlet", "relay").unwrap();
        assert_eq!(node.id(), "outlet");
        assert_eq!(device.node_ids(), vec!["outlet".to_string()]);
        assert!(device.node("OUTLET").is_some());

        let err = device.new_node("bad id", "Bad", "relay").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIdentifier { .. }));
    }

    #[test]
    fn duplicate_node_rejected() {
        let device = device();
        device.new_node("outlet", "Outlet", "relay").unwrap();
        let err = device.new_node("outlet", "Again", "relay").unwrap_err();
        assert_eq!(
            err,
            ConfigError::DuplicateNode {
                device: "test-device".to_string(),
                node: "outlet".to_string()
            }
        );
    }

    #[test]
    fn settings_defaults() {
        let settings = device().settings();
        assert_eq!(settings.topic_base, "homie");
        assert_eq!(settings.period, None);
        assert_eq!(settings.stats_interval, Duration::from_secs(60));
        assert_eq!(settings.firmware_name, "unknown");
        assert_eq!(settings.firmware_version, "unknown");
        assert_eq!(settings.disconnect_grace, Duration::from_millis(250));
    }

    #[test]
    fn topic_base_rejects_wildcards() {
        let device = device();
        assert!(device.set_topic_base("homie/#").is_err());
        assert!(device.set_topic_base("").is_err());
        device.set_topic_base("testing/").unwrap();
        assert_eq!(device.topics().device("$state"), "testing/test-device/$state");
    }

    #[test]
    fn freeze_blocks_configuration() {
        let device = device();
        let _rx = device.freeze().unwrap();
        assert!(device.is_frozen());

        assert!(matches!(
            device.new_node("outlet", "Outlet", "relay"),
            Err(ConfigError::ConfigFrozen(_))
        ));
        assert!(matches!(
            device.set_period(Duration::from_secs(1)),
            Err(ConfigError::ConfigFrozen(_))
        ));
        assert!(matches!(
            device.set_loop(|_| {}),
            Err(ConfigError::ConfigFrozen(_))
        ));
        assert!(matches!(
            device.set_broadcast_handler(|_, _| {}),
            Err(ConfigError::ConfigFrozen(_))
        ));
    }

    #[test]
    fn second_freeze_reports_already_running() {
        let device = device();
        let _rx = device.freeze().unwrap();
        assert_eq!(
            device.freeze().unwrap_err(),
            ConfigError::AlreadyRunning("test-device".to_string())
        );
    }

    #[test]
    fn weak_device_does_not_keep_device_alive() {
        let device = device();
        let weak = device.downgrade();
        assert!(weak.upgrade().is_some());
        drop(device);
        assert!(weak.upgrade().is_none());
    }
}
