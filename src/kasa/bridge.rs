// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery loop mirroring plugs as Homie devices.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::cipher;
use super::sysinfo::{self, DEFAULT_NETWORK, KASA_PORT, PlugStatus, STATUS_QUERY};
use crate::error::{KasaError, Result};
use crate::model::{Command, CommandOutcome, Device, DeviceRegistry, Property};
use crate::protocol::Transport;
use crate::types::Datatype;

/// Topic base plug devices are announced under.
pub const DEFAULT_BRIDGE_TOPIC_BASE: &str = "devices";

/// Node carrying the relay.
pub const OUTLET_NODE: &str = "outlet";

/// Relay property of the outlet node.
pub const ON_PROPERTY: &str = "on";

const DEFAULT_BROADCAST_PERIOD: Duration = Duration::from_secs(10);
const LOST_AFTER_PERIODS: u32 = 10;
const RECV_BUFFER_LEN: usize = 4096;

/// Configuration of a [`KasaBridge`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use homie_runtime::kasa::KasaConfig;
///
/// let config = KasaConfig::default()
///     .with_network("10.0.0.0/24")
///     .with_broadcast_period(Duration::from_secs(5));
///
/// assert_eq!(config.lost_timeout(), Duration::from_secs(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KasaConfig {
    network: String,
    port: u16,
    broadcast_period: Duration,
    topic_base: String,
}

impl Default for KasaConfig {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            port: KASA_PORT,
            broadcast_period: DEFAULT_BROADCAST_PERIOD,
            topic_base: DEFAULT_BRIDGE_TOPIC_BASE.to_string(),
        }
    }
}

impl KasaConfig {
    /// Sets the IPv4 network scanned, in CIDR notation.
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Sets the port plugs listen on.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the interval between status broadcasts.
    #[must_use]
    pub fn with_broadcast_period(mut self, period: Duration) -> Self {
        self.broadcast_period = period;
        self
    }

    /// Sets the topic base of every plug device.
    #[must_use]
    pub fn with_topic_base(mut self, topic_base: impl Into<String>) -> Self {
        self.topic_base = topic_base.into();
        self
    }

    /// Returns the scanned network.
    #[must_use]
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Returns the plug port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns the interval between status broadcasts.
    #[must_use]
    pub fn broadcast_period(&self) -> Duration {
        self.broadcast_period
    }

    /// Returns the topic base of plug devices.
    #[must_use]
    pub fn topic_base(&self) -> &str {
        &self.topic_base
    }

    /// Returns how long a silent plug is kept before it is torn down.
    #[must_use]
    pub fn lost_timeout(&self) -> Duration {
        self.broadcast_period * LOST_AFTER_PERIODS
    }

    /// Returns the address status queries are broadcast to.
    ///
    /// # Errors
    ///
    /// [`KasaError::InvalidNetwork`] if the network is malformed.
    pub fn broadcast_target(&self) -> std::result::Result<SocketAddr, KasaError> {
        let ip = sysinfo::broadcast_address(&self.network)?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
    }
}

/// A plug mirrored as a running device.
struct Plug {
    id: String,
    name: String,
    on: bool,
    last_seen: Instant,
    addr: Arc<Mutex<SocketAddr>>,
    outlet: Property,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Discovers plugs on the local network and mirrors each one as a Homie
/// device with a settable `outlet/on` property.
///
/// Every broadcast period the bridge sends a status query to the network's
/// broadcast address. Each answer creates, updates or renames a device;
/// commands on `on` are relayed to the plug over UDP. Plugs silent for ten
/// periods are torn down. `factory` builds the transport of each device
/// from its id.
pub struct KasaBridge<T, F> {
    config: KasaConfig,
    registry: DeviceRegistry,
    factory: F,
    socket: Arc<UdpSocket>,
    broadcast: SocketAddr,
    plugs: HashMap<String, Plug>,
    _transport: PhantomData<fn() -> T>,
}

impl<T, F> KasaBridge<T, F>
where
    T: Transport,
    F: FnMut(&str) -> T,
{
    /// Binds an ephemeral broadcast-enabled UDP socket and creates a
    /// bridge.
    ///
    /// # Errors
    ///
    /// [`KasaError::InvalidNetwork`] for a malformed network,
    /// [`KasaError::Io`] if the socket cannot be bound.
    pub async fn bind(
        config: KasaConfig,
        registry: DeviceRegistry,
        factory: F,
    ) -> std::result::Result<Self, KasaError> {
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
        socket.set_broadcast(true)?;
        Self::with_socket(config, registry, factory, socket)
    }

    /// Creates a bridge on an already bound socket.
    ///
    /// # Errors
    ///
    /// [`KasaError::InvalidNetwork`] for a malformed network.
    pub fn with_socket(
        config: KasaConfig,
        registry: DeviceRegistry,
        factory: F,
        socket: UdpSocket,
    ) -> std::result::Result<Self, KasaError> {
        let broadcast = config.broadcast_target()?;
        Ok(Self {
            config,
            registry,
            factory,
            socket: Arc::new(socket),
            broadcast,
            plugs: HashMap::new(),
            _transport: PhantomData,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &KasaConfig {
        &self.config
    }

    /// Returns the hardware ids of the plugs currently mirrored, sorted.
    #[must_use]
    pub fn plug_uids(&self) -> Vec<String> {
        let mut uids: Vec<String> = self.plugs.keys().cloned().collect();
        uids.sort();
        uids
    }

    /// Runs discovery until `cancel` fires, then stops every plug device.
    ///
    /// Socket failures are logged and never end the loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        let socket = Arc::clone(&self.socket);
        let query = cipher::encrypt(STATUS_QUERY.as_bytes());

        let period = self.config.broadcast_period.max(Duration::from_millis(1));
        let mut broadcast = tokio::time::interval(period);
        broadcast.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sweep_period = (self.config.lost_timeout() / 2).max(Duration::from_millis(1));
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_period, sweep_period);

        tracing::info!(
            network = %self.config.network,
            broadcast = %self.broadcast,
            period_ms = period.as_millis(),
            "Starting plug discovery"
        );

        let mut buf = vec![0u8; RECV_BUFFER_LEN];
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                _ = broadcast.tick() => {
                    if let Err(e) = socket.send_to(&query, self.broadcast).await {
                        tracing::warn!(dest = %self.broadcast, error = %e, "Status broadcast failed");
                    }
                }
                _ = sweep.tick() => self.sweep(Instant::now()).await,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, addr)) => {
                        let plain = cipher::decrypt(&buf[..len]);
                        match sysinfo::parse_status(&plain) {
                            Ok(status) => self.observe(status, addr, Instant::now()).await,
                            Err(e) => tracing::debug!(addr = %addr, error = %e, "Ignoring datagram"),
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Receiving from plugs failed"),
                },
            }
        }

        tracing::info!(plugs = self.plugs.len(), "Stopping plug discovery");
        for uid in self.plug_uids() {
            self.destroy(&uid).await;
        }
    }

    /// Folds a status answer received from `addr` into the mirrored
    /// devices.
    ///
    /// An unknown plug gets a new device. A plug whose alias changed is
    /// torn down and recreated under its new id. A relay change is queued
    /// as a property update.
    pub async fn observe(&mut self, status: PlugStatus, addr: SocketAddr, now: Instant) {
        let renamed = match self.plugs.get_mut(&status.uid) {
            Some(plug) => {
                *plug.addr.lock() = addr;
                if plug.id == status.id && plug.name == status.name {
                    if plug.on != status.on {
                        plug.on = status.on;
                        tracing::info!(device = %plug.id, on = status.on, "Relay changed");
                        if let Err(e) = plug.outlet.message().send(switch_payload(status.on)).await {
                            tracing::warn!(device = %plug.id, error = %e, "Dropping relay update");
                        }
                    }
                    plug.last_seen = now;
                    return;
                }
                tracing::info!(old = %plug.id, new = %status.id, "Plug renamed");
                true
            }
            None => false,
        };

        if renamed {
            self.destroy(&status.uid).await;
        }
        match self.create(&status, addr, now) {
            Ok(plug) => {
                self.plugs.insert(status.uid, plug);
            }
            Err(e) => tracing::warn!(uid = %status.uid, alias = %status.name, error = %e, "Cannot mirror plug"),
        }
    }

    /// Tears down every plug not seen within the lost timeout.
    pub async fn sweep(&mut self, now: Instant) {
        let timeout = self.config.lost_timeout();
        let lost: Vec<String> = self
            .plugs
            .iter()
            .filter(|(_, plug)| now.saturating_duration_since(plug.last_seen) > timeout)
            .map(|(uid, _)| uid.clone())
            .collect();

        for uid in lost {
            tracing::info!(uid = %uid, "Plug lost");
            self.destroy(&uid).await;
        }
    }

    fn create(&mut self, status: &PlugStatus, addr: SocketAddr, now: Instant) -> Result<Plug> {
        let device = self.registry.create_device(&status.id, status.name.clone())?;
        let addr = Arc::new(Mutex::new(addr));
        let outlet = match self.build_tree(&device, status, &addr) {
            Ok(outlet) => outlet,
            Err(e) => {
                self.registry.remove(&status.id);
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let transport = (self.factory)(&status.id);
        let task = tokio::spawn({
            let device = device.clone();
            let cancel = cancel.clone();
            async move { device.run(transport, cancel).await }
        });
        tracing::info!(device = %status.id, uid = %status.uid, on = status.on, "Plug discovered");

        Ok(Plug {
            id: status.id.clone(),
            name: status.name.clone(),
            on: status.on,
            last_seen: now,
            addr,
            outlet,
            cancel,
            task,
        })
    }

    fn build_tree(
        &self,
        device: &Device,
        status: &PlugStatus,
        addr: &Arc<Mutex<SocketAddr>>,
    ) -> Result<Property> {
        device.set_topic_base(&self.config.topic_base)?;
        let node = device.new_node(OUTLET_NODE, "outlet", "relay")?;
        let outlet = node.advertise(ON_PROPERTY, "on", Datatype::Boolean)?;
        outlet.settable(relay_handler(Arc::clone(&self.socket), Arc::clone(addr)))?;
        outlet.message().try_send(switch_payload(status.on))?;
        Ok(outlet)
    }

    async fn destroy(&mut self, uid: &str) {
        let Some(plug) = self.plugs.remove(uid) else {
            return;
        };
        plug.cancel.cancel();
        match plug.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(device = %plug.id, error = %e, "Plug device failed"),
            Err(e) => tracing::warn!(device = %plug.id, error = %e, "Plug device task panicked"),
        }
        self.registry.remove(&plug.id);
        tracing::info!(device = %plug.id, "Plug removed");
    }
}

fn switch_payload(on: bool) -> &'static str {
    if on { "true" } else { "false" }
}

/// Handler for `outlet/on/set`: sends the relay command and a status query
/// to the plug from a spawned task. The new value is published once the
/// plug reports it.
fn relay_handler(
    socket: Arc<UdpSocket>,
    addr: Arc<Mutex<SocketAddr>>,
) -> impl Fn(&Command<'_>) -> CommandOutcome + Send + Sync + 'static {
    move |cmd| {
        let Some(on) = sysinfo::parse_switch(cmd.payload) else {
            tracing::warn!(device = %cmd.device_id, payload = %cmd.payload, "Unknown switch value");
            return CommandOutcome::Handled;
        };
        if cmd.property.value == switch_payload(on) {
            return CommandOutcome::Handled;
        }

        let dest = *addr.lock();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(device = %cmd.device_id, "No runtime to reach the plug");
            return CommandOutcome::Handled;
        };
        tracing::info!(device = %cmd.device_id, dest = %dest, on, "Switching relay");
        let socket = Arc::clone(&socket);
        let device = cmd.device_id.to_string();
        runtime.spawn(async move {
            for request in [sysinfo::relay_command(on), STATUS_QUERY] {
                if let Err(e) = socket.send_to(&cipher::encrypt(request.as_bytes()), dest).await {
                    tracing::warn!(device = %device, dest = %dest, error = %e, "Sending to plug failed");
                }
            }
        });
        CommandOutcome::Handled
    }
}
