// SPDX-License-Identifier: MPL-2.0

//! Smart-plug bridge.
//!
//! Discovers plugs on the local network and exposes each one as a Homie
//! device with a settable `outlet/on` property.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example kasaplug
//!
//! # Debug mode: 1 s broadcasts, topic base `kasadebug`, stops after
//! # DEBUGRUNLENGTH seconds
//! cargo run --example kasaplug -- -d
//! ```
//!
//! # Environment
//!
//! - `NETWORK`: IPv4 network to scan (default `192.168.1.0/24`)
//! - `BROADCASTPERIOD`: seconds between status broadcasts (default 10)
//! - `DEBUGRUNLENGTH`: run length in debug mode, in seconds (default 10)
//! - `MQTTBROKER`: broker URL (default `tcp://127.0.0.1:1883`)
//! - `HOMIETOPIC`: topic base, ignored in debug mode (default `devices`)

use std::env;
use std::time::Duration;

use homie_runtime::kasa::{DEFAULT_BRIDGE_TOPIC_BASE, DEFAULT_NETWORK, KasaBridge, KasaConfig};
use homie_runtime::model::DeviceRegistry;
use homie_runtime::protocol::{DEFAULT_BROKER_URL, MqttTransport};
use tokio_util::sync::CancellationToken;
use tracing::Level;

const DEFAULT_BROADCAST_SECS: u64 = 10;
const DEBUG_BROADCAST_SECS: u64 = 1;
const DEFAULT_DEBUG_RUN_SECS: u64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let debug = match args.get(1).map(String::as_str) {
        None => false,
        Some("-d") => true,
        Some(_) => {
            eprintln!("Usage: {} [-d]", args[0]);
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .init();

    let default_period = if debug {
        DEBUG_BROADCAST_SECS
    } else {
        DEFAULT_BROADCAST_SECS
    };
    let topic_base = if debug {
        "kasadebug".to_string()
    } else {
        env::var("HOMIETOPIC").unwrap_or_else(|_| DEFAULT_BRIDGE_TOPIC_BASE.to_string())
    };
    let config = KasaConfig::default()
        .with_network(env::var("NETWORK").unwrap_or_else(|_| DEFAULT_NETWORK.to_string()))
        .with_broadcast_period(Duration::from_secs(env_secs("BROADCASTPERIOD", default_period)))
        .with_topic_base(topic_base);

    let broker_url = env::var("MQTTBROKER").unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string());
    // Fail early on a bad URL rather than once per discovered plug
    MqttTransport::from_url(&broker_url)?;

    println!("Bridging plugs on {} to {broker_url}", config.network());
    println!("Topic base: {}", config.topic_base());

    let bridge = KasaBridge::bind(config, DeviceRegistry::new(), move |_: &str| {
        MqttTransport::from_url(&broker_url).expect("broker URL validated at startup")
    })
    .await?;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        if debug {
            let run_length = Duration::from_secs(env_secs("DEBUGRUNLENGTH", DEFAULT_DEBUG_RUN_SECS));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                () = tokio::time::sleep(run_length) => println!("Debug run finished"),
            }
        } else {
            let _ = tokio::signal::ctrl_c().await;
        }
        stopper.cancel();
    });

    bridge.run(cancel).await;
    println!("Stopped");
    Ok(())
}

/// Reads a whole number of seconds from the environment, falling back to
/// `default` when unset or malformed.
fn env_secs(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
