//! ==============================================================================
//! main.rs - lora to firebase gateway entry point
//! ==============================================================================
//!
//! purpose:
//!     receives json sensor readings from field nodes over a lora link and
//!     stores each one in a firebase realtime database under the gateway
//!     account's uid.
//!
//! responsibilities:
//!     - load and validate configuration, set up logging
//!     - open the radio bus (rppal spi with the `hardware` feature, the
//!       in-memory sx127x model otherwise)
//!     - pick the network link (nmcli wi-fi, or the host's own networking)
//!     - pick the clock (sntp or the host clock)
//!     - bootstrap radio, network, database; exit non-zero if any of them fails
//!     - run the receive loop until ctrl+c
//!
//! relationships:
//!     - uses: config.rs, hal.rs, radio.rs, network.rs, clock.rs, firebase.rs,
//!             gateway.rs
//!
//! architecture:
//!
//!     ┌──────────┐   spi    ┌─────────────────────────────────────────────┐
//!     │  sx127x  │ ───────► │                gateway (this crate)         │
//!     │  radio   │          │  radio.rs ─► pipeline.rs ─► firebase.rs ────┼──► https PUT
//!     └──────────┘          │                              ▲              │    /UsersData/{uid}/
//!          ▲                │                    auth.rs ──┘ clock.rs     │      readings/node-{id}/{ts}
//!          │ lora 915 MHz   └─────────────────────────────────────────────┘
//!     ┌──────────┐
//!     │  nodes   │  {"node_id":3,"humidity":55,"temperature":21.5}
//!     └──────────┘
//!
//! ==============================================================================

mod auth;
mod clock;
mod config;
mod domain;
mod firebase;
mod gateway;
mod hal;
mod network;
mod pipeline;
mod radio;

use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};

use crate::clock::{EpochClock, NtpClock, SystemClock};
use crate::firebase::FirebaseClient;
use crate::gateway::Gateway;
use crate::hal::{PlatformBus, RadioPins};
use crate::network::{HostLink, NetworkLink, NmcliLink, WifiBootstrapper};
use crate::radio::RadioReceiver;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  LoRa -> Firebase RTDB Gateway");
    println!("===========================================================");

    // step 1: configuration (printed before logging exists, like the summary)
    let config = config::GatewayConfig::load_or_default();
    config.print_summary();

    // step 2: logging; RUST_LOG wins over the config file
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_target(false)
        .init();

    if let Err(e) = config.validate() {
        error!(error = %format!("{:#}", e), "Invalid configuration");
        return Err(e);
    }

    // step 3: components
    let pins = RadioPins {
        cs: config.radio.cs_pin,
        reset: config.radio.reset_pin,
        irq: config.radio.irq_pin,
    };
    let bus = PlatformBus::open(pins, config.radio.spi_clock_hz)?;
    let receiver = RadioReceiver::new(bus, &config.radio);

    let link: Box<dyn NetworkLink> = if config.wifi.enabled {
        Box::new(NmcliLink)
    } else {
        info!("WiFi management disabled; using host networking");
        Box::new(HostLink)
    };
    let network = WifiBootstrapper::new(
        link,
        &config.wifi.ssid,
        &config.wifi.password,
        Duration::from_millis(config.wifi.poll_interval_ms),
        config.wifi.max_attempts,
    );

    let clock: Box<dyn EpochClock> = if config.ntp.enabled {
        Box::new(NtpClock::new(&config.ntp))
    } else {
        Box::new(SystemClock)
    };
    let store = FirebaseClient::new(&config.firebase, clock)?;

    let mut gateway = Gateway::new(receiver, network, store, &config);

    // step 4: bring-up in order; any failure ends the process
    if let Err(e) = gateway.bootstrap().await {
        error!(error = %e, "Startup failed");
        return Err(e.into());
    }

    // step 5: receive loop
    println!("────────────────────────────────────────────────────────────");
    tokio::select! {
        _ = gateway.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    let stats = gateway.snapshot_stats();
    info!(
        packets = stats.packets,
        stored = stats.stored,
        dropped = stats.dropped,
        gated = stats.gated,
        write_failures = stats.write_failures,
        crc_errors = stats.crc_errors,
        "Gateway stopped"
    );
    Ok(())
}
