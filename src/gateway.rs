//! ==============================================================================
//! gateway.rs - application context and control loop
//! ==============================================================================
//!
//! purpose:
//!     owns every component and runs them in order:
//!
//!     bootstrap:  radio ──► wi-fi ──► database
//!     loop:       poll ──► drain ──► pipeline ──► (reconnect on transport failure)
//!
//!     the radio comes first so that a missing transceiver stops the process
//!     before any network or database traffic. after bootstrap nothing is
//!     fatal: each iteration either ingests one packet or idles.
//!
//! relationships:
//!     - uses: radio.rs, network.rs, firebase.rs, pipeline.rs, clock.rs
//!     - used by: main.rs
//!
//! ==============================================================================

use crate::clock::IntervalGate;
use crate::config::GatewayConfig;
use crate::firebase::{DatabaseError, ReadingStore};
use crate::hal::RadioBus;
use crate::network::{NetworkError, WifiBootstrapper};
use crate::pipeline::{IngestOutcome, Pipeline};
use crate::radio::{RadioInitError, RadioReceiver};

use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Radio(#[from] RadioInitError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub packets: u64,
    pub dropped: u64,
    pub gated: u64,
    pub stored: u64,
    pub write_failures: u64,
    pub crc_errors: u64,
}

/// result of one loop iteration
#[derive(Debug)]
pub enum Step {
    Idle,
    Ingested(IngestOutcome),
    RadioFault(String),
}

pub struct Gateway<B: RadioBus, S: ReadingStore> {
    receiver: RadioReceiver<B>,
    network: WifiBootstrapper,
    store: S,
    pipeline: Pipeline,
    stats: GatewayStats,
    stats_gate: Option<IntervalGate>,
    poll_interval: Duration,
    reconnect_network: bool,
}

impl<B: RadioBus, S: ReadingStore> Gateway<B, S> {
    pub fn new(receiver: RadioReceiver<B>, network: WifiBootstrapper, store: S, config: &GatewayConfig) -> Self {
        let stats_gate = (config.logging.stats_interval_secs > 0).then(|| {
            let mut gate = IntervalGate::new(Duration::from_secs(config.logging.stats_interval_secs));
            // swallow the first firing; nothing to report at startup
            gate.run_every();
            gate
        });

        Self {
            receiver,
            network,
            store,
            pipeline: Pipeline::new(config.pipeline.write_interval_secs, config.logging.show_sensor_data),
            stats: GatewayStats::default(),
            stats_gate,
            poll_interval: Duration::from_millis(config.radio.poll_interval_ms),
            reconnect_network: config.firebase.reconnect_network,
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// counters with the radio's CRC error count brought up to date
    pub fn snapshot_stats(&mut self) -> GatewayStats {
        self.stats.crc_errors = self.receiver.crc_errors();
        self.stats.clone()
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[cfg(test)]
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Radio, then network, then database. Stops at the first failure.
    pub async fn bootstrap(&mut self) -> Result<(), BootstrapError> {
        self.receiver.initialize().await?;
        self.network.connect().await?;
        let uid = self.store.initialize().await?;
        info!(uid = %uid, "Gateway ready");
        if let Some(interval) = self.pipeline.write_interval() {
            info!(interval_secs = interval.as_secs(), "Writes limited to one per interval");
        }
        Ok(())
    }

    /// One poll/ingest iteration.
    pub async fn step(&mut self) -> Step {
        let size = match self.receiver.poll() {
            Ok(size) => size,
            Err(e) => return Step::RadioFault(format!("{:#}", e)),
        };
        if size == 0 {
            return Step::Idle;
        }

        let packet = match self.receiver.drain() {
            Ok(packet) => packet,
            Err(e) => return Step::RadioFault(format!("{:#}", e)),
        };
        self.stats.packets += 1;

        let outcome = self.pipeline.ingest(&packet, &mut self.store).await;
        match &outcome {
            IngestOutcome::Stored(_) => self.stats.stored += 1,
            IngestOutcome::Dropped(_) => self.stats.dropped += 1,
            IngestOutcome::Gated { .. } => self.stats.gated += 1,
            IngestOutcome::WriteFailed(e) => {
                self.stats.write_failures += 1;
                if e.is_transport() && self.reconnect_network {
                    if let Err(e) = self.network.ensure_connected().await {
                        warn!(error = %e, "Reconnect failed; will retry on the next failed write");
                    }
                }
            }
        }
        Step::Ingested(outcome)
    }

    /// Runs until the task is dropped.
    pub async fn run(&mut self) {
        info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "Listening for packets");
        loop {
            match self.step().await {
                Step::Ingested(_) => {}
                Step::Idle => tokio::time::sleep(self.poll_interval).await,
                Step::RadioFault(reason) => {
                    error!(error = %reason, "Radio access failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
            self.maybe_log_stats();
        }
    }

    fn maybe_log_stats(&mut self) {
        let due = self.stats_gate.as_mut().map(IntervalGate::run_every).unwrap_or(false);
        if !due {
            return;
        }
        let s = self.snapshot_stats();
        info!(
            packets = s.packets,
            stored = s.stored,
            dropped = s.dropped,
            gated = s.gated,
            write_failures = s.write_failures,
            crc_errors = s.crc_errors,
            "Gateway statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firebase::memory::MemoryStore;
    use crate::firebase::WriteError;
    use crate::hal::MockBus;
    use crate::network::fake::ScriptedLink;
    use crate::network::{LinkState, LinkStatus};
    use serde_json::json;

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.radio.begin_retry_delay_ms = 0;
        config.radio.poll_interval_ms = 0;
        config.wifi.poll_interval_ms = 0;
        config.wifi.max_attempts = 3;
        config
    }

    fn gateway(bus: MockBus, link: ScriptedLink, store: MemoryStore) -> Gateway<MockBus, MemoryStore> {
        let config = config();
        let receiver = RadioReceiver::new(bus, &config.radio);
        let network = WifiBootstrapper::new(Box::new(link), "field-ap", "secret", Duration::ZERO, config.wifi.max_attempts);
        Gateway::new(receiver, network, store, &config)
    }

    /// steps until a packet has been ingested
    async fn next_outcome(gateway: &mut Gateway<MockBus, MemoryStore>) -> IngestOutcome {
        for _ in 0..10 {
            match gateway.step().await {
                Step::Ingested(outcome) => return outcome,
                Step::Idle => {}
                Step::RadioFault(reason) => panic!("radio fault: {}", reason),
            }
        }
        panic!("no packet ingested");
    }

    #[tokio::test]
    async fn test_missing_radio_halts_before_network_and_database() {
        let link = ScriptedLink::new(&[LinkStatus::Connected]);
        let log = link.log.clone();
        let mut gateway = gateway(MockBus::absent(), link, MemoryStore::new("Xy12uid", 1));

        let result = gateway.bootstrap().await;
        assert!(matches!(result, Err(BootstrapError::Radio(RadioInitError::Exhausted { attempts: 15, .. }))));
        assert_eq!(log.lock().unwrap().begins, 0);
        assert_eq!(log.lock().unwrap().status_polls, 0);
        assert_eq!(gateway.store().init_calls, 0);
    }

    #[tokio::test]
    async fn test_network_failure_skips_database() {
        let link = ScriptedLink::new(&[LinkStatus::Disconnected]);
        let mut gateway = gateway(MockBus::new(), link, MemoryStore::new("Xy12uid", 1));

        let result = gateway.bootstrap().await;
        assert!(matches!(result, Err(BootstrapError::Network(NetworkError::Exhausted { attempts: 3, .. }))));
        assert_eq!(gateway.store().init_calls, 0);
    }

    #[tokio::test]
    async fn test_auth_failure_is_reported() {
        let link = ScriptedLink::new(&[LinkStatus::Connected]);
        let mut gateway = gateway(MockBus::new(), link, MemoryStore::new("", 1));

        let result = gateway.bootstrap().await;
        assert!(matches!(result, Err(BootstrapError::Database(DatabaseError::AuthExhausted { .. }))));
    }

    #[tokio::test]
    async fn test_packet_on_air_lands_in_the_database() {
        let bus = MockBus::new();
        let link = ScriptedLink::new(&[LinkStatus::Connected]);
        let mut gateway = gateway(bus.clone(), link, MemoryStore::new("Xy12uid", 1_700_000_000));
        gateway.bootstrap().await.unwrap();

        assert!(matches!(gateway.step().await, Step::Idle));
        bus.transmit(0xF3, br#"{"node_id":3,"humidity":55,"temperature":21.5}"#, 110, 20)
            .unwrap();

        let outcome = next_outcome(&mut gateway).await;
        assert!(matches!(outcome, IngestOutcome::Stored(_)));

        let (path, record) = &gateway.store().records[0];
        assert_eq!(path, "/UsersData/Xy12uid/readings/node-3/1700000000");
        assert_eq!(json!(record), json!({"humidity": 55, "temperature": 21.5}));
        assert_eq!(gateway.stats().packets, 1);
        assert_eq!(gateway.stats().stored, 1);
    }

    #[tokio::test]
    async fn test_loop_survives_bad_packets_and_failed_writes() {
        let bus = MockBus::new();
        let link = ScriptedLink::new(&[LinkStatus::Connected]);
        let mut gateway = gateway(bus.clone(), link, MemoryStore::new("Xy12uid", 42));
        gateway.bootstrap().await.unwrap();
        gateway.step().await;

        bus.transmit(0xF3, b"not json", 100, 0).unwrap();
        assert!(matches!(next_outcome(&mut gateway).await, IngestOutcome::Dropped(_)));

        gateway.store_mut().fail_writes = true;
        bus.transmit(0xF3, br#"{"node_id":5,"water_level":12}"#, 100, 0).unwrap();
        assert!(matches!(
            next_outcome(&mut gateway).await,
            IngestOutcome::WriteFailed(WriteError::Rejected { .. })
        ));

        gateway.store_mut().fail_writes = false;
        bus.transmit(0xF3, br#"{"node_id":5,"water_level":13}"#, 100, 0).unwrap();
        assert!(matches!(next_outcome(&mut gateway).await, IngestOutcome::Stored(_)));

        let stats = gateway.stats();
        assert_eq!((stats.packets, stats.dropped, stats.write_failures, stats.stored), (3, 1, 1, 1));
    }

    #[tokio::test]
    async fn test_snapshot_includes_radio_crc_errors() {
        let bus = MockBus::new();
        let link = ScriptedLink::new(&[LinkStatus::Connected]);
        let mut gateway = gateway(bus.clone(), link, MemoryStore::new("Xy12uid", 42));
        gateway.bootstrap().await.unwrap();
        gateway.step().await;

        bus.transmit_corrupted(0xF3, b"{\"node_id\":1").unwrap();
        assert!(matches!(gateway.step().await, Step::Idle));
        assert_eq!(gateway.stats().crc_errors, 0);

        let stats = gateway.snapshot_stats();
        assert_eq!(stats.crc_errors, 1);
        assert_eq!(stats.packets, 0);
        assert_eq!(gateway.stats().crc_errors, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_rejoins_dropped_wifi() {
        let bus = MockBus::new();
        // bootstrap sees the link up, the post-failure check sees it down
        let link = ScriptedLink::new(&[LinkStatus::Connected, LinkStatus::Disconnected, LinkStatus::Connected]);
        let log = link.log.clone();
        let mut gateway = gateway(bus.clone(), link, MemoryStore::new("Xy12uid", 42));
        gateway.bootstrap().await.unwrap();
        gateway.step().await;

        gateway.store_mut().fail_with_transport = true;
        bus.transmit(0xF3, br#"{"node_id":8}"#, 100, 0).unwrap();
        assert!(matches!(
            next_outcome(&mut gateway).await,
            IngestOutcome::WriteFailed(WriteError::Transport(_))
        ));

        assert_eq!(log.lock().unwrap().begins, 2);
        assert!(matches!(gateway.network.state(), LinkState::Connected { .. }));
    }
}
