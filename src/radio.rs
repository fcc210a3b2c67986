//! ==============================================================================
//! radio.rs - SX127x LoRa receiver
//! ==============================================================================
//!
//! purpose:
//!     register-level driver for the Semtech SX1276/77/78/79 in LoRa mode,
//!     plus the receiver bring-up policy (bounded begin attempts, sync word).
//!
//! scope:
//!     receive only, explicit header mode, default modem settings
//!     (BW 125 kHz, CR 4/5, SF7, CRC as sent). no transmit path.
//!
//! relationships:
//!     - uses: hal.rs (RadioBus: spi, reset, dio0)
//!     - used by: gateway.rs (initialize at boot, poll/drain in the loop)
//!
//! ==============================================================================

use crate::config::RadioConfig;
use crate::domain::Packet;
use crate::hal::{RadioBus, SX1276_VERSION};

use anyhow::{bail, Result};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

// registers
const REG_FIFO: u8 = 0x00;
const REG_OP_MODE: u8 = 0x01;
const REG_FRF_MSB: u8 = 0x06;
const REG_FRF_MID: u8 = 0x07;
const REG_FRF_LSB: u8 = 0x08;
const REG_LNA: u8 = 0x0c;
const REG_FIFO_ADDR_PTR: u8 = 0x0d;
const REG_FIFO_TX_BASE_ADDR: u8 = 0x0e;
const REG_FIFO_RX_BASE_ADDR: u8 = 0x0f;
const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
const REG_IRQ_FLAGS: u8 = 0x12;
const REG_RX_NB_BYTES: u8 = 0x13;
const REG_PKT_SNR_VALUE: u8 = 0x19;
const REG_PKT_RSSI_VALUE: u8 = 0x1a;
const REG_MODEM_CONFIG_1: u8 = 0x1d;
const REG_MODEM_CONFIG_3: u8 = 0x26;
const REG_SYNC_WORD: u8 = 0x39;
const REG_VERSION: u8 = 0x42;

// modes
const MODE_LONG_RANGE_MODE: u8 = 0x80;
const MODE_SLEEP: u8 = 0x00;
const MODE_STDBY: u8 = 0x01;
const MODE_RX_SINGLE: u8 = 0x06;

// irq masks
const IRQ_PAYLOAD_CRC_ERROR_MASK: u8 = 0x20;
const IRQ_RX_DONE_MASK: u8 = 0x40;

const FXOSC_HZ: u64 = 32_000_000;
const RF_MID_BAND_THRESHOLD_HZ: u64 = 525_000_000;
const RSSI_OFFSET_HF_PORT: i16 = 157;
const RSSI_OFFSET_LF_PORT: i16 = 164;

/// Register driver. Owns the bus; every method is a short burst of SPI frames.
pub struct Sx127x<B: RadioBus> {
    bus: B,
    frequency_hz: u64,
    packet_index: usize,
    crc_errors: u64,
}

impl<B: RadioBus> Sx127x<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            frequency_hz: 0,
            packet_index: 0,
            crc_errors: 0,
        }
    }

    fn read_register(&mut self, addr: u8) -> Result<u8> {
        let rx = self.bus.spi_transfer(&[addr & 0x7f, 0x00])?;
        Ok(rx.get(1).copied().unwrap_or(0))
    }

    fn write_register(&mut self, addr: u8, value: u8) -> Result<()> {
        self.bus.spi_transfer(&[addr | 0x80, value])?;
        Ok(())
    }

    /// reset the chip, verify it answers, and leave it in standby at `frequency_hz`
    pub fn begin(&mut self, frequency_hz: u64) -> Result<()> {
        self.bus.write_reset(false)?;
        self.bus.delay_ms(10);
        self.bus.write_reset(true)?;
        self.bus.delay_ms(10);

        let version = self.read_register(REG_VERSION)?;
        if version != SX1276_VERSION {
            bail!("unexpected SX127x version 0x{:02X} (expected 0x{:02X})", version, SX1276_VERSION);
        }

        self.sleep()?;
        self.set_frequency(frequency_hz)?;

        self.write_register(REG_FIFO_TX_BASE_ADDR, 0)?;
        self.write_register(REG_FIFO_RX_BASE_ADDR, 0)?;

        // LNA boost on the HF port
        let lna = self.read_register(REG_LNA)?;
        self.write_register(REG_LNA, lna | 0x03)?;

        // LNA gain set by the internal AGC loop
        self.write_register(REG_MODEM_CONFIG_3, 0x04)?;

        self.idle()
    }

    pub fn sleep(&mut self) -> Result<()> {
        self.write_register(REG_OP_MODE, MODE_LONG_RANGE_MODE | MODE_SLEEP)
    }

    pub fn idle(&mut self) -> Result<()> {
        self.write_register(REG_OP_MODE, MODE_LONG_RANGE_MODE | MODE_STDBY)
    }

    pub fn set_frequency(&mut self, frequency_hz: u64) -> Result<()> {
        self.frequency_hz = frequency_hz;
        let frf = (frequency_hz << 19) / FXOSC_HZ;
        self.write_register(REG_FRF_MSB, (frf >> 16) as u8)?;
        self.write_register(REG_FRF_MID, (frf >> 8) as u8)?;
        self.write_register(REG_FRF_LSB, frf as u8)
    }

    pub fn set_sync_word(&mut self, word: u8) -> Result<()> {
        self.write_register(REG_SYNC_WORD, word)
    }

    /// Non-blocking receive check. Returns the size of a freshly received
    /// packet, or 0 after re-arming single receive mode.
    pub fn parse_packet(&mut self) -> Result<usize> {
        let mut packet_length = 0usize;
        let irq_flags = self.read_register(REG_IRQ_FLAGS)?;

        // explicit header mode
        let modem_config = self.read_register(REG_MODEM_CONFIG_1)?;
        self.write_register(REG_MODEM_CONFIG_1, modem_config & 0xfe)?;

        // clear what we just read
        self.write_register(REG_IRQ_FLAGS, irq_flags)?;

        if irq_flags & IRQ_RX_DONE_MASK != 0 && irq_flags & IRQ_PAYLOAD_CRC_ERROR_MASK == 0 {
            self.packet_index = 0;
            packet_length = self.read_register(REG_RX_NB_BYTES)? as usize;
            let current = self.read_register(REG_FIFO_RX_CURRENT_ADDR)?;
            self.write_register(REG_FIFO_ADDR_PTR, current)?;
            self.idle()?;
        } else {
            if irq_flags & IRQ_PAYLOAD_CRC_ERROR_MASK != 0 {
                self.crc_errors += 1;
                warn!(crc_errors = self.crc_errors, "Discarded packet with payload CRC error");
            }
            if self.read_register(REG_OP_MODE)? != (MODE_LONG_RANGE_MODE | MODE_RX_SINGLE) {
                self.write_register(REG_FIFO_ADDR_PTR, 0)?;
                self.write_register(REG_OP_MODE, MODE_LONG_RANGE_MODE | MODE_RX_SINGLE)?;
            }
        }

        Ok(packet_length)
    }

    pub fn available(&mut self) -> Result<usize> {
        let received = self.read_register(REG_RX_NB_BYTES)? as usize;
        Ok(received.saturating_sub(self.packet_index))
    }

    pub fn read(&mut self) -> Result<Option<u8>> {
        if self.available()? == 0 {
            return Ok(None);
        }
        self.packet_index += 1;
        self.read_register(REG_FIFO).map(Some)
    }

    /// dBm of the last packet
    pub fn packet_rssi(&mut self) -> Result<i16> {
        let raw = self.read_register(REG_PKT_RSSI_VALUE)? as i16;
        let offset = if self.frequency_hz < RF_MID_BAND_THRESHOLD_HZ {
            RSSI_OFFSET_LF_PORT
        } else {
            RSSI_OFFSET_HF_PORT
        };
        Ok(raw - offset)
    }

    /// dB of the last packet
    pub fn packet_snr(&mut self) -> Result<f32> {
        let raw = self.read_register(REG_PKT_SNR_VALUE)? as i8;
        Ok(raw as f32 * 0.25)
    }

    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    pub fn dio0(&mut self) -> Result<bool> {
        self.bus.irq_level()
    }

    /// still waiting in single receive; false once RxDone or RxTimeout dropped it to standby
    pub fn is_receiving(&mut self) -> Result<bool> {
        Ok(self.read_register(REG_OP_MODE)? == (MODE_LONG_RANGE_MODE | MODE_RX_SINGLE))
    }
}

#[derive(Debug, Error)]
pub enum RadioInitError {
    #[error("LoRa init failed after {attempts} attempts: {last_error}. Check your connections.")]
    Exhausted { attempts: u32, last_error: String },
    #[error("failed to set sync word: {0}")]
    SyncWord(String),
}

// ==============================================================================
// receiver - bring-up policy and the loop-facing surface
// ==============================================================================

pub struct RadioReceiver<B: RadioBus> {
    radio: Sx127x<B>,
    frequency_hz: u64,
    sync_word: u8,
    attempts: u32,
    retry_delay: Duration,
    armed: bool,
}

impl<B: RadioBus> RadioReceiver<B> {
    pub fn new(bus: B, config: &RadioConfig) -> Self {
        Self {
            radio: Sx127x::new(bus),
            frequency_hz: config.frequency_hz,
            sync_word: config.sync_word,
            attempts: config.begin_attempts.max(1),
            retry_delay: Duration::from_millis(config.begin_retry_delay_ms),
            armed: false,
        }
    }

    /// Start the transceiver. Gives up after the configured number of
    /// attempts; the caller is expected to halt on that error.
    pub async fn initialize(&mut self) -> Result<(), RadioInitError> {
        info!(frequency_hz = self.frequency_hz, "Initializing LoRa Receiver");

        let mut attempt = 1;
        loop {
            match self.radio.begin(self.frequency_hz) {
                Ok(()) => break,
                Err(e) => {
                    warn!(attempt, max = self.attempts, error = %e, "LoRa begin failed");
                    if attempt >= self.attempts {
                        error!("LoRa init failed. Check your connections.");
                        return Err(RadioInitError::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                }
            }
            attempt += 1;
            tokio::time::sleep(self.retry_delay).await;
        }

        self.radio
            .set_sync_word(self.sync_word)
            .map_err(|e| RadioInitError::SyncWord(e.to_string()))?;

        info!(attempts = attempt, sync_word = %format!("0x{:02X}", self.sync_word), "LoRa Receiver Initializing OK!");
        info!("Only receive messages from nodes");
        Ok(())
    }

    /// size of a pending packet, 0 when none
    pub fn poll(&mut self) -> Result<usize> {
        // DIO0 maps to RxDone. while it is low and the chip is still in
        // RX_SINGLE there is nothing to fetch; after an RxTimeout the chip sits
        // in standby and parse_packet has to re-arm it.
        if self.armed && !self.radio.dio0()? && self.radio.is_receiving()? {
            return Ok(0);
        }
        let size = self.radio.parse_packet()?;
        self.armed = size == 0;
        Ok(size)
    }

    /// read every available byte of the current packet
    pub fn drain(&mut self) -> Result<Packet> {
        let rssi = self.radio.packet_rssi()?;
        let snr = self.radio.packet_snr()?;
        let mut payload = Vec::new();
        while let Some(byte) = self.radio.read()? {
            payload.push(byte);
        }
        Ok(Packet { payload, rssi, snr })
    }

    pub fn crc_errors(&self) -> u64 {
        self.radio.crc_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MockBus;

    fn config() -> RadioConfig {
        RadioConfig {
            begin_retry_delay_ms: 0,
            ..RadioConfig::default()
        }
    }

    /// counts begin attempts by counting reset pulses
    fn attempts(bus: &MockBus) -> u32 {
        bus.reset_pulses().unwrap()
    }

    #[test]
    fn test_frequency_registers_for_915mhz() {
        let bus = MockBus::new();
        let mut radio = Sx127x::new(bus.clone());
        radio.begin(915_000_000).unwrap();

        // 915e6 * 2^19 / 32e6 = 0xE4C000
        assert_eq!(bus.register(REG_FRF_MSB).unwrap(), 0xE4);
        assert_eq!(bus.register(REG_FRF_MID).unwrap(), 0xC0);
        assert_eq!(bus.register(REG_FRF_LSB).unwrap(), 0x00);
        assert_eq!(bus.register(REG_OP_MODE).unwrap(), MODE_LONG_RANGE_MODE | MODE_STDBY);
        assert_eq!(bus.register(REG_MODEM_CONFIG_3).unwrap(), 0x04);
    }

    #[tokio::test]
    async fn test_initialize_sets_sync_word() {
        let bus = MockBus::new();
        let mut receiver = RadioReceiver::new(bus.clone(), &config());
        receiver.initialize().await.unwrap();

        assert_eq!(bus.register(REG_SYNC_WORD).unwrap(), 0xF3);
        assert_eq!(attempts(&bus), 1);
    }

    #[tokio::test]
    async fn test_initialize_gives_up_after_fifteen_attempts() {
        let bus = MockBus::absent();
        let mut receiver = RadioReceiver::new(bus.clone(), &config());

        match receiver.initialize().await {
            Err(RadioInitError::Exhausted { attempts: n, .. }) => assert_eq!(n, 15),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(attempts(&bus), 15);
        // sync word never written
        assert_eq!(bus.register(REG_SYNC_WORD).unwrap(), 0x12);
    }

    #[tokio::test]
    async fn test_poll_and_drain_packet() {
        let bus = MockBus::new();
        let mut receiver = RadioReceiver::new(bus.clone(), &config());
        receiver.initialize().await.unwrap();

        // nothing on air: poll re-arms rx single
        assert_eq!(receiver.poll().unwrap(), 0);
        assert_eq!(bus.register(REG_OP_MODE).unwrap(), MODE_LONG_RANGE_MODE | MODE_RX_SINGLE);

        let payload = br#"{"node_id":3,"humidity":55}"#;
        bus.transmit(0xF3, payload, 100, 32).unwrap();

        let size = receiver.poll().unwrap();
        assert_eq!(size, payload.len());

        let packet = receiver.drain().unwrap();
        assert_eq!(packet.payload, payload.to_vec());
        assert_eq!(packet.rssi, 100 - 157);
        assert_eq!(packet.snr, 8.0);

        // consumed
        assert_eq!(receiver.poll().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_foreign_sync_word_is_never_seen() {
        let bus = MockBus::new();
        let mut receiver = RadioReceiver::new(bus.clone(), &config());
        receiver.initialize().await.unwrap();
        receiver.poll().unwrap();

        bus.transmit(0x34, br#"{"node_id":9}"#, 90, 0).unwrap();
        assert_eq!(receiver.poll().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_crc_error_packet_is_discarded_and_counted() {
        let bus = MockBus::new();
        let mut receiver = RadioReceiver::new(bus.clone(), &config());
        receiver.initialize().await.unwrap();
        receiver.poll().unwrap();

        bus.transmit_corrupted(0xF3, b"{\"node_id\":1").unwrap();
        assert_eq!(receiver.poll().unwrap(), 0);
        assert_eq!(receiver.crc_errors(), 1);

        // re-armed, so the next clean packet still arrives
        bus.transmit(0xF3, b"{}", 80, 4).unwrap();
        assert_eq!(receiver.poll().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_poll_rearms_after_rx_timeout() {
        let bus = MockBus::new();
        let mut receiver = RadioReceiver::new(bus.clone(), &config());
        receiver.initialize().await.unwrap();
        receiver.poll().unwrap();

        // no preamble within the symbol timeout: chip falls back to standby
        bus.rx_timeout().unwrap();
        assert_eq!(bus.register(REG_OP_MODE).unwrap(), MODE_LONG_RANGE_MODE | MODE_STDBY);

        let payload = br#"{"node_id":3}"#;
        bus.transmit(0xF3, payload, 100, 0).unwrap();

        let mut received = 0;
        for _ in 0..5 {
            received = receiver.poll().unwrap();
            if received > 0 {
                break;
            }
        }
        assert_eq!(received, payload.len());
        assert_eq!(receiver.drain().unwrap().payload, payload.to_vec());
    }

    #[test]
    fn test_rssi_uses_low_frequency_offset_below_525mhz() {
        let bus = MockBus::new();
        let mut radio = Sx127x::new(bus.clone());
        radio.begin(433_000_000).unwrap();
        radio.parse_packet().unwrap();
        bus.transmit(0x12, b"x", 100, -8).unwrap();
        assert_eq!(radio.parse_packet().unwrap(), 1);
        assert_eq!(radio.packet_rssi().unwrap(), 100 - 164);
        assert_eq!(radio.packet_snr().unwrap(), -2.0);
    }
}
