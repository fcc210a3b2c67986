//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer for the LoRa transceiver
//! ==============================================================================
//!
//! purpose:
//!     provides the four primitives the SX127x driver needs: a full-duplex SPI
//!     transfer, the reset line, the DIO0 level and a blocking delay.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using a register model).
//!
//! design:
//!     - "Compile Anywhere": without feature="hardware" the radio is backed by
//!       `MockBus`, an in-memory SX127x that answers register reads and lets
//!       packets be injected from tests or a dev harness.
//!     - On the Pi, `PiBus` owns the spidev handle and the GPIO pins for the
//!       lifetime of the process.
//!
//! relationships:
//!     - used by: radio.rs (register access)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

/// control lines wired to the transceiver, BCM numbering
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RadioPins {
    pub cs: u8,
    pub reset: u8,
    pub irq: u8,
}

pub trait RadioBus: Send {
    /// clock `data` out and return the bytes clocked in
    fn spi_transfer(&mut self, data: &[u8]) -> Result<Vec<u8>>;
    fn write_reset(&mut self, level: bool) -> Result<()>;
    fn irq_level(&mut self) -> Result<bool>;
    fn delay_ms(&mut self, ms: u64);
}

#[cfg(feature = "hardware")]
pub type PlatformBus = PiBus;
#[cfg(not(feature = "hardware"))]
pub type PlatformBus = MockBus;

/// silicon revision reported by a healthy SX1276
pub const SX1276_VERSION: u8 = 0x12;

// ==============================================================================================
// MOCK IMPLEMENTATION (register model of an SX1276)
// ==============================================================================================

#[cfg(any(test, not(feature = "hardware")))]
pub use mock::MockBus;

#[cfg(any(test, not(feature = "hardware")))]
mod mock {
    use super::{RadioBus, SX1276_VERSION};
    use anyhow::{anyhow, Result};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const REG_FIFO: u8 = 0x00;
    const REG_OP_MODE: u8 = 0x01;
    const REG_FIFO_ADDR_PTR: u8 = 0x0d;
    const REG_FIFO_RX_CURRENT_ADDR: u8 = 0x10;
    const REG_IRQ_FLAGS: u8 = 0x12;
    const REG_RX_NB_BYTES: u8 = 0x13;
    const REG_PKT_SNR_VALUE: u8 = 0x19;
    const REG_PKT_RSSI_VALUE: u8 = 0x1a;
    const REG_SYNC_WORD: u8 = 0x39;
    const REG_VERSION: u8 = 0x42;

    const MODE_MASK: u8 = 0x07;
    const MODE_STDBY: u8 = 0x01;
    const MODE_RX_CONTINUOUS: u8 = 0x05;
    const MODE_RX_SINGLE: u8 = 0x06;
    const IRQ_PAYLOAD_CRC_ERROR: u8 = 0x20;
    const IRQ_RX_DONE: u8 = 0x40;
    const IRQ_RX_TIMEOUT: u8 = 0x80;

    /// a packet waiting "on air" for the mock receiver
    #[derive(Clone, Debug)]
    struct AirPacket {
        sync_word: u8,
        payload: Vec<u8>,
        rssi_raw: u8,
        snr_raw: i8,
        crc_error: bool,
    }

    #[derive(Debug)]
    struct MockRegisters {
        regs: [u8; 0x80],
        fifo: [u8; 256],
        air: VecDeque<AirPacket>,
        reset_level: bool,
        reset_pulses: u32,
    }

    impl MockRegisters {
        fn new(version: u8) -> Self {
            let mut regs = [0u8; 0x80];
            regs[REG_VERSION as usize] = version;
            regs[REG_SYNC_WORD as usize] = 0x12; // chip default
            Self {
                regs,
                fifo: [0u8; 256],
                air: VecDeque::new(),
                reset_level: true,
                reset_pulses: 0,
            }
        }

        fn receiving(&self) -> bool {
            matches!(self.regs[REG_OP_MODE as usize] & MODE_MASK, MODE_RX_SINGLE | MODE_RX_CONTINUOUS)
        }

        /// latch the next matching packet into the fifo, like the modem does on RxDone
        fn deliver(&mut self) {
            if !self.receiving() || self.regs[REG_IRQ_FLAGS as usize] & IRQ_RX_DONE != 0 {
                return;
            }
            let sync_word = self.regs[REG_SYNC_WORD as usize];
            while let Some(packet) = self.air.pop_front() {
                if packet.sync_word != sync_word {
                    continue;
                }
                let len = packet.payload.len().min(255);
                self.fifo[..len].copy_from_slice(&packet.payload[..len]);
                self.regs[REG_FIFO_RX_CURRENT_ADDR as usize] = 0;
                self.regs[REG_RX_NB_BYTES as usize] = len as u8;
                self.regs[REG_PKT_RSSI_VALUE as usize] = packet.rssi_raw;
                self.regs[REG_PKT_SNR_VALUE as usize] = packet.snr_raw as u8;
                let mut flags = IRQ_RX_DONE;
                if packet.crc_error {
                    flags |= IRQ_PAYLOAD_CRC_ERROR;
                }
                self.regs[REG_IRQ_FLAGS as usize] |= flags;
                // single receive drops back to standby once a packet is latched
                if self.regs[REG_OP_MODE as usize] & MODE_MASK == MODE_RX_SINGLE {
                    self.regs[REG_OP_MODE as usize] = (self.regs[REG_OP_MODE as usize] & !MODE_MASK) | MODE_STDBY;
                }
                return;
            }
        }

        fn read(&mut self, addr: u8) -> u8 {
            match addr {
                REG_FIFO => {
                    let ptr = self.regs[REG_FIFO_ADDR_PTR as usize];
                    self.regs[REG_FIFO_ADDR_PTR as usize] = ptr.wrapping_add(1);
                    self.fifo[ptr as usize]
                }
                _ => self.regs[addr as usize],
            }
        }

        fn write(&mut self, addr: u8, value: u8) {
            match addr {
                REG_FIFO => {
                    let ptr = self.regs[REG_FIFO_ADDR_PTR as usize];
                    self.fifo[ptr as usize] = value;
                    self.regs[REG_FIFO_ADDR_PTR as usize] = ptr.wrapping_add(1);
                }
                // write-one-to-clear
                REG_IRQ_FLAGS => self.regs[addr as usize] &= !value,
                REG_VERSION | REG_RX_NB_BYTES | REG_FIFO_RX_CURRENT_ADDR => {}
                _ => self.regs[addr as usize] = value,
            }
            if addr == REG_OP_MODE {
                self.deliver();
            }
        }
    }

    /// In-memory SX1276. Clones share the same register file, so a test can keep
    /// one handle to inject packets while the driver owns the other.
    #[derive(Clone, Debug)]
    pub struct MockBus {
        state: Arc<Mutex<MockRegisters>>,
    }

    impl MockBus {
        /// a bus with a responsive transceiver
        pub fn new() -> Self {
            Self::with_version(SX1276_VERSION)
        }

        /// a bus where nothing answers on the version register
        pub fn absent() -> Self {
            Self::with_version(0x00)
        }

        fn with_version(version: u8) -> Self {
            tracing::info!("Using MOCK radio bus (No hardware access)");
            Self {
                state: Arc::new(Mutex::new(MockRegisters::new(version))),
            }
        }

        #[cfg(not(feature = "hardware"))]
        pub fn open(pins: super::RadioPins, _spi_clock_hz: u32) -> Result<Self> {
            tracing::debug!(?pins, "[MOCK] Radio pins assigned");
            Ok(Self::new())
        }

        fn with_state<T>(&self, f: impl FnOnce(&mut MockRegisters) -> T) -> Result<T> {
            let mut guard = self.state.lock().map_err(|_| anyhow!("mock register file poisoned"))?;
            Ok(f(&mut guard))
        }

        /// queue a packet transmitted with `sync_word`; `rssi_raw` is the PktRssiValue register
        pub fn transmit(&self, sync_word: u8, payload: &[u8], rssi_raw: u8, snr_raw: i8) -> Result<()> {
            self.queue(AirPacket {
                sync_word,
                payload: payload.to_vec(),
                rssi_raw,
                snr_raw,
                crc_error: false,
            })
        }

        /// queue a packet that arrives with a payload CRC error
        pub fn transmit_corrupted(&self, sync_word: u8, payload: &[u8]) -> Result<()> {
            self.queue(AirPacket {
                sync_word,
                payload: payload.to_vec(),
                rssi_raw: 40,
                snr_raw: -20,
                crc_error: true,
            })
        }

        fn queue(&self, packet: AirPacket) -> Result<()> {
            self.with_state(|regs| {
                regs.air.push_back(packet);
                regs.deliver();
            })
        }

        /// symbol timeout in single receive: RxTimeout is raised and the chip drops to standby
        pub fn rx_timeout(&self) -> Result<()> {
            self.with_state(|regs| {
                let mode = regs.regs[REG_OP_MODE as usize];
                if mode & MODE_MASK == MODE_RX_SINGLE {
                    regs.regs[REG_IRQ_FLAGS as usize] |= IRQ_RX_TIMEOUT;
                    regs.regs[REG_OP_MODE as usize] = (mode & !MODE_MASK) | MODE_STDBY;
                }
            })
        }

        pub fn register(&self, addr: u8) -> Result<u8> {
            self.with_state(|regs| regs.regs[(addr & 0x7f) as usize])
        }

        pub fn reset_pulses(&self) -> Result<u32> {
            self.with_state(|regs| regs.reset_pulses)
        }
    }

    impl Default for MockBus {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RadioBus for MockBus {
        fn spi_transfer(&mut self, data: &[u8]) -> Result<Vec<u8>> {
            let (&first, rest) = data.split_first().ok_or_else(|| anyhow!("empty SPI frame"))?;
            self.with_state(|regs| {
                let addr = first & 0x7f;
                let mut out = vec![0u8; data.len()];
                for (i, byte) in rest.iter().enumerate() {
                    // burst access only auto-increments outside the fifo
                    let target = if addr == REG_FIFO { addr } else { addr.wrapping_add(i as u8) & 0x7f };
                    if first & 0x80 != 0 {
                        regs.write(target, *byte);
                    } else {
                        out[i + 1] = regs.read(target);
                    }
                }
                out
            })
        }

        fn write_reset(&mut self, level: bool) -> Result<()> {
            self.with_state(|regs| {
                if !regs.reset_level && level {
                    // rising edge ends a reset pulse; registers return to defaults
                    regs.reset_pulses += 1;
                    let version = regs.regs[REG_VERSION as usize];
                    regs.regs = MockRegisters::new(version).regs;
                }
                regs.reset_level = level;
            })
        }

        fn irq_level(&mut self) -> Result<bool> {
            self.with_state(|regs| regs.regs[REG_IRQ_FLAGS as usize] & IRQ_RX_DONE != 0)
        }

        fn delay_ms(&mut self, _ms: u64) {}
    }

}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================

#[cfg(feature = "hardware")]
pub struct PiBus {
    spi: rppal::spi::Spi,
    /// present when chip select is not one of the kernel-driven CE lines
    cs: Option<rppal::gpio::OutputPin>,
    reset: rppal::gpio::OutputPin,
    irq: rppal::gpio::InputPin,
}

#[cfg(feature = "hardware")]
impl PiBus {
    pub fn open(pins: RadioPins, spi_clock_hz: u32) -> Result<Self> {
        use rppal::gpio::Gpio;
        use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

        tracing::info!(?pins, spi_clock_hz, "Using REAL HARDWARE radio bus (rppal)");

        // CE0 is BCM 8, CE1 is BCM 7
        let (slave, manual_cs) = match pins.cs {
            8 => (SlaveSelect::Ss0, false),
            7 => (SlaveSelect::Ss1, false),
            _ => (SlaveSelect::Ss0, true),
        };
        let spi = Spi::new(Bus::Spi0, slave, spi_clock_hz, Mode::Mode0)?;

        let gpio = Gpio::new()?;
        let cs = if manual_cs {
            let mut pin = gpio.get(pins.cs)?.into_output();
            pin.set_high();
            Some(pin)
        } else {
            None
        };
        let mut reset = gpio.get(pins.reset)?.into_output();
        reset.set_high();
        let irq = gpio.get(pins.irq)?.into_input();

        Ok(Self { spi, cs, reset, irq })
    }
}

#[cfg(feature = "hardware")]
impl RadioBus for PiBus {
    fn spi_transfer(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut read_buf = vec![0u8; data.len()];
        if let Some(cs) = self.cs.as_mut() {
            cs.set_low();
        }
        let result = self.spi.transfer(&mut read_buf, data);
        if let Some(cs) = self.cs.as_mut() {
            cs.set_high();
        }
        result?;
        tracing::trace!(tx = %hex::encode(data), rx = %hex::encode(&read_buf), "spi");
        Ok(read_buf)
    }

    fn write_reset(&mut self, level: bool) -> Result<()> {
        if level {
            self.reset.set_high();
        } else {
            self.reset.set_low();
        }
        Ok(())
    }

    fn irq_level(&mut self) -> Result<bool> {
        Ok(self.irq.is_high())
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }
}
