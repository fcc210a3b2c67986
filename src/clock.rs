//! ==============================================================================
//! clock.rs - wall clock for record timestamps, monotonic interval gate
//! ==============================================================================
//!
//! purpose:
//!     - EpochClock: seconds since the unix epoch for database paths.
//!       reports 0 while time is not synchronized; callers log and carry on.
//!     - NtpClock: single-server SNTP (rfc 4330) offset against the host clock.
//!     - IntervalGate: the `runEvery` debouncer used for interval-gated writes
//!       and periodic statistics.
//!
//! ==============================================================================

use crate::config::NtpConfig;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// seconds between 1900-01-01 (ntp era 0) and 1970-01-01
const NTP_UNIX_DELTA: u64 = 2_208_988_800;
const NTP_PORT: u16 = 123;
const NTP_PACKET_LEN: usize = 48;
/// LI = 0, VN = 3, Mode = 3 (client)
const NTP_CLIENT_HEADER: u8 = 0x1b;
const NTP_MODE_SERVER: u8 = 4;

/// 2016-01-01T00:00:00Z; anything earlier is an unset RTC
const PLAUSIBLE_EPOCH_SECS: u64 = 1_451_606_400;

#[async_trait]
pub trait EpochClock: Send + Sync {
    /// try to synchronize; Ok(true) when the clock is usable afterwards
    async fn sync(&mut self) -> Result<bool>;
    /// current unix time in seconds, 0 when unsynchronized
    async fn epoch_seconds(&mut self) -> u64;
}

pub fn system_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ==============================================================================
// interval gate (runEvery)
// ==============================================================================

/// Fires at most once per `interval` on the monotonic clock.
/// The first call always fires.
#[derive(Debug, Clone)]
pub struct IntervalGate {
    interval: Duration,
    last_fired: Option<Instant>,
}

impl IntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn run_every(&mut self) -> bool {
        self.run_every_at(Instant::now())
    }

    pub fn run_every_at(&mut self, now: Instant) -> bool {
        let due = match self.last_fired {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last_fired = Some(now);
        }
        due
    }
}

// ==============================================================================
// clocks
// ==============================================================================

/// Trusts the host clock (chrony / systemd-timesyncd) once it reads a plausible date.
pub struct SystemClock;

#[async_trait]
impl EpochClock for SystemClock {
    async fn sync(&mut self) -> Result<bool> {
        Ok(system_epoch_seconds() >= PLAUSIBLE_EPOCH_SECS)
    }

    async fn epoch_seconds(&mut self) -> u64 {
        let now = system_epoch_seconds();
        if now >= PLAUSIBLE_EPOCH_SECS {
            now
        } else {
            0
        }
    }
}

/// SNTP-corrected clock. Keeps the offset of the last good reply; while no reply
/// has been seen it answers 0 and retries at most once per resync interval.
pub struct NtpClock {
    server: String,
    timeout: Duration,
    offset_secs: Option<i64>,
    resync: IntervalGate,
}

impl NtpClock {
    pub fn new(config: &NtpConfig) -> Self {
        Self {
            server: config.server.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            offset_secs: None,
            resync: IntervalGate::new(Duration::from_secs(config.resync_interval_secs)),
        }
    }

    async fn query(&self) -> Result<u64> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.context("failed to bind SNTP socket")?;
        socket
            .connect((self.server.as_str(), NTP_PORT))
            .await
            .with_context(|| format!("failed to resolve NTP server {}", self.server))?;

        let mut request = [0u8; NTP_PACKET_LEN];
        request[0] = NTP_CLIENT_HEADER;
        socket.send(&request).await.context("failed to send SNTP request")?;

        let mut reply = [0u8; NTP_PACKET_LEN];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut reply))
            .await
            .context("SNTP request timed out")?
            .context("failed to receive SNTP reply")?;

        parse_sntp_reply(&reply[..len])
    }
}

/// unix seconds from an SNTP server reply
pub fn parse_sntp_reply(reply: &[u8]) -> Result<u64> {
    if reply.len() < NTP_PACKET_LEN {
        bail!("short SNTP reply ({} bytes)", reply.len());
    }
    let mode = reply[0] & 0x07;
    if mode != NTP_MODE_SERVER {
        bail!("unexpected SNTP mode {}", mode);
    }
    let stratum = reply[1];
    if stratum == 0 || stratum > 15 {
        // 0 is a kiss-o'-death, 16 is unsynchronized
        bail!("unusable SNTP stratum {}", stratum);
    }
    let transmit_secs = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]) as u64;
    if transmit_secs < NTP_UNIX_DELTA {
        bail!("SNTP transmit timestamp before 1970");
    }
    Ok(transmit_secs - NTP_UNIX_DELTA)
}

#[async_trait]
impl EpochClock for NtpClock {
    async fn sync(&mut self) -> Result<bool> {
        let server_secs = self.query().await?;
        let offset = server_secs as i64 - system_epoch_seconds() as i64;
        info!(server = %self.server, offset_secs = offset, "Time synchronized");
        self.offset_secs = Some(offset);
        Ok(true)
    }

    async fn epoch_seconds(&mut self) -> u64 {
        if self.offset_secs.is_none() && self.resync.run_every() {
            if let Err(e) = self.sync().await {
                debug!(error = %format!("{:#}", e), "SNTP resync failed");
            }
        }
        match self.offset_secs {
            Some(offset) => (system_epoch_seconds() as i64 + offset).max(0) as u64,
            None => 0,
        }
    }
}

#[cfg(test)]
pub struct FixedClock(pub u64);

#[cfg(test)]
#[async_trait]
impl EpochClock for FixedClock {
    async fn sync(&mut self) -> Result<bool> {
        Ok(self.0 != 0)
    }

    async fn epoch_seconds(&mut self) -> u64 {
        self.0
    }
}
