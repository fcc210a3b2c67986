//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `gateway.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - WifiConfig: network name, passphrase, join polling.
//!     - FirebaseConfig: api key, database endpoint, service account.
//!     - NtpConfig: time server used for record timestamps.
//!     - RadioConfig: SX127x pins, carrier frequency, sync word.
//!     - PipelineConfig: optional write interval (runEvery gating).
//!     - LoggingConfig: log level and console verbosity.
//!
//! credentials:
//!     the six credential fields default to values baked in at build time
//!     (`WIFI_SSID=... cargo build`) and are overridden by the same variable
//!     names at runtime.
//!
//! ==============================================================================

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub wifi: WifiConfig,
    pub firebase: FirebaseConfig,
    pub ntp: NtpConfig,
    pub radio: RadioConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WifiConfig {
    /// false when the host network is managed elsewhere (ethernet, systemd-networkd)
    pub enabled: bool,
    pub ssid: String,
    pub password: String,
    pub poll_interval_ms: u64,
    /// 0 = keep polling forever
    pub max_attempts: u32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FirebaseConfig {
    pub api_key: String,
    /// bare host, e.g. "my-project-default-rtdb.firebaseio.com"
    pub database_endpoint: String,
    pub user_email: String,
    pub user_password: String,
    pub response_size: usize,
    pub max_token_generation_retry: u32,
    pub auth_retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub reconnect_network: bool,
    pub identity_url: String,
    pub token_url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NtpConfig {
    pub enabled: bool,
    pub server: String,
    pub timeout_ms: u64,
    pub resync_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RadioConfig {
    pub frequency_hz: u64,
    pub cs_pin: u8,
    pub reset_pin: u8,
    pub irq_pin: u8,
    pub spi_clock_hz: u32,
    pub sync_word: u8,
    pub begin_attempts: u32,
    pub begin_retry_delay_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct PipelineConfig {
    /// 0 = write every parsed packet
    pub write_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
    /// 0 = never
    pub stats_interval_secs: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ssid: option_env!("WIFI_SSID").unwrap_or_default().to_string(),
            password: option_env!("WIFI_PWD").unwrap_or_default().to_string(),
            poll_interval_ms: 300,
            max_attempts: 200,
        }
    }
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            api_key: option_env!("FIREBASE_API_KEY").unwrap_or_default().to_string(),
            database_endpoint: option_env!("FIREBASE_DB_ENDPOINT").unwrap_or_default().to_string(),
            user_email: option_env!("FIREBASE_USER_EMAIL").unwrap_or_default().to_string(),
            user_password: option_env!("FIREBASE_USER_PWD").unwrap_or_default().to_string(),
            response_size: 4096,
            max_token_generation_retry: 5,
            auth_retry_delay_ms: 1000,
            request_timeout_secs: 15,
            reconnect_network: true,
            identity_url: "https://identitytoolkit.googleapis.com/v1".to_string(),
            token_url: "https://securetoken.googleapis.com/v1".to_string(),
        }
    }
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "pool.ntp.org".to_string(),
            timeout_ms: 2000,
            resync_interval_secs: 60,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 915_000_000,
            cs_pin: 8,
            reset_pin: 25,
            irq_pin: 24,
            spi_clock_hz: 8_000_000,
            sync_word: 0xF3,
            begin_attempts: 15,
            begin_retry_delay_ms: 500,
            poll_interval_ms: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_sensor_data: true,
            stats_interval_secs: 300,
        }
    }
}

/// SX1276/77/78/79 synthesizer range
const MIN_FREQUENCY_HZ: u64 = 137_000_000;
const MAX_FREQUENCY_HZ: u64 = 1_020_000_000;

impl GatewayConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: GatewayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load with default fallback, then apply environment overrides
    pub fn load_or_default() -> Self {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var("GATEWAY_CONFIG") {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("gateway.toml"));
        paths.push(PathBuf::from("..").join("config").join("gateway.toml"));

        let mut loaded = None;
        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        loaded = Some(config);
                        break;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: {:#}", e);
                    }
                }
            }
        }

        let mut config = loaded.unwrap_or_else(|| {
            println!("[CONFIG] Warning: No config file found - using defaults");
            Self::default()
        });
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Runtime credential overrides. `lookup` is `std::env::var` outside of tests.
    /// Returns the variables that were applied; runs before logging is set up,
    /// so each one is reported on the console.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();
        let slots: [(&'static str, &mut String); 6] = [
            ("WIFI_SSID", &mut self.wifi.ssid),
            ("WIFI_PWD", &mut self.wifi.password),
            ("FIREBASE_API_KEY", &mut self.firebase.api_key),
            ("FIREBASE_DB_ENDPOINT", &mut self.firebase.database_endpoint),
            ("FIREBASE_USER_EMAIL", &mut self.firebase.user_email),
            ("FIREBASE_USER_PWD", &mut self.firebase.user_password),
        ];
        for (key, slot) in slots {
            if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                println!("[CONFIG] Using {} from environment", key);
                *slot = value;
                applied.push(key);
            }
        }
        applied
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.wifi.enabled && self.wifi.ssid.is_empty() {
            bail!("wifi.ssid is empty (set it in gateway.toml or WIFI_SSID)");
        }

        if self.firebase.api_key.is_empty() {
            bail!("firebase.api_key is empty (set it in gateway.toml or FIREBASE_API_KEY)");
        }
        if self.firebase.database_endpoint.is_empty() {
            bail!("firebase.database_endpoint is empty (set it in gateway.toml or FIREBASE_DB_ENDPOINT)");
        }
        if self.firebase.database_endpoint.starts_with("http://") {
            bail!(
                "Invalid database endpoint: {} (the realtime database only accepts https)",
                self.firebase.database_endpoint
            );
        }
        if self.firebase.user_email.is_empty() || self.firebase.user_password.is_empty() {
            bail!("firebase.user_email and firebase.user_password are required");
        }
        if self.firebase.max_token_generation_retry == 0 {
            bail!("firebase.max_token_generation_retry must be greater than 0");
        }
        if self.firebase.response_size == 0 {
            bail!("firebase.response_size must be greater than 0");
        }
        for url in [&self.firebase.identity_url, &self.firebase.token_url] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                bail!("Invalid auth URL: {} (must start with http:// or https://)", url);
            }
        }

        if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&self.radio.frequency_hz) {
            bail!(
                "Invalid radio frequency: {} Hz (must be within {}..={} Hz)",
                self.radio.frequency_hz,
                MIN_FREQUENCY_HZ,
                MAX_FREQUENCY_HZ
            );
        }
        if self.radio.begin_attempts == 0 {
            bail!("radio.begin_attempts must be greater than 0");
        }
        let pins = [self.radio.cs_pin, self.radio.reset_pin, self.radio.irq_pin];
        if pins[0] == pins[1] || pins[0] == pins[2] || pins[1] == pins[2] {
            bail!("radio cs/reset/irq pins must be distinct, got {:?}", pins);
        }

        if self.ntp.enabled && self.ntp.server.is_empty() {
            bail!("ntp.server is empty");
        }

        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│          GATEWAY CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ WiFi: {} (enabled: {})", self.wifi.ssid, self.wifi.enabled);
        println!("│ Database: {}", self.firebase.database_endpoint);
        println!("│ Account: {}", self.firebase.user_email);
        println!("│ Radio: {:.1} MHz, sync word 0x{:02X}", self.radio.frequency_hz as f64 / 1e6, self.radio.sync_word);
        println!(
            "│ Pins: cs={} reset={} irq={}",
            self.radio.cs_pin, self.radio.reset_pin, self.radio.irq_pin
        );
        match self.pipeline.write_interval_secs {
            0 => println!("│ Writes: every packet"),
            secs => println!("│ Writes: at most one every {}s", secs),
        }
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
