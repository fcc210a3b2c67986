//! ==============================================================================
//! network.rs - wi-fi bootstrap
//! ==============================================================================
//!
//! purpose:
//!     joins the configured access point before any database work and waits
//!     until the link reports connected. the wait is bounded: after
//!     `wifi.max_attempts` status polls the bootstrapper gives up and the
//!     caller decides what to do (the binary exits and lets systemd restart it).
//!
//! relationships:
//!     - used by: gateway.rs (bootstrap, reconnect after transport failures)
//!     - drives: nmcli / hostname subprocesses on the pi (NmcliLink)
//!
//! state machine:
//!
//!     Idle ──begin──► Connecting{attempt} ──status=connected──► Connected{ip}
//!                          │
//!                          └──attempt == max_attempts──► Failed{attempts}
//!
//! ==============================================================================

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// what the link layer reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Connecting,
    Disconnected,
    /// no wireless device or network manager not running
    Unavailable,
}

/// The platform's network interface.
#[async_trait]
pub trait NetworkLink: Send {
    /// start joining `ssid`; completion is observed through `status`
    async fn begin(&mut self, ssid: &str, password: &str) -> Result<()>;
    async fn status(&mut self) -> Result<LinkStatus>;
    async fn local_ip(&mut self) -> Option<IpAddr>;
}

// ==============================================================================
// nmcli - networkmanager on raspberry pi os (bookworm and later)
// ==============================================================================

pub struct NmcliLink;

impl NmcliLink {
    async fn run(program: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("{} error: {}", program, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl NetworkLink for NmcliLink {
    async fn begin(&mut self, ssid: &str, password: &str) -> Result<()> {
        let mut args = vec!["device", "wifi", "connect", ssid];
        if !password.is_empty() {
            args.extend(["password", password]);
        }
        let out = Self::run("nmcli", &args).await?;
        debug!(output = %out, "nmcli connect");
        Ok(())
    }

    async fn status(&mut self) -> Result<LinkStatus> {
        let out = Self::run("nmcli", &["-t", "-f", "STATE", "general"]).await?;
        Ok(parse_nm_state(&out))
    }

    async fn local_ip(&mut self) -> Option<IpAddr> {
        let out = Self::run("hostname", &["-I"]).await.ok()?;
        first_address(&out)
    }
}

/// `nmcli -t -f STATE general` output to a link status
pub fn parse_nm_state(output: &str) -> LinkStatus {
    let state = output.lines().next().unwrap_or("").trim();
    match state {
        // "connected (site only)" and "connected (local only)" have no route out
        "connected" => LinkStatus::Connected,
        s if s.starts_with("connecting") || s.starts_with("connected (") => LinkStatus::Connecting,
        "disconnected" | "disconnecting" | "asleep" => LinkStatus::Disconnected,
        _ => LinkStatus::Unavailable,
    }
}

/// first address of `hostname -I`
pub fn first_address(output: &str) -> Option<IpAddr> {
    output.split_whitespace().find_map(|word| word.parse().ok())
}

// ==============================================================================
// host - networking owned by the os (ethernet, systemd-networkd)
// ==============================================================================

pub struct HostLink;

#[async_trait]
impl NetworkLink for HostLink {
    async fn begin(&mut self, _ssid: &str, _password: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&mut self) -> Result<LinkStatus> {
        Ok(LinkStatus::Connected)
    }

    async fn local_ip(&mut self) -> Option<IpAddr> {
        // no packet is sent; connect only selects the outbound interface
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("1.1.1.1:80").await.ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }
}

// ==============================================================================
// bootstrapper
// ==============================================================================

/// status polls between console progress lines (3 s at the default poll interval)
const PROGRESS_EVERY: u32 = 10;

fn reports_progress(attempt: u32) -> bool {
    attempt == 1 || attempt % PROGRESS_EVERY == 0
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting { attempt: u32 },
    Connected { ip: Option<IpAddr> },
    Failed { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("WiFi '{ssid}' not connected after {attempts} status polls")]
    Exhausted { ssid: String, attempts: u32 },
}

pub struct WifiBootstrapper {
    link: Box<dyn NetworkLink>,
    ssid: String,
    password: String,
    poll_interval: Duration,
    max_attempts: u32,
    state: LinkState,
}

impl WifiBootstrapper {
    pub fn new(link: Box<dyn NetworkLink>, ssid: &str, password: &str, poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            link,
            ssid: ssid.to_string(),
            password: password.to_string(),
            poll_interval,
            max_attempts,
            state: LinkState::Idle,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Join the network and wait for the link. `max_attempts == 0` waits forever.
    pub async fn connect(&mut self) -> Result<Option<IpAddr>, NetworkError> {
        info!(ssid = %self.ssid, "Connecting to WiFi ..");
        if let Err(e) = self.link.begin(&self.ssid, &self.password).await {
            // the status polls below decide; nmcli may still finish the association
            warn!(error = %format!("{:#}", e), "WiFi begin reported an error");
        }

        let mut attempt: u32 = 1;
        loop {
            self.state = LinkState::Connecting { attempt };
            let status = match self.link.status().await {
                Ok(status) => status,
                Err(e) => {
                    debug!(error = %format!("{:#}", e), "link status unavailable");
                    LinkStatus::Unavailable
                }
            };

            if status == LinkStatus::Connected {
                let ip = self.link.local_ip().await;
                match ip {
                    Some(addr) => info!(ip = %addr, attempts = attempt, "WiFi connected"),
                    None => info!(attempts = attempt, "WiFi connected"),
                }
                self.state = LinkState::Connected { ip };
                return Ok(ip);
            }

            if reports_progress(attempt) {
                info!(attempt, ?status, "Still connecting to WiFi ..");
            } else {
                debug!(attempt, ?status, ".");
            }
            if self.max_attempts > 0 && attempt >= self.max_attempts {
                self.state = LinkState::Failed { attempts: attempt };
                return Err(NetworkError::Exhausted {
                    ssid: self.ssid.clone(),
                    attempts: attempt,
                });
            }

            attempt += 1;
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Reconnect only when the link has actually dropped.
    pub async fn ensure_connected(&mut self) -> Result<(), NetworkError> {
        if let Ok(LinkStatus::Connected) = self.link.status().await {
            return Ok(());
        }
        warn!(ssid = %self.ssid, "WiFi link lost; reconnecting");
        self.connect().await.map(|_| ())
    }
}

#[cfg(test)]
pub mod fake {
    //! scripted link for bootstrapper and gateway tests

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    pub struct LinkLog {
        pub begins: u32,
        pub status_polls: u32,
    }

    /// Replays `script` one status per poll; the last entry repeats.
    pub struct ScriptedLink {
        script: VecDeque<LinkStatus>,
        pub log: Arc<Mutex<LinkLog>>,
    }

    impl ScriptedLink {
        pub fn new(script: &[LinkStatus]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                log: Arc::new(Mutex::new(LinkLog::default())),
            }
        }
    }

    #[async_trait]
    impl NetworkLink for ScriptedLink {
        async fn begin(&mut self, _ssid: &str, _password: &str) -> Result<()> {
            self.log.lock().unwrap().begins += 1;
            Ok(())
        }

        async fn status(&mut self) -> Result<LinkStatus> {
            self.log.lock().unwrap().status_polls += 1;
            let status = if self.script.len() > 1 {
                self.script.pop_front()
            } else {
                self.script.front().copied()
            };
            Ok(status.unwrap_or(LinkStatus::Disconnected))
        }

        async fn local_ip(&mut self) -> Option<IpAddr> {
            "192.168.4.23".parse().ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedLink;
    use super::*;

    fn bootstrapper(link: ScriptedLink, max_attempts: u32) -> WifiBootstrapper {
        WifiBootstrapper::new(Box::new(link), "field-ap", "secret", Duration::ZERO, max_attempts)
    }

    #[tokio::test]
    async fn test_connects_after_a_few_polls() {
        let link = ScriptedLink::new(&[
            LinkStatus::Disconnected,
            LinkStatus::Connecting,
            LinkStatus::Connected,
        ]);
        let log = link.log.clone();
        let mut wifi = bootstrapper(link, 200);

        let ip = wifi.connect().await.unwrap();
        assert_eq!(ip, "192.168.4.23".parse().ok());
        assert_eq!(wifi.state(), &LinkState::Connected { ip });
        assert_eq!(log.lock().unwrap().begins, 1);
        assert_eq!(log.lock().unwrap().status_polls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let link = ScriptedLink::new(&[LinkStatus::Disconnected]);
        let log = link.log.clone();
        let mut wifi = bootstrapper(link, 4);

        match wifi.connect().await {
            Err(NetworkError::Exhausted { attempts, ssid }) => {
                assert_eq!(attempts, 4);
                assert_eq!(ssid, "field-ap");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(wifi.state(), &LinkState::Failed { attempts: 4 });
        assert_eq!(log.lock().unwrap().status_polls, 4);
    }

    #[tokio::test]
    async fn test_ensure_connected_skips_a_live_link() {
        let link = ScriptedLink::new(&[LinkStatus::Connected]);
        let log = link.log.clone();
        let mut wifi = bootstrapper(link, 3);

        wifi.ensure_connected().await.unwrap();
        assert_eq!(log.lock().unwrap().begins, 0);
        assert_eq!(wifi.state(), &LinkState::Idle);
    }

    #[tokio::test]
    async fn test_ensure_connected_rejoins_a_dropped_link() {
        let link = ScriptedLink::new(&[LinkStatus::Disconnected, LinkStatus::Connected]);
        let log = link.log.clone();
        let mut wifi = bootstrapper(link, 3);

        wifi.ensure_connected().await.unwrap();
        assert_eq!(log.lock().unwrap().begins, 1);
        assert!(matches!(wifi.state(), LinkState::Connected { .. }));
    }

    #[tokio::test]
    async fn test_host_link_is_always_up() {
        let mut link = HostLink;
        assert_eq!(link.status().await.unwrap(), LinkStatus::Connected);
    }

    #[test]
    fn test_progress_is_reported_while_waiting() {
        assert!(reports_progress(1));
        assert!(!reports_progress(2));
        assert!(!reports_progress(9));
        assert!(reports_progress(10));
        assert!(reports_progress(200));
        let lines = (1..=200).filter(|&a| reports_progress(a)).count();
        assert_eq!(lines, 21);
    }

    #[test]
    fn test_parse_nm_state() {
        assert_eq!(parse_nm_state("connected\n"), LinkStatus::Connected);
        assert_eq!(parse_nm_state("connecting"), LinkStatus::Connecting);
        assert_eq!(parse_nm_state("connected (site only)"), LinkStatus::Connecting);
        assert_eq!(parse_nm_state("disconnected"), LinkStatus::Disconnected);
        assert_eq!(parse_nm_state("asleep"), LinkStatus::Disconnected);
        assert_eq!(parse_nm_state(""), LinkStatus::Unavailable);
    }

    #[test]
    fn test_first_address() {
        assert_eq!(first_address("192.168.4.23 fd00::1 \n"), "192.168.4.23".parse().ok());
        assert_eq!(first_address(""), None);
    }
}
