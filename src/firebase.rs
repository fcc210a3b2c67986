//! ==============================================================================
//! firebase.rs - Realtime Database client
//! ==============================================================================
//!
//! purpose:
//!     the remote side of the gateway. authenticates once at startup, derives
//!     the per-user prefix `/UsersData/{uid}/readings`, and writes one record
//!     per reading with a single PUT. no retry, no queue: a failed write is
//!     reported to the caller and the record is gone.
//!
//! relationships:
//!     - uses: auth.rs (sign in, token refresh), clock.rs (timestamps)
//!     - used by: gateway.rs (initialize), pipeline.rs (write)
//!
//! ==============================================================================

use crate::auth::{error_reason, IdentityClient, Session};
use crate::clock::EpochClock;
use crate::config::FirebaseConfig;
use crate::domain::{readings_root, record_path};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// where a record landed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteReceipt {
    pub path: String,
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("authentication failed after {attempts} attempts: {last_error}")]
    AuthExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database client not initialized")]
    NotInitialized,
    #[error("token refresh failed: {0}")]
    Auth(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("database rejected write ({status}): {reason}")]
    Rejected { status: u16, reason: String },
}

impl WriteError {
    /// the request never reached the database; the link may be down
    pub fn is_transport(&self) -> bool {
        matches!(self, WriteError::Transport(_))
    }
}

/// The storage side of the pipeline.
#[async_trait]
pub trait ReadingStore: Send {
    /// authenticate and resolve the user id; returns the uid
    async fn initialize(&mut self) -> Result<String, DatabaseError>;

    /// store `record` under `node-{node_id}/{now}`
    async fn write(&mut self, node_id: i64, record: &Map<String, Value>) -> Result<WriteReceipt, WriteError>;
}

pub struct FirebaseClient {
    http: reqwest::Client,
    identity: IdentityClient,
    clock: Box<dyn EpochClock>,
    config: FirebaseConfig,
    database_url: String,
    session: Option<Session>,
    readings_root: Option<String>,
}

impl FirebaseClient {
    pub fn new(config: &FirebaseConfig, clock: Box<dyn EpochClock>) -> Result<Self, DatabaseError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DatabaseError::Client(e.to_string()))?;

        let identity = IdentityClient::new(
            http.clone(),
            &config.api_key,
            &config.identity_url,
            &config.token_url,
            config.response_size,
        );

        Ok(Self {
            http,
            identity,
            clock,
            config: config.clone(),
            database_url: database_url(&config.database_endpoint),
            session: None,
            readings_root: None,
        })
    }

    #[cfg(test)]
    pub fn readings_root(&self) -> Option<&str> {
        self.readings_root.as_deref()
    }

    fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.config.auth_retry_delay_ms)
    }

    async fn sign_in(&self) -> Result<Session, DatabaseError> {
        let attempts = self.config.max_token_generation_retry.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self
                .identity
                .sign_in(&self.config.user_email, &self.config.user_password)
                .await
            {
                Ok(session) => {
                    info!(attempt, "token status: ready");
                    return Ok(session);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    warn!(attempt, max = attempts, error = %last_error, "token status: error");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }
        Err(DatabaseError::AuthExhausted { attempts, last_error })
    }

    /// Returns a usable ID token, refreshing it first when close to expiry.
    async fn fresh_token(&mut self) -> Result<String, WriteError> {
        let current = self.session.clone().ok_or(WriteError::NotInitialized)?;
        if !current.needs_refresh(Instant::now()) {
            return Ok(current.id_token);
        }

        let attempts = self.config.max_token_generation_retry.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.identity.refresh(&current).await {
                Ok(session) => {
                    info!(attempt, "token status: refreshed");
                    let token = session.id_token.clone();
                    self.session = Some(session);
                    return Ok(token);
                }
                Err(e) => {
                    last_error = format!("{:#}", e);
                    warn!(attempt, max = attempts, error = %last_error, "token status: refresh error");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }
        Err(WriteError::Auth(last_error))
    }
}

#[async_trait]
impl ReadingStore for FirebaseClient {
    async fn initialize(&mut self) -> Result<String, DatabaseError> {
        info!(
            database = %self.database_url,
            response_size = self.config.response_size,
            max_token_generation_retry = self.config.max_token_generation_retry,
            "Configuring database client"
        );

        match self.clock.sync().await {
            Ok(true) => {}
            Ok(false) => warn!("Clock not synchronized yet; records will use timestamp 0 until it is"),
            Err(e) => warn!(error = %format!("{:#}", e), "Time sync failed; records will use timestamp 0 until it succeeds"),
        }

        info!("Getting User UID");
        let session = self.sign_in().await?;
        let uid = session.uid.clone();
        info!(uid = %uid, "User UID");

        self.readings_root = Some(readings_root(&uid));
        self.session = Some(session);
        Ok(uid)
    }

    async fn write(&mut self, node_id: i64, record: &Map<String, Value>) -> Result<WriteReceipt, WriteError> {
        let root = self.readings_root.clone().ok_or(WriteError::NotInitialized)?;
        let token = self.fresh_token().await?;

        let timestamp = self.clock.epoch_seconds().await;
        if timestamp == 0 {
            warn!("Time not synchronized; writing with timestamp 0");
        }
        info!(time = timestamp, "time");

        let path = record_path(&root, node_id, timestamp);
        let url = format!("{}{}.json", self.database_url, path);

        let response = self
            .http
            .put(&url)
            .query(&[("auth", token.as_str())])
            .json(record)
            .send()
            .await
            .map_err(|e| WriteError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(WriteReceipt { path, timestamp });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            if let Some(session) = self.session.as_mut() {
                session.invalidate();
            }
        }
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected {
            status: status.as_u16(),
            reason: error_reason(&body, self.config.response_size),
        })
    }
}

/// `https://{host}` without a trailing slash; a scheme given in the config is kept
pub fn database_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

#[cfg(test)]
pub mod memory {
    //! in-memory store for pipeline and gateway tests

    use super::*;

    #[derive(Default)]
    pub struct MemoryStore {
        pub uid: String,
        pub timestamp: u64,
        pub fail_writes: bool,
        pub fail_with_transport: bool,
        pub records: Vec<(String, Map<String, Value>)>,
        pub initialized: bool,
        pub init_calls: u32,
    }

    impl MemoryStore {
        pub fn new(uid: &str, timestamp: u64) -> Self {
            Self {
                uid: uid.to_string(),
                timestamp,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ReadingStore for MemoryStore {
        async fn initialize(&mut self) -> Result<String, DatabaseError> {
            self.init_calls += 1;
            if self.uid.is_empty() {
                return Err(DatabaseError::AuthExhausted {
                    attempts: 5,
                    last_error: "INVALID_PASSWORD".to_string(),
                });
            }
            self.initialized = true;
            Ok(self.uid.clone())
        }

        async fn write(&mut self, node_id: i64, record: &Map<String, Value>) -> Result<WriteReceipt, WriteError> {
            if !self.initialized {
                return Err(WriteError::NotInitialized);
            }
            if self.fail_with_transport {
                return Err(WriteError::Transport("connection refused".to_string()));
            }
            if self.fail_writes {
                return Err(WriteError::Rejected {
                    status: 401,
                    reason: "Permission denied".to_string(),
                });
            }
            let path = record_path(&readings_root(&self.uid), node_id, self.timestamp);
            self.records.push((path.clone(), record.clone()));
            Ok(WriteReceipt {
                path,
                timestamp: self.timestamp,
            })
        }
    }
}
