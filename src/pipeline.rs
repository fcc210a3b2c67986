//! ==============================================================================
//! pipeline.rs - packet to database record
//! ==============================================================================
//!
//! purpose:
//!     turns one drained radio packet into at most one database write:
//!
//!     bytes ──utf-8──► text ──json──► object ──node_id──► Reading ──gate──► write
//!
//!     every stage can reject the packet. a rejected packet is logged and
//!     dropped; it never reaches the database and never stops the loop.
//!
//! relationships:
//!     - uses: domain.rs (Packet, Reading, JsonKind), clock.rs (IntervalGate),
//!             firebase.rs (ReadingStore)
//!     - used by: gateway.rs
//!
//! ==============================================================================

use crate::clock::IntervalGate;
use crate::domain::{display_value, JsonKind, Packet, Reading, KNOWN_FIELDS, NODE_ID_KEY};
use crate::firebase::{ReadingStore, WriteError, WriteReceipt};

use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum PacketError {
    #[error("payload is not valid UTF-8 (valid up to byte {valid_up_to})")]
    Utf8 { valid_up_to: usize },
    #[error("deserializeJson() failed at byte {offset} (line {line}, column {column}): {message}")]
    Json {
        offset: usize,
        line: usize,
        column: usize,
        message: String,
    },
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(JsonKind),
    #[error("payload has no node_id")]
    MissingNodeId,
    #[error("node_id must be an integer, got {0}")]
    InvalidNodeId(JsonKind),
}

/// text and object stages
pub fn parse_object(payload: &[u8]) -> Result<Map<String, Value>, PacketError> {
    let text = std::str::from_utf8(payload).map_err(|e| PacketError::Utf8 {
        valid_up_to: e.valid_up_to(),
    })?;

    let value: Value = serde_json::from_str(text).map_err(|e| PacketError::Json {
        offset: byte_offset(text, e.line(), e.column()),
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(PacketError::NotAnObject(JsonKind::of(&other))),
    }
}

/// Takes `node_id` out of the object; what remains is the stored record.
pub fn split_node_id(mut fields: Map<String, Value>) -> Result<Reading, PacketError> {
    let raw = fields.remove(NODE_ID_KEY).ok_or(PacketError::MissingNodeId)?;
    let node_id = raw
        .as_i64()
        .ok_or_else(|| PacketError::InvalidNodeId(JsonKind::of(&raw)))?;
    Ok(Reading { node_id, fields })
}

pub fn decode(payload: &[u8]) -> Result<Reading, PacketError> {
    split_node_id(parse_object(payload)?)
}

/// zero-based byte offset for serde_json's 1-based line/column, clamped to the text
fn byte_offset(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len())
}

/// console listing of the fields we know about
fn describe(fields: &Map<String, Value>) {
    for key in KNOWN_FIELDS {
        if let Some(value) = fields.get(key) {
            info!(kind = %JsonKind::of(value), "{}: {}", key, display_value(value));
        }
    }
}

/// what one packet came to
#[derive(Debug)]
pub enum IngestOutcome {
    Stored(WriteReceipt),
    Dropped(PacketError),
    /// parsed, but the write interval had not elapsed
    Gated { node_id: i64 },
    WriteFailed(WriteError),
}

pub struct Pipeline {
    gate: Option<IntervalGate>,
    show_sensor_data: bool,
}

impl Pipeline {
    /// `write_interval_secs == 0` writes every parsed packet
    pub fn new(write_interval_secs: u64, show_sensor_data: bool) -> Self {
        let gate = (write_interval_secs > 0).then(|| IntervalGate::new(Duration::from_secs(write_interval_secs)));
        Self { gate, show_sensor_data }
    }

    pub fn write_interval(&self) -> Option<Duration> {
        self.gate.as_ref().map(IntervalGate::interval)
    }

    pub async fn ingest<S>(&mut self, packet: &Packet, store: &mut S) -> IngestOutcome
    where
        S: ReadingStore + ?Sized,
    {
        info!(
            size = packet.payload.len(),
            rssi = packet.rssi,
            snr = packet.snr,
            "LoRa Data: {}",
            String::from_utf8_lossy(&packet.payload)
        );

        let fields = match parse_object(&packet.payload) {
            Ok(fields) => fields,
            Err(e) => {
                match &e {
                    PacketError::Utf8 { .. } => warn!(error = %e, payload = %hex::encode(&packet.payload), "Dropping packet"),
                    _ => warn!(error = %e, "Dropping packet"),
                }
                return IngestOutcome::Dropped(e);
            }
        };

        if self.show_sensor_data {
            describe(&fields);
        }

        let reading = match split_node_id(fields) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Dropping packet");
                return IngestOutcome::Dropped(e);
            }
        };

        if let Some(gate) = self.gate.as_mut() {
            if !gate.run_every() {
                info!(node_id = reading.node_id, "Write interval not elapsed; reading discarded");
                return IngestOutcome::Gated { node_id: reading.node_id };
            }
        }

        match store.write(reading.node_id, &reading.fields).await {
            Ok(receipt) => {
                info!(path = %receipt.path, "PASSED");
                IngestOutcome::Stored(receipt)
            }
            Err(e) => {
                warn!(node_id = reading.node_id, error = %e, "FAILED");
                IngestOutcome::WriteFailed(e)
            }
        }
    }
}
