use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// field that identifies the transmitting node; encoded in the storage path
pub const NODE_ID_KEY: &str = "node_id";

/// fields printed to the console when present, in this order
pub const KNOWN_FIELDS: [&str; 5] = [NODE_ID_KEY, "humidity", "temperature", "wind_speed", "water_level"];

/// one packet as drained from the radio fifo
#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub payload: Vec<u8>,
    /// dBm
    pub rssi: i16,
    /// dB
    pub snr: f32,
}

/// a decoded sensor reading
///
/// `fields` never contains `node_id`; it is exactly the object that gets stored.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub node_id: i64,
    pub fields: Map<String, Value>,
}

/// closed set of json value kinds, used when describing fields on the console
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Int,
    Float,
    Bool,
    Object,
    Array,
    Null,
}

impl JsonKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => JsonKind::String,
            Value::Number(n) if n.is_f64() => JsonKind::Float,
            Value::Number(_) => JsonKind::Int,
            Value::Bool(_) => JsonKind::Bool,
            Value::Object(_) => JsonKind::Object,
            Value::Array(_) => JsonKind::Array,
            Value::Null => JsonKind::Null,
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonKind::String => "string",
            JsonKind::Int => "int",
            JsonKind::Float => "float",
            JsonKind::Bool => "bool",
            JsonKind::Object => "object",
            JsonKind::Array => "array",
            JsonKind::Null => "null",
        };
        f.write_str(name)
    }
}

/// render a value for the console, strings without their quotes
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `/UsersData/{uid}/readings`
pub fn readings_root(uid: &str) -> String {
    format!("/UsersData/{}/readings", uid)
}

/// `{root}/node-{node_id}/{timestamp}`
pub fn record_path(root: &str, node_id: i64, timestamp: u64) -> String {
    format!("{}/node-{}/{}", root, node_id, timestamp)
}
