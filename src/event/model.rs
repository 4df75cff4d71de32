//! Captured event types.
//!
//! An [`Event`] is immutable once built. Its derived serde representation is
//! the per-event wire format: stable field order, metadata in a `BTreeMap`,
//! RFC 3339 timestamps, kind and payload as adjacent `"kind"`/`"payload"` keys.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::panic::Location;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// The kind of a captured event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Marker,
    Bug,
    Exception,
    ZoneStart,
    ZoneStop,
    JsBridge,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::Marker => "marker",
            EventKind::Bug => "bug",
            EventKind::Exception => "exception",
            EventKind::ZoneStart => "zone_start",
            EventKind::ZoneStop => "zone_stop",
            EventKind::JsBridge => "js_bridge",
        };
        write!(f, "{name}")
    }
}

/// Where in the source a marker was placed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub file: String,
    pub class: String,
    pub method: String,
    pub line: u32,
}

impl CallSite {
    pub fn new(file: impl Into<String>, class: impl Into<String>, method: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            class: class.into(),
            method: method.into(),
            line,
        }
    }

    /// File and line of whoever called the `#[track_caller]` chain this is
    /// invoked from. Class and method are left empty.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: location.file().to_string(),
            line: location.line(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPayload {
    pub message: String,
    pub file: String,
    pub class: String,
    pub method: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BugPayload {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub name: String,
    pub reason: String,
    pub stack: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneStartPayload {
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStopPayload {
    pub zone: String,
    pub elapsed_ms: u64,
    /// Set when the zone was closed because its execution context ended
    pub auto_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsBridgePayload {
    pub action: String,
    pub args: Vec<String>,
}

/// Kind-specific part of an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    Marker(MarkerPayload),
    Bug(BugPayload),
    Exception(ExceptionPayload),
    ZoneStart(ZoneStartPayload),
    ZoneStop(ZoneStopPayload),
    JsBridge(JsBridgePayload),
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Marker(_) => EventKind::Marker,
            EventBody::Bug(_) => EventKind::Bug,
            EventBody::Exception(_) => EventKind::Exception,
            EventBody::ZoneStart(_) => EventKind::ZoneStart,
            EventBody::ZoneStop(_) => EventKind::ZoneStop,
            EventBody::JsBridge(_) => EventKind::JsBridge,
        }
    }
}

/// A text field that was cut to the configured maximum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Truncation {
    pub field: String,
    /// Length in characters before truncation
    pub original_len: usize,
}

/// A captured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Process-scoped, strictly increasing
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    /// Zones active at capture time, outermost first
    pub zones: Vec<String>,
    pub user_class: Option<String>,
    pub metadata: BTreeMap<String, String>,
    #[serde(flatten)]
    pub body: EventBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncated: Vec<Truncation>,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn is_truncated(&self) -> bool {
        !self.truncated.is_empty()
    }
}
