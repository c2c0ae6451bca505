//! Types shared between the probe framework and the probes feeding it.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Name/value pair attached to events for dimensional filtering.
///
/// Duplicate names are legal; consumers decide how to treat them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Kind of a discrete event, e.g. `TcpReset` or `PacketLoss`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct EventType(pub String);

impl EventType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discrete occurrence observed by a probe.
///
/// The framework only routes events: it is created by a probe and moved
/// into the sink, which becomes its sole owner.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Event {
    /// Unix timestamp in nanoseconds.
    pub timestamp: i64,
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub event_type: EventType,
    pub labels: Vec<Label>,
    pub message: String,
}

impl Event {
    pub fn new(timestamp: i64, event_type: impl Into<EventType>, message: impl Into<String>) -> Self {
        Self {
            timestamp,
            event_type: event_type.into(),
            labels: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = Label>) -> Self {
        self.labels.extend(labels);
        self
    }
}
