use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::{ConnectionId, ProducerId};
use crate::destination::Destination;

/// Unique id of a produced message: the producer plus its send sequence.
///
/// Every concrete copy created by composite or wildcard fan-out shares the
/// id of the send that produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    pub producer: ProducerId,
    pub sequence: u64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    Persistent,
    #[default]
    NonPersistent,
}

/// A typed message property, as seen by selectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Represents a message moving through the broker.
///
/// Producers fill in `destination`, `payload`, `delivery_mode` and
/// `properties`. The broker assigns `id`, `timestamp` and
/// `producer_connection` on send, sets `original_destination` when the send
/// was addressed to a composite or wildcard name, and maintains
/// `redelivered` / `redelivery_counter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub destination: Destination,
    pub original_destination: Option<Destination>,
    pub delivery_mode: DeliveryMode,
    pub properties: Properties,
    pub payload: String,
    pub timestamp: i64,
    pub redelivered: bool,
    pub redelivery_counter: u32,
    pub producer_connection: Option<ConnectionId>,
}

impl Message {
    pub fn new(destination: Destination, payload: impl Into<String>) -> Self {
        Self {
            id: MessageId::default(),
            destination,
            original_destination: None,
            delivery_mode: DeliveryMode::default(),
            properties: Properties::new(),
            payload: payload.into(),
            timestamp: 0,
            redelivered: false,
            redelivery_counter: 0,
            producer_connection: None,
        }
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }

    /// Mark this copy as going back to `ready` after an unacknowledged delivery.
    pub(crate) fn mark_redelivered(&mut self) {
        self.redelivered = true;
        self.redelivery_counter += 1;
    }
}
