//! # RelayMQ
//!
//! `relaymq` is the distribution core of a message broker: it decides which
//! consumer receives each message, tracks what every consumer has in flight,
//! and redelivers whatever a departing consumer left unacknowledged.
//!
//! ## Core Modules
//!
//! - `broker`: The `Broker` command intake plus queue and topic dispatch,
//!   acknowledgment processing and teardown.
//! - `config`: Loads broker, persistence and logging settings.
//! - `connection`: Identifiers and the connection → session → producer /
//!   consumer ownership tree.
//! - `destination`: Destination names, composite and wildcard resolution.
//! - `persistence`: The message store for persistent queue messages and
//!   durable-subscription cursors (in memory or `sled`).
//! - `selector`: Message selector validation and evaluation.
//! - `service`: Runs a `Broker` on a tokio task behind a cloneable handle.
//! - `subscription`: Consumer attributes, prefetch windows and durable
//!   subscriptions.
//! - `utils`: Error types and logging setup.
//!
//! ## Example
//!
//! ```
//! use relaymq::broker::message::Message;
//! use relaymq::broker::{Broker, MessageAck};
//! use relaymq::connection::ConnectionInfo;
//! use relaymq::destination::Destination;
//! use relaymq::subscription::ConsumerInfo;
//!
//! let mut broker = Broker::default();
//! let connection = broker.open_connection(ConnectionInfo::default()).unwrap();
//! let session = broker.open_session(&connection).unwrap();
//! let producer = broker.add_producer(&session, None).unwrap();
//!
//! let queue = Destination::queue("ORDERS");
//! let (sink, mut deliveries) = tokio::sync::mpsc::unbounded_channel();
//! broker
//!     .add_consumer(&session, ConsumerInfo::new(queue.clone()).with_prefetch(1), sink)
//!     .unwrap();
//!
//! broker.send(&producer, Message::new(queue.clone(), "first")).unwrap();
//! let dispatch = deliveries.try_recv().unwrap();
//! broker.acknowledge(MessageAck::standard(&dispatch)).unwrap();
//! assert_eq!(broker.queue_depth(&queue), 0);
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod destination;
pub mod persistence;
pub mod selector;
pub mod service;
pub mod subscription;
pub mod utils;

pub use broker::{AckKind, Broker, DestinationStats, MessageAck};
pub use service::{BrokerHandle, BrokerService};
pub use utils::BrokerError;
