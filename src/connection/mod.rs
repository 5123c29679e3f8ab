//! The `connection` module models the ownership tree of client state.
//!
//! A connection owns sessions and the temporary destinations it created; a
//! session owns producers and consumers. Closing walks this tree
//! deterministically (sessions in id order, consumers in id order), see
//! `Broker::close_connection`.

mod ids;

use std::collections::{BTreeMap, BTreeSet};

pub use ids::{ConnectionId, ConsumerId, ProducerId, SessionId};

use crate::destination::Destination;

/// Attributes supplied when a connection is opened.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    /// Required for durable subscriptions; unique across live connections.
    pub client_id: Option<String>,
}

impl ConnectionInfo {
    pub fn with_client_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Connection {
    pub id: ConnectionId,
    pub client_id: Option<String>,
    pub sessions: BTreeMap<u64, Session>,
    pub temp_destinations: BTreeSet<Destination>,
    next_session: u64,
    next_temp: u64,
}

impl Connection {
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            id: ConnectionId::generate(),
            client_id: info.client_id,
            sessions: BTreeMap::new(),
            temp_destinations: BTreeSet::new(),
            next_session: 0,
            next_temp: 0,
        }
    }

    pub fn open_session(&mut self) -> SessionId {
        self.next_session += 1;
        let id = SessionId {
            connection: self.id.clone(),
            value: self.next_session,
        };
        self.sessions.insert(id.value, Session::new(id.clone()));
        id
    }

    /// Name a new temporary destination after this connection.
    pub fn next_temp_name(&mut self) -> String {
        self.next_temp += 1;
        format!("{}:{}", self.id, self.next_temp)
    }
}

#[derive(Debug)]
pub(crate) struct Session {
    pub id: SessionId,
    pub producers: BTreeMap<u64, Producer>,
    pub consumers: BTreeSet<ConsumerId>,
    next_producer: u64,
    next_consumer: u64,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            producers: BTreeMap::new(),
            consumers: BTreeSet::new(),
            next_producer: 0,
            next_consumer: 0,
        }
    }

    pub fn add_producer(&mut self, destination: Option<Destination>) -> ProducerId {
        self.next_producer += 1;
        let id = ProducerId {
            session: self.id.clone(),
            value: self.next_producer,
        };
        self.producers.insert(
            id.value,
            Producer {
                destination,
                next_sequence: 0,
            },
        );
        id
    }

    /// Reserve a consumer id. The caller registers it once attach succeeds.
    pub fn next_consumer_id(&mut self) -> ConsumerId {
        self.next_consumer += 1;
        ConsumerId {
            session: self.id.clone(),
            value: self.next_consumer,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Producer {
    pub destination: Option<Destination>,
    next_sequence: u64,
}

impl Producer {
    pub fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

#[cfg(test)]
mod tests;
