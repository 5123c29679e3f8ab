//! The `persistence` module defines the store the broker hands persistent
//! messages and durable subscriptions to.
//!
//! Queue messages are kept per destination until consumed. A durable
//! subscription is kept as a `DurableRecord`, its acknowledged cursor, and
//! the persistent messages it holds keyed by the subscription's own sequence.
//!
//! The broker calls the store synchronously and only relies on a read seeing
//! earlier writes from the same broker instance. Two implementations ship:
//! `MemoryStore` (the default) and `SledStore`, backed by the embedded `sled`
//! key-value database.

mod memory;
mod sled_store;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::broker::message::{Message, MessageId};
use crate::config::{PersistenceBackend, PersistenceSettings};
use crate::destination::Destination;
use crate::subscription::{ConsumerInfo, DurableKey};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Sled(#[from] sled::Error),

    #[error("failed to (de)serialize stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record under key '{0}'")]
    Corrupt(String),
}

/// What a durable subscription needs to be recreated after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableRecord {
    pub key: DurableKey,
    pub destination: Destination,
    pub selector: Option<String>,
    pub no_local: bool,
}

impl DurableRecord {
    pub fn new(key: DurableKey, info: &ConsumerInfo) -> Self {
        Self {
            key,
            destination: info.destination.clone(),
            selector: info.selector.clone(),
            no_local: info.no_local,
        }
    }

    /// Subscription attributes of the offline subscription.
    pub fn consumer_info(&self) -> ConsumerInfo {
        let mut info = ConsumerInfo::new(self.destination.clone()).durable(self.key.name.clone());
        info.selector = self.selector.clone();
        info.no_local = self.no_local;
        info
    }
}

pub trait MessageStore: Send + Sync + fmt::Debug {
    /// Append a persistent message to the destination's log.
    fn append(&self, destination: &Destination, message: &Message) -> Result<(), StoreError>;

    /// Remove an acknowledged message. Removing an unknown id is not an error.
    fn remove(&self, destination: &Destination, id: &MessageId) -> Result<(), StoreError>;

    /// All retained messages for the destination, in append order.
    fn load(&self, destination: &Destination) -> Result<Vec<Message>, StoreError>;

    fn read_cursor(&self, key: &DurableKey) -> Result<Option<u64>, StoreError>;

    fn write_cursor(&self, key: &DurableKey, cursor: u64) -> Result<(), StoreError>;

    /// Create or replace a durable subscription record.
    fn save_durable(&self, record: &DurableRecord) -> Result<(), StoreError>;

    /// Drop a durable subscription with its cursor and held messages.
    fn delete_durable(&self, key: &DurableKey) -> Result<(), StoreError>;

    fn load_durables(&self) -> Result<Vec<DurableRecord>, StoreError>;

    /// Keep a persistent message for a durable subscription under `seq`.
    fn hold(&self, key: &DurableKey, seq: u64, message: &Message) -> Result<(), StoreError>;

    /// Forget a held message. Releasing an unknown sequence is not an error.
    fn release(&self, key: &DurableKey, seq: u64) -> Result<(), StoreError>;

    /// Held messages in sequence order.
    fn held(&self, key: &DurableKey) -> Result<Vec<(u64, Message)>, StoreError>;
}

/// Open the store selected by configuration.
pub fn open_store(settings: &PersistenceSettings) -> Result<Arc<dyn MessageStore>, StoreError> {
    match settings.backend {
        PersistenceBackend::Memory => Ok(Arc::new(MemoryStore::default())),
        PersistenceBackend::Sled => Ok(Arc::new(SledStore::open(&settings.path)?)),
    }
}

#[cfg(test)]
mod tests;
