//! Persistence backed by `sled`
//!
//! Each destination gets a message log tree, keyed by a database generated id
//! so iteration yields append order. A single `message-index` tree maps
//! `destination NUL message-id` to the log key so acknowledged messages can be
//! removed directly. Durable subscriptions use three shared trees: records,
//! cursors, and held messages keyed by `client NUL name NUL sequence`.

use sled::{Db, Tree};

use super::{DurableRecord, MessageStore, StoreError};
use crate::broker::message::{Message, MessageId};
use crate::destination::Destination;
use crate::subscription::DurableKey;

const INDEX_TREE: &str = "message-index";
const DURABLE_TREE: &str = "durable-subscriptions";
const CURSOR_TREE: &str = "durable-cursors";
const HELD_TREE: &str = "durable-held";

#[derive(Clone)]
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open or create a sled database at `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Destination names always carry a `kind://` prefix, so they never
    /// collide with the fixed tree names above.
    fn log_tree(&self, destination: &Destination) -> Result<Tree, StoreError> {
        Ok(self.db.open_tree(destination.to_string())?)
    }

    fn index_key(destination: &Destination, id: &MessageId) -> Vec<u8> {
        format!("{destination}\u{0}{id}").into_bytes()
    }

    fn durable_key(key: &DurableKey) -> Vec<u8> {
        format!("{}\u{0}{}", key.client_id, key.name).into_bytes()
    }

    fn held_prefix(key: &DurableKey) -> Vec<u8> {
        let mut prefix = Self::durable_key(key);
        prefix.push(0);
        prefix
    }

    fn held_key(key: &DurableKey, seq: u64) -> Vec<u8> {
        let mut held = Self::held_prefix(key);
        held.extend_from_slice(&seq.to_be_bytes());
        held
    }
}

impl MessageStore for SledStore {
    fn append(&self, destination: &Destination, message: &Message) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(message)?;
        let log_key = self.db.generate_id()?.to_be_bytes();

        self.log_tree(destination)?.insert(log_key, serialized)?;
        self.db
            .open_tree(INDEX_TREE)?
            .insert(Self::index_key(destination, &message.id), &log_key[..])?;
        Ok(())
    }

    fn remove(&self, destination: &Destination, id: &MessageId) -> Result<(), StoreError> {
        let index = self.db.open_tree(INDEX_TREE)?;
        if let Some(log_key) = index.remove(Self::index_key(destination, id))? {
            self.log_tree(destination)?.remove(log_key)?;
        }
        Ok(())
    }

    fn load(&self, destination: &Destination) -> Result<Vec<Message>, StoreError> {
        let mut messages = Vec::new();
        for entry in self.log_tree(destination)?.iter() {
            let (_, value) = entry?;
            messages.push(serde_json::from_slice(&value)?);
        }
        Ok(messages)
    }

    fn read_cursor(&self, key: &DurableKey) -> Result<Option<u64>, StoreError> {
        let cursors = self.db.open_tree(CURSOR_TREE)?;
        match cursors.get(Self::durable_key(key))? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(key.to_string()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
        }
    }

    fn write_cursor(&self, key: &DurableKey, cursor: u64) -> Result<(), StoreError> {
        let cursors = self.db.open_tree(CURSOR_TREE)?;
        cursors.insert(Self::durable_key(key), &cursor.to_be_bytes()[..])?;
        Ok(())
    }

    fn save_durable(&self, record: &DurableRecord) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(record)?;
        self.db
            .open_tree(DURABLE_TREE)?
            .insert(Self::durable_key(&record.key), serialized)?;
        Ok(())
    }

    fn delete_durable(&self, key: &DurableKey) -> Result<(), StoreError> {
        self.db.open_tree(DURABLE_TREE)?.remove(Self::durable_key(key))?;
        self.db.open_tree(CURSOR_TREE)?.remove(Self::durable_key(key))?;
        let held = self.db.open_tree(HELD_TREE)?;
        let prefix = Self::held_prefix(key);
        for entry in held.scan_prefix(&prefix) {
            let (held_key, _) = entry?;
            if held_key.len() == prefix.len() + 8 {
                held.remove(held_key)?;
            }
        }
        Ok(())
    }

    fn load_durables(&self) -> Result<Vec<DurableRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.db.open_tree(DURABLE_TREE)?.iter() {
            let (_, value) = entry?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    fn hold(&self, key: &DurableKey, seq: u64, message: &Message) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec(message)?;
        self.db
            .open_tree(HELD_TREE)?
            .insert(Self::held_key(key, seq), serialized)?;
        Ok(())
    }

    fn release(&self, key: &DurableKey, seq: u64) -> Result<(), StoreError> {
        self.db.open_tree(HELD_TREE)?.remove(Self::held_key(key, seq))?;
        Ok(())
    }

    fn held(&self, key: &DurableKey) -> Result<Vec<(u64, Message)>, StoreError> {
        let prefix = Self::held_prefix(key);
        let mut held = Vec::new();
        for entry in self.db.open_tree(HELD_TREE)?.scan_prefix(&prefix) {
            let (held_key, value) = entry?;
            // a longer subscription name that shares this prefix
            let Ok(raw) = <[u8; 8]>::try_from(&held_key[prefix.len()..]) else {
                continue;
            };
            held.push((u64::from_be_bytes(raw), serde_json::from_slice(&value)?));
        }
        Ok(held)
    }
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
