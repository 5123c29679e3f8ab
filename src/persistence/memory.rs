use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{DurableRecord, MessageStore, StoreError};
use crate::broker::message::{Message, MessageId};
use crate::destination::Destination;
use crate::subscription::DurableKey;

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<Destination, Vec<Message>>,
    cursors: HashMap<DurableKey, u64>,
    durables: BTreeMap<DurableKey, DurableRecord>,
    held: HashMap<DurableKey, BTreeMap<u64, Message>>,
}

/// Process-local store. Nothing survives the process, but a broker rebuilt
/// on the same instance sees everything the previous one wrote.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MessageStore for MemoryStore {
    fn append(&self, destination: &Destination, message: &Message) -> Result<(), StoreError> {
        self.lock()
            .messages
            .entry(destination.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn remove(&self, destination: &Destination, id: &MessageId) -> Result<(), StoreError> {
        if let Some(log) = self.lock().messages.get_mut(destination) {
            log.retain(|m| &m.id != id);
        }
        Ok(())
    }

    fn load(&self, destination: &Destination) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .lock()
            .messages
            .get(destination)
            .cloned()
            .unwrap_or_default())
    }

    fn read_cursor(&self, key: &DurableKey) -> Result<Option<u64>, StoreError> {
        Ok(self.lock().cursors.get(key).copied())
    }

    fn write_cursor(&self, key: &DurableKey, cursor: u64) -> Result<(), StoreError> {
        self.lock().cursors.insert(key.clone(), cursor);
        Ok(())
    }

    fn save_durable(&self, record: &DurableRecord) -> Result<(), StoreError> {
        self.lock().durables.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn delete_durable(&self, key: &DurableKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.durables.remove(key);
        inner.cursors.remove(key);
        inner.held.remove(key);
        Ok(())
    }

    fn load_durables(&self) -> Result<Vec<DurableRecord>, StoreError> {
        Ok(self.lock().durables.values().cloned().collect())
    }

    fn hold(&self, key: &DurableKey, seq: u64, message: &Message) -> Result<(), StoreError> {
        self.lock()
            .held
            .entry(key.clone())
            .or_default()
            .insert(seq, message.clone());
        Ok(())
    }

    fn release(&self, key: &DurableKey, seq: u64) -> Result<(), StoreError> {
        if let Some(held) = self.lock().held.get_mut(key) {
            held.remove(&seq);
        }
        Ok(())
    }

    fn held(&self, key: &DurableKey) -> Result<Vec<(u64, Message)>, StoreError> {
        Ok(self
            .lock()
            .held
            .get(key)
            .map(|held| held.iter().map(|(seq, m)| (*seq, m.clone())).collect())
            .unwrap_or_default())
    }
}
