use super::{DurableRecord, MemoryStore, MessageStore, SledStore};
use crate::broker::message::{DeliveryMode, Message, MessageId};
use crate::destination::Destination;
use crate::subscription::{ConsumerInfo, DurableKey};

use tempfile::tempdir;

fn message(sequence: u64, payload: &str) -> Message {
    let mut message = Message::new(Destination::queue("TEST"), payload)
        .with_delivery_mode(DeliveryMode::Persistent);
    message.id = MessageId {
        sequence,
        ..MessageId::default()
    };
    message
}

fn exercise_store(store: &dyn MessageStore) {
    let queue = Destination::queue("TEST");
    let other = Destination::queue("OTHER");

    store.append(&queue, &message(1, "one")).unwrap();
    store.append(&queue, &message(2, "two")).unwrap();
    store.append(&queue, &message(3, "three")).unwrap();

    let payloads: Vec<_> = store
        .load(&queue)
        .unwrap()
        .into_iter()
        .map(|m| m.payload)
        .collect();
    assert_eq!(payloads, vec!["one", "two", "three"]);
    assert!(store.load(&other).unwrap().is_empty());

    store.remove(&queue, &message(2, "").id).unwrap();
    // removing twice, or an unknown id, is a no-op
    store.remove(&queue, &message(2, "").id).unwrap();
    store.remove(&other, &message(9, "").id).unwrap();

    let payloads: Vec<_> = store
        .load(&queue)
        .unwrap()
        .into_iter()
        .map(|m| m.payload)
        .collect();
    assert_eq!(payloads, vec!["one", "three"]);

    let key = DurableKey::new("clientA", "test");
    assert_eq!(store.read_cursor(&key).unwrap(), None);
    store.write_cursor(&key, 7).unwrap();
    store.write_cursor(&key, 9).unwrap();
    assert_eq!(store.read_cursor(&key).unwrap(), Some(9));
    assert_eq!(
        store.read_cursor(&DurableKey::new("clientB", "test")).unwrap(),
        None
    );

    exercise_durables(store);
}

fn exercise_durables(store: &dyn MessageStore) {
    let key = DurableKey::new("clientA", "test");
    let neighbour = DurableKey::new("clientA", "test2");
    let info = ConsumerInfo::new(Destination::topic("T"))
        .durable("test")
        .with_selector("JMSType = 'x'")
        .no_local();
    store.save_durable(&DurableRecord::new(key.clone(), &info)).unwrap();
    store
        .save_durable(&DurableRecord::new(neighbour.clone(), &ConsumerInfo::new(Destination::topic("T"))))
        .unwrap();

    let records = store.load_durables().unwrap();
    assert_eq!(records.len(), 2);
    let restored = records.iter().find(|r| r.key == key).unwrap().consumer_info();
    assert_eq!(restored, info);

    store.hold(&key, 3, &message(3, "c")).unwrap();
    store.hold(&key, 1, &message(1, "a")).unwrap();
    store.hold(&key, 2, &message(2, "b")).unwrap();
    store.hold(&neighbour, 1, &message(1, "other")).unwrap();
    store.release(&key, 2).unwrap();
    store.release(&key, 42).unwrap();

    let held: Vec<_> = store
        .held(&key)
        .unwrap()
        .into_iter()
        .map(|(seq, m)| (seq, m.payload))
        .collect();
    assert_eq!(held, vec![(1, "a".to_string()), (3, "c".to_string())]);

    store.delete_durable(&key).unwrap();
    assert!(store.held(&key).unwrap().is_empty());
    assert_eq!(store.read_cursor(&key).unwrap(), None);
    let remaining: Vec<_> = store.load_durables().unwrap().into_iter().map(|r| r.key).collect();
    assert_eq!(remaining, vec![neighbour.clone()]);
    assert_eq!(store.held(&neighbour).unwrap().len(), 1);
}

#[test]
fn memory_store_behaves_like_a_store() {
    exercise_store(&MemoryStore::default());
}

#[test]
fn sled_store_behaves_like_a_store() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
    exercise_store(&store);
}

#[test]
fn sled_store_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let queue = Destination::queue("TEST");
    {
        let store = SledStore::open(&path).unwrap();
        store.append(&queue, &message(1, "kept")).unwrap();
        store
            .write_cursor(&DurableKey::new("clientA", "test"), 4)
            .unwrap();
        store.flush().unwrap();
    }
    let store = SledStore::open(&path).unwrap();
    let loaded = store.load(&queue).unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].payload, "kept");
    assert!(loaded[0].is_persistent());
    assert_eq!(
        store
            .read_cursor(&DurableKey::new("clientA", "test"))
            .unwrap(),
        Some(4)
    );
}

#[test]
fn sled_store_keeps_lookalike_destinations_apart() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap()).unwrap();
    let plain = Destination::queue("X");
    let lookalike = Destination::queue("X#index");

    store.append(&plain, &message(1, "plain")).unwrap();
    store.append(&lookalike, &message(1, "lookalike")).unwrap();
    store.remove(&plain, &message(1, "").id).unwrap();

    assert!(store.load(&plain).unwrap().is_empty());
    let kept: Vec<_> = store.load(&lookalike).unwrap().into_iter().map(|m| m.payload).collect();
    assert_eq!(kept, vec!["lookalike"]);
}

#[test]
fn sled_store_durables_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().to_str().unwrap().to_string();
    let key = DurableKey::new("clientA", "test");
    {
        let store = SledStore::open(&path).unwrap();
        let info = ConsumerInfo::new(Destination::topic("T")).durable("test");
        store.save_durable(&DurableRecord::new(key.clone(), &info)).unwrap();
        store.hold(&key, 7, &message(7, "held")).unwrap();
        store.flush().unwrap();
    }
    let store = SledStore::open(&path).unwrap();
    assert_eq!(store.load_durables().unwrap()[0].destination, Destination::topic("T"));
    let held = store.held(&key).unwrap();
    assert_eq!(held.len(), 1);
    assert_eq!((held[0].0, held[0].1.payload.as_str()), (7, "held"));
}
