use super::{Connection, ConnectionInfo};
use crate::destination::Destination;

#[test]
fn test_connection_new() {
    let connection = Connection::new(ConnectionInfo::with_client_id("clientA"));
    assert_eq!(connection.client_id.as_deref(), Some("clientA"));
    assert!(connection.sessions.is_empty());
    assert!(connection.id.to_string().starts_with("ID:"));
}

#[test]
fn session_ids_are_scoped_to_their_connection() {
    let mut connection = Connection::new(ConnectionInfo::default());
    let first = connection.open_session();
    let second = connection.open_session();
    assert_eq!(first.connection, connection.id);
    assert_ne!(first, second);
    assert_eq!(connection.sessions.len(), 2);
}

#[test]
fn producer_sequences_are_monotonic() {
    let mut connection = Connection::new(ConnectionInfo::default());
    let session_id = connection.open_session();
    let session = connection.sessions.get_mut(&session_id.value).unwrap();
    let producer_id = session.add_producer(Some(Destination::queue("TEST")));
    let producer = session.producers.get_mut(&producer_id.value).unwrap();
    assert_eq!(producer.next_sequence(), 1);
    assert_eq!(producer.next_sequence(), 2);
}

#[test]
fn consumer_ids_know_their_connection() {
    let mut connection = Connection::new(ConnectionInfo::default());
    let session_id = connection.open_session();
    let session = connection.sessions.get_mut(&session_id.value).unwrap();
    let consumer_id = session.next_consumer_id();
    assert_eq!(consumer_id.connection(), &connection.id);
}

#[test]
fn temp_names_embed_the_connection_id() {
    let mut connection = Connection::new(ConnectionInfo::default());
    let name = connection.next_temp_name();
    assert!(name.starts_with(&connection.id.to_string()));
    assert_ne!(name, connection.next_temp_name());
}
