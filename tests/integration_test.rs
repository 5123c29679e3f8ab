use std::time::Duration;

use relaymq::broker::message::{DeliveryMode, Message};
use relaymq::config::{PersistenceBackend, Settings};
use relaymq::connection::ConnectionInfo;
use relaymq::destination::{Destination, DestinationKind};
use relaymq::subscription::ConsumerInfo;
use relaymq::{BrokerError, BrokerService, MessageAck};
use tokio::time::timeout;

fn sled_settings(path: &std::path::Path) -> Settings {
    let mut settings = Settings::default();
    settings.persistence.backend = PersistenceBackend::Sled;
    settings.persistence.path = path.to_string_lossy().into_owned();
    settings
}

#[tokio::test]
async fn integration_request_reply_over_temporary_queue() {
    let mut settings = Settings::default();
    settings.logging.level = "debug".to_string();
    let handle = BrokerService::start(&settings).unwrap();

    let server = handle.open_connection(ConnectionInfo::default()).await.unwrap();
    let server_session = handle.open_session(server).await.unwrap();
    let requests = Destination::queue("service.requests");
    let (_, mut inbox) = handle
        .add_consumer(server_session.clone(), ConsumerInfo::new(requests.clone()))
        .await
        .unwrap();
    let replier = handle.add_producer(server_session, None).await.unwrap();

    let client = handle.open_connection(ConnectionInfo::default()).await.unwrap();
    let client_session = handle.open_session(client.clone()).await.unwrap();
    let reply_to = handle
        .create_temp_destination(client.clone(), DestinationKind::Queue)
        .await
        .unwrap();
    let (_, mut replies) = handle
        .add_consumer(client_session.clone(), ConsumerInfo::new(reply_to.clone()))
        .await
        .unwrap();
    let requester = handle
        .add_producer(client_session, Some(requests.clone()))
        .await
        .unwrap();

    handle
        .send(
            requester,
            Message::new(requests.clone(), "ping").with_property("replyTo", reply_to.to_string()),
        )
        .await
        .unwrap();

    let request = timeout(Duration::from_secs(1), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.message.payload, "ping");
    handle
        .send(replier.clone(), Message::new(reply_to.clone(), "pong"))
        .await
        .unwrap();
    handle
        .acknowledge(MessageAck::standard(&request))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(1), replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.message.payload, "pong");

    handle.close_connection(client).await.unwrap();
    let err = handle
        .send(replier, Message::new(reply_to, "too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::DestinationUnavailable(_)));
}

#[tokio::test]
async fn integration_persistent_messages_survive_restart_with_sled() {
    let dir = tempfile::tempdir().unwrap();
    let settings = sled_settings(dir.path());
    let queue = Destination::queue("jobs");

    {
        let handle = BrokerService::start(&settings).unwrap();
        let connection = handle.open_connection(ConnectionInfo::default()).await.unwrap();
        let session = handle.open_session(connection).await.unwrap();
        let producer = handle.add_producer(session, None).await.unwrap();
        for payload in ["first", "second"] {
            handle
                .send(
                    producer.clone(),
                    Message::new(queue.clone(), payload).with_delivery_mode(DeliveryMode::Persistent),
                )
                .await
                .unwrap();
        }
        handle
            .send(producer, Message::new(queue.clone(), "transient"))
            .await
            .unwrap();
        // Dropping the last handle stops the loop; give it a moment to release the database.
        drop(handle);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let handle = BrokerService::start(&settings).unwrap();
    let connection = handle.open_connection(ConnectionInfo::default()).await.unwrap();
    let session = handle.open_session(connection).await.unwrap();
    let (_, mut deliveries) = handle
        .add_consumer(session, ConsumerInfo::new(queue.clone()))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(1), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(1), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.message.payload, "first");
    assert_eq!(second.message.payload, "second");
    assert!(deliveries.try_recv().is_err());

    handle.acknowledge(MessageAck::standard(&second)).await.unwrap();
    let stats = handle.destination_stats(queue).await.unwrap().unwrap();
    assert_eq!(stats.depth, 0);
}

#[tokio::test]
async fn integration_durable_topic_subscriber_catches_up() {
    let handle = BrokerService::start(&Settings::default()).unwrap();
    let topic = Destination::topic("prices.eu");

    let publisher = handle.open_connection(ConnectionInfo::default()).await.unwrap();
    let publisher_session = handle.open_session(publisher).await.unwrap();
    let producer = handle
        .add_producer(publisher_session, Some(topic.clone()))
        .await
        .unwrap();

    let subscriber = handle
        .open_connection(ConnectionInfo::with_client_id("desk"))
        .await
        .unwrap();
    let session = handle.open_session(subscriber.clone()).await.unwrap();
    let info = ConsumerInfo::new(Destination::topic("prices.>")).durable("ticks");
    let (_, mut ticks) = handle.add_consumer(session, info.clone()).await.unwrap();

    handle
        .send(producer.clone(), Message::new(topic.clone(), "100"))
        .await
        .unwrap();
    let seen = timeout(Duration::from_secs(1), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    handle.acknowledge(MessageAck::standard(&seen)).await.unwrap();
    handle.close_connection(subscriber).await.unwrap();

    handle
        .send(producer, Message::new(topic.clone(), "101"))
        .await
        .unwrap();

    let subscriber = handle
        .open_connection(ConnectionInfo::with_client_id("desk"))
        .await
        .unwrap();
    let session = handle.open_session(subscriber).await.unwrap();
    let (_, mut ticks) = handle.add_consumer(session, info).await.unwrap();
    let caught_up = timeout(Duration::from_secs(1), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(caught_up.message.payload, "101");
    assert!(ticks.try_recv().is_err());
}
