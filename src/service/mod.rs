//! Serialized access to a `Broker` from async code.
//!
//! `BrokerService::spawn` moves the broker onto its own task. Every
//! `BrokerHandle` call is queued on one bounded command channel and applied
//! in arrival order, so all dispatch decisions for all destinations are made
//! by a single loop. Clones of the handle share that loop; it exits once the
//! last handle is dropped.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::broker::message::{Message, MessageId};
use crate::broker::{Broker, DestinationStats, MessageAck};
use crate::config::Settings;
use crate::connection::{ConnectionId, ConnectionInfo, ConsumerId, ProducerId, SessionId};
use crate::destination::{Destination, DestinationKind};
use crate::subscription::{ConsumerInfo, Dispatch};
use crate::utils::{BrokerError, logging};

type Command = Box<dyn FnOnce(&mut Broker) + Send>;

pub struct BrokerService;

impl BrokerService {
    /// Run `broker` on a new task. Must be called inside a tokio runtime.
    pub fn spawn(broker: Broker, buffer: usize) -> BrokerHandle {
        let (commands, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(run(broker, rx));
        BrokerHandle { commands }
    }

    /// Install logging, build a broker from configuration and run it.
    pub fn start(settings: &Settings) -> Result<BrokerHandle, BrokerError> {
        logging::init(&settings.logging);
        let broker = Broker::from_settings(settings)?;
        Ok(Self::spawn(broker, settings.broker.command_buffer))
    }
}

async fn run(mut broker: Broker, mut commands: mpsc::Receiver<Command>) {
    info!("broker service started");
    while let Some(command) = commands.recv().await {
        command(&mut broker);
    }
    info!("broker service stopped");
}

#[derive(Debug, Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Run `f` on the broker loop and wait for its result.
    pub async fn call<F, R>(&self, f: F) -> Result<R, BrokerError>
    where
        F: FnOnce(&mut Broker) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let command: Command = Box::new(move |broker: &mut Broker| {
            if reply.send(f(broker)).is_err() {
                debug!("caller went away before the broker replied");
            }
        });
        self.commands
            .send(command)
            .await
            .map_err(|_| BrokerError::ServiceStopped)?;
        response.await.map_err(|_| BrokerError::ServiceStopped)
    }

    pub async fn open_connection(&self, info: ConnectionInfo) -> Result<ConnectionId, BrokerError> {
        self.call(move |broker| broker.open_connection(info)).await?
    }

    pub async fn open_session(&self, connection: ConnectionId) -> Result<SessionId, BrokerError> {
        self.call(move |broker| broker.open_session(&connection)).await?
    }

    pub async fn add_producer(
        &self,
        session: SessionId,
        destination: Option<Destination>,
    ) -> Result<ProducerId, BrokerError> {
        self.call(move |broker| broker.add_producer(&session, destination))
            .await?
    }

    /// Attach a consumer; deliveries arrive on the returned receiver.
    pub async fn add_consumer(
        &self,
        session: SessionId,
        info: ConsumerInfo,
    ) -> Result<(ConsumerId, mpsc::UnboundedReceiver<Dispatch>), BrokerError> {
        let (sink, deliveries) = mpsc::unbounded_channel();
        let consumer = self
            .call(move |broker| broker.add_consumer(&session, info, sink))
            .await??;
        Ok((consumer, deliveries))
    }

    pub async fn send(&self, producer: ProducerId, message: Message) -> Result<MessageId, BrokerError> {
        self.call(move |broker| broker.send(&producer, message)).await?
    }

    pub async fn acknowledge(&self, ack: MessageAck) -> Result<(), BrokerError> {
        self.call(move |broker| broker.acknowledge(ack)).await?
    }

    pub async fn pull(&self, consumer: ConsumerId) -> Result<(), BrokerError> {
        self.call(move |broker| broker.pull(&consumer)).await?
    }

    pub async fn create_temp_destination(
        &self,
        connection: ConnectionId,
        kind: DestinationKind,
    ) -> Result<Destination, BrokerError> {
        self.call(move |broker| broker.create_temp_destination(&connection, kind))
            .await?
    }

    pub async fn remove_durable_subscription(
        &self,
        connection: ConnectionId,
        name: String,
    ) -> Result<(), BrokerError> {
        self.call(move |broker| broker.remove_durable_subscription(&connection, &name))
            .await?
    }

    pub async fn close_consumer(&self, consumer: ConsumerId) -> Result<(), BrokerError> {
        self.call(move |broker| broker.close_consumer(&consumer)).await?
    }

    pub async fn remove_producer(&self, producer: ProducerId) -> Result<(), BrokerError> {
        self.call(move |broker| broker.remove_producer(&producer)).await?
    }

    pub async fn close_session(&self, session: SessionId) -> Result<(), BrokerError> {
        self.call(move |broker| broker.close_session(&session)).await?
    }

    pub async fn close_connection(&self, connection: ConnectionId) -> Result<(), BrokerError> {
        self.call(move |broker| broker.close_connection(&connection))
            .await?
    }

    pub async fn destination_stats(
        &self,
        destination: Destination,
    ) -> Result<Option<DestinationStats>, BrokerError> {
        self.call(move |broker| broker.destination_stats(&destination))
            .await
    }
}
