//! Broker engine
//!
//! `Broker` is the command intake for the whole distribution core: it owns
//! the connection tree, one dispatch engine per concrete destination and the
//! subscription registry, and applies every command to completion before
//! the next one starts.
//!
//! Concurrency and usage notes:
//! - The API is synchronous and takes `&mut self`. Embedders either own the
//!   broker directly or run it behind `service::BrokerService`, which
//!   serializes commands from any number of tasks onto a single loop.
//! - Deliveries go out on each consumer's unbounded `DeliverySink`; flow
//!   control is the prefetch window, so no call here ever waits on a client.
//! - A consumer whose sink turns out to be closed is torn down at the end of
//!   the command that noticed, which sends its in-flight messages back for
//!   redelivery.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use super::message::{Message, MessageId};
use super::region::{DestinationStats, DispatchEngine, engine_for};
use crate::config::{BrokerSettings, Settings};
use crate::connection::{
    Connection, ConnectionId, ConnectionInfo, ConsumerId, ProducerId, Session, SessionId,
};
use crate::destination::{Destination, DestinationKind};
use crate::persistence::{MemoryStore, MessageStore, open_store};
use crate::selector::{SelectorEvaluator, SimpleSelector};
use crate::subscription::{
    ConsumerInfo, DeliverySink, DurableKey, DurableSubscription, Subscription,
    SubscriptionRegistry,
};
use crate::utils::BrokerError;

#[derive(Debug)]
pub struct Broker {
    pub(super) settings: BrokerSettings,
    pub(super) connections: HashMap<ConnectionId, Connection>,
    pub(super) client_ids: HashMap<String, ConnectionId>,
    pub(super) destinations: BTreeMap<Destination, Box<dyn DispatchEngine>>,
    pub(super) registry: SubscriptionRegistry,
    pub(super) store: Arc<dyn MessageStore>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(
            BrokerSettings::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(SimpleSelector::default()),
        )
    }
}

impl Broker {
    pub fn new(
        settings: BrokerSettings,
        store: Arc<dyn MessageStore>,
        selectors: Arc<dyn SelectorEvaluator>,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            client_ids: HashMap::new(),
            destinations: BTreeMap::new(),
            registry: SubscriptionRegistry::new(selectors, store.clone()).with_limits(&settings),
            settings,
            store,
        }
    }

    /// Like `new`, but first recovers the durable subscriptions recorded in
    /// `store`, so they keep collecting messages before their clients
    /// reconnect. Queue messages are recovered lazily as each queue is
    /// first used.
    pub fn open(
        settings: BrokerSettings,
        store: Arc<dyn MessageStore>,
        selectors: Arc<dyn SelectorEvaluator>,
    ) -> Result<Self, BrokerError> {
        let mut broker = Self::new(settings, store, selectors);
        let recovered = broker.registry.recover_durables()?;
        if recovered > 0 {
            info!("recovered {recovered} durable subscriptions");
        }
        Ok(broker)
    }

    /// Open a broker on the store selected by `settings.persistence`.
    pub fn from_settings(settings: &Settings) -> Result<Self, BrokerError> {
        let store = open_store(&settings.persistence)?;
        Self::open(
            settings.broker.clone(),
            store,
            Arc::new(SimpleSelector::default()),
        )
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn open_connection(&mut self, info: ConnectionInfo) -> Result<ConnectionId, BrokerError> {
        if let Some(client_id) = &info.client_id {
            if self.client_ids.contains_key(client_id) {
                return Err(BrokerError::InvalidClientId(client_id.clone()));
            }
        }
        let connection = Connection::new(info);
        let id = connection.id.clone();
        if let Some(client_id) = &connection.client_id {
            self.client_ids.insert(client_id.clone(), id.clone());
        }
        self.connections.insert(id.clone(), connection);
        info!("connection {id} opened");
        Ok(id)
    }

    pub fn open_session(&mut self, connection: &ConnectionId) -> Result<SessionId, BrokerError> {
        let session = self.connection_mut(connection)?.open_session();
        debug!("session {session} opened");
        Ok(session)
    }

    /// Register a producer, optionally bound to a destination that then
    /// overrides the destination of every message it sends.
    pub fn add_producer(
        &mut self,
        session: &SessionId,
        destination: Option<Destination>,
    ) -> Result<ProducerId, BrokerError> {
        self.session_mut(session)?;
        if let Some(destination) = &destination {
            destination.validate()?;
            for target in destination.resolve(self.destinations.keys()) {
                self.materialize(&target)?;
            }
        }
        let producer = self.session_mut(session)?.add_producer(destination);
        debug!("producer {producer} added");
        Ok(producer)
    }

    pub fn remove_producer(&mut self, producer: &ProducerId) -> Result<(), BrokerError> {
        self.session_mut(&producer.session)?
            .producers
            .remove(&producer.value)
            .ok_or_else(|| BrokerError::UnknownProducer(producer.to_string()))?;
        debug!("producer {producer} removed");
        Ok(())
    }

    /// Attach a consumer and start dispatching to `sink`.
    ///
    /// The destination may be composite or wildcard. Wildcard subscriptions
    /// also attach to matching destinations created later.
    pub fn add_consumer(
        &mut self,
        session: &SessionId,
        mut info: ConsumerInfo,
        sink: DeliverySink,
    ) -> Result<ConsumerId, BrokerError> {
        info.destination.validate()?;
        self.normalize(&mut info)?;

        let connection = self
            .connections
            .get(&session.connection)
            .ok_or_else(|| BrokerError::UnknownConnection(session.connection.to_string()))?;
        if !connection.sessions.contains_key(&session.value) {
            return Err(BrokerError::UnknownSession(session.to_string()));
        }
        for member in info.destination.members() {
            if member.is_temporary() && member.is_concrete() {
                if !self.destinations.contains_key(&member) {
                    return Err(BrokerError::DestinationUnavailable(member));
                }
                if !connection.temp_destinations.contains(&member) {
                    return Err(BrokerError::ForeignTemporaryDestination(member));
                }
            }
        }
        let durable = match &info.subscription_name {
            Some(name) => {
                let client_id = connection
                    .client_id
                    .clone()
                    .ok_or_else(|| BrokerError::MissingClientId(name.clone()))?;
                Some(DurableKey::new(client_id, name.clone()))
            }
            None => None,
        };
        if let Some(key) = &durable {
            self.prepare_durable(key, &info)?;
        }

        let session_state = self.session_mut(session)?;
        let id = session_state.next_consumer_id();
        session_state.consumers.insert(id.clone());

        let prefetch = info.prefetch.unwrap_or(self.settings.default_prefetch);
        let mut subscription =
            Subscription::new(id.clone(), info.clone(), prefetch, durable.clone(), sink);
        if let Some(durable) = durable.as_ref().and_then(|k| self.registry.durable_mut(k)) {
            subscription.pending = durable.activate(id.clone());
        }
        self.registry.insert(subscription);
        info!("consumer {id} subscribed to {}", info.destination);

        for target in info.destination.resolve(self.destinations.keys()) {
            if let Err(err) = self.materialize(&target) {
                self.release_consumer(&id);
                return Err(err);
            }
            self.attach(&target, &id);
        }
        self.reap_failed_consumers();
        Ok(id)
    }

    /// Send a message and return the id it was assigned. Composite and
    /// wildcard sends fan out to every member; the send only fails if no
    /// member accepted it.
    pub fn send(&mut self, producer: &ProducerId, mut message: Message) -> Result<MessageId, BrokerError> {
        let state = self
            .session_mut(&producer.session)?
            .producers
            .get_mut(&producer.value)
            .ok_or_else(|| BrokerError::UnknownProducer(producer.to_string()))?;
        if let Some(bound) = &state.destination {
            message.destination = bound.clone();
        }
        message.destination.validate()?;

        message.id = MessageId {
            producer: producer.clone(),
            sequence: state.next_sequence(),
        };
        message.timestamp = chrono::Utc::now().timestamp_millis();
        message.producer_connection = Some(producer.session.connection.clone());
        message.redelivered = false;
        message.redelivery_counter = 0;

        let id = message.id.clone();
        let addressed = message.destination.clone();
        if !addressed.is_concrete() {
            message.original_destination = Some(addressed.clone());
        }

        let mut routed = 0;
        let mut first_error = None;
        for target in addressed.resolve(self.destinations.keys()) {
            let mut copy = message.clone();
            copy.destination = target.clone();
            match self.route(copy) {
                Ok(()) => routed += 1,
                Err(err) => {
                    warn!("send {id} to {target} failed: {err}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        self.reap_failed_consumers();

        match first_error {
            Some(err) if routed == 0 => Err(err),
            _ => {
                trace!("{id} sent to {addressed} ({routed} destinations)");
                Ok(id)
            }
        }
    }

    /// Let a zero-prefetch consumer receive one more message.
    pub fn pull(&mut self, consumer: &ConsumerId) -> Result<(), BrokerError> {
        let subscription = self
            .registry
            .get_mut(consumer)
            .ok_or_else(|| BrokerError::UnknownConsumer(consumer.to_string()))?;
        subscription.grant_pull();
        let attached: Vec<Destination> = subscription.attached.iter().cloned().collect();
        self.dispatch_all(attached);
        self.reap_failed_consumers();
        Ok(())
    }

    /// Create a temporary destination owned by `connection`. It lives until
    /// the connection closes.
    pub fn create_temp_destination(
        &mut self,
        connection: &ConnectionId,
        kind: DestinationKind,
    ) -> Result<Destination, BrokerError> {
        let owner = self.connection_mut(connection)?;
        let name = owner.next_temp_name();
        let destination = if kind.is_topic() {
            Destination::temp_topic(name)
        } else {
            Destination::temp_queue(name)
        };
        owner.temp_destinations.insert(destination.clone());

        self.destinations.insert(
            destination.clone(),
            engine_for(&destination, &self.settings),
        );
        info!("temporary destination {destination} created");
        self.attach_matching(&destination);
        self.reap_failed_consumers();
        Ok(destination)
    }

    /// Delete an inactive durable subscription and everything it holds.
    pub fn remove_durable_subscription(
        &mut self,
        connection: &ConnectionId,
        name: &str,
    ) -> Result<(), BrokerError> {
        let client_id = self
            .connections
            .get(connection)
            .ok_or_else(|| BrokerError::UnknownConnection(connection.to_string()))?
            .client_id
            .clone()
            .ok_or_else(|| BrokerError::MissingClientId(name.to_string()))?;
        let key = DurableKey::new(client_id, name);
        match self.registry.durable(&key) {
            None => {
                debug!("no durable subscription {key} to remove");
                Ok(())
            }
            Some(durable) if durable.active.is_some() => Err(BrokerError::DurableSubscriptionInUse {
                client_id: key.client_id,
                name: key.name,
            }),
            Some(_) => {
                self.drop_durable(&key)?;
                info!("durable subscription {key} removed");
                Ok(())
            }
        }
    }

    pub fn destination_stats(&self, destination: &Destination) -> Option<DestinationStats> {
        self.destinations
            .get(destination)
            .map(|engine| engine.stats(&self.registry))
    }

    /// Number of messages a queue holds, including unacknowledged ones.
    /// Unknown destinations report zero.
    pub fn queue_depth(&self, destination: &Destination) -> usize {
        self.destination_stats(destination)
            .map(|stats| stats.depth)
            .unwrap_or_default()
    }

    /// Every concrete destination that currently exists.
    pub fn destinations(&self) -> Vec<Destination> {
        self.destinations.keys().cloned().collect()
    }

    pub fn durable_subscription(&self, key: &DurableKey) -> Option<&DurableSubscription> {
        self.registry.durable(key)
    }

    pub fn consumer_count(&self) -> usize {
        self.registry.len()
    }

    pub(super) fn connection_mut(&mut self, id: &ConnectionId) -> Result<&mut Connection, BrokerError> {
        self.connections
            .get_mut(id)
            .ok_or_else(|| BrokerError::UnknownConnection(id.to_string()))
    }

    pub(super) fn session_mut(&mut self, id: &SessionId) -> Result<&mut Session, BrokerError> {
        self.connection_mut(&id.connection)?
            .sessions
            .get_mut(&id.value)
            .ok_or_else(|| BrokerError::UnknownSession(id.to_string()))
    }

    /// Trim and validate the selector, and drop flags that do not apply to
    /// the destination kind.
    fn normalize(&self, info: &mut ConsumerInfo) -> Result<(), BrokerError> {
        if let Some(selector) = info.selector.take() {
            let selector = selector.trim();
            if !selector.is_empty() {
                self.registry
                    .validate_selector(selector)
                    .map_err(|reason| BrokerError::InvalidSelector {
                        selector: selector.to_string(),
                        reason,
                    })?;
                info.selector = Some(selector.to_string());
            }
        }
        if info.destination.is_topic() {
            if info.browser {
                debug!("browse flag ignored on {}", info.destination);
                info.browser = false;
            }
        } else if let Some(name) = info.subscription_name.take() {
            debug!("subscription name '{name}' ignored on {}", info.destination);
        }
        Ok(())
    }

    fn prepare_durable(&mut self, key: &DurableKey, info: &ConsumerInfo) -> Result<(), BrokerError> {
        let existing = self
            .registry
            .durable(key)
            .map(|d| (d.active.is_some(), d.is_compatible(info)));
        match existing {
            Some((true, _)) => {
                return Err(BrokerError::DurableSubscriptionInUse {
                    client_id: key.client_id.clone(),
                    name: key.name.clone(),
                });
            }
            Some((false, true)) => return Ok(()),
            Some((false, false)) => {
                info!("durable subscription {key} changed destination or selector, resetting");
                self.drop_durable(key)?;
            }
            None => {}
        }
        let cursor = self.store.read_cursor(key)?.unwrap_or_default();
        self.registry.create_durable(key.clone(), info, cursor)?;
        debug!("durable subscription {key} created at cursor {cursor}");
        Ok(())
    }

    fn drop_durable(&mut self, key: &DurableKey) -> Result<(), BrokerError> {
        for engine in self.destinations.values_mut() {
            engine.forget_durable(key);
        }
        self.registry.remove_durable(key)?;
        Ok(())
    }

    /// Create the engine for a concrete destination on first use, reloading
    /// persisted queue messages. Temporary destinations are never created
    /// here.
    pub(super) fn materialize(&mut self, destination: &Destination) -> Result<(), BrokerError> {
        if self.destinations.contains_key(destination) {
            return Ok(());
        }
        if destination.is_temporary() {
            return Err(BrokerError::DestinationUnavailable(destination.clone()));
        }

        let mut engine = engine_for(destination, &self.settings);
        if !destination.is_topic() {
            let recovered = self.store.load(destination)?;
            if !recovered.is_empty() {
                info!("recovered {} messages for {destination}", recovered.len());
                engine.restore(recovered);
            }
        }
        debug!("destination {} created", engine.destination());
        self.destinations.insert(destination.clone(), engine);
        self.attach_matching(destination);
        Ok(())
    }

    /// Attach every existing subscription whose destination addresses this
    /// newly created one.
    fn attach_matching(&mut self, destination: &Destination) {
        let mut durables = self.registry.offline_durables_matching(destination);
        if destination.is_temporary() {
            let owner = self.temp_owner(destination).and_then(|c| c.client_id.clone());
            durables.retain(|key| owner.as_ref() == Some(&key.client_id));
        }
        if let Some(engine) = self.destinations.get_mut(destination) {
            for key in &durables {
                engine.attach_durable(key);
            }
        }
        for consumer in self.registry.unattached_matching(destination) {
            self.attach(destination, &consumer);
        }
    }

    /// The connection a temporary destination belongs to.
    fn temp_owner(&self, destination: &Destination) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.temp_destinations.contains(destination))
    }

    /// Only the owning connection may consume from a temporary destination,
    /// whether it names it directly or through a wildcard.
    fn may_consume(&self, consumer: &ConsumerId, destination: &Destination) -> bool {
        !destination.is_temporary()
            || self
                .connections
                .get(consumer.connection())
                .is_some_and(|c| c.temp_destinations.contains(destination))
    }

    fn attach(&mut self, destination: &Destination, consumer: &ConsumerId) {
        if !self.may_consume(consumer, destination) {
            trace!("{consumer} does not own {destination}, not attaching");
            return;
        }
        if !self.registry.mark_attached(consumer, destination) {
            return;
        }
        if let Some(engine) = self.destinations.get_mut(destination) {
            engine.attach(consumer, &mut self.registry);
            engine.dispatch(&mut self.registry);
        }
    }

    /// Deliver a concrete copy to its destination.
    pub(super) fn route(&mut self, message: Message) -> Result<(), BrokerError> {
        let destination = message.destination.clone();
        self.materialize(&destination)?;
        if message.is_persistent() && !destination.is_topic() && !destination.is_temporary() {
            self.store.append(&destination, &message)?;
        }
        if let Some(engine) = self.destinations.get_mut(&destination) {
            engine.offer(message, &mut self.registry);
        }
        Ok(())
    }

    pub(super) fn dispatch_all(&mut self, destinations: Vec<Destination>) {
        for destination in destinations {
            if let Some(engine) = self.destinations.get_mut(&destination) {
                engine.dispatch(&mut self.registry);
            }
        }
    }

    /// Tear down consumers whose sinks were found closed.
    pub(super) fn reap_failed_consumers(&mut self) {
        loop {
            let failed = self.registry.take_failed();
            if failed.is_empty() {
                return;
            }
            for consumer in failed {
                warn!("closing consumer {consumer} after its delivery sink closed");
                self.release_consumer(&consumer);
            }
        }
    }
}
