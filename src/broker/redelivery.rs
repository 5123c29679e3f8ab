//! Teardown and redelivery.
//!
//! Closing a consumer returns its unacknowledged queue messages to ready
//! (flagged redelivered) and hands durable topic messages back to the
//! durable subscription. Copies held by browsers and by non-durable topic
//! subscribers are dropped. Sessions and connections close by walking their
//! children in id order.

use std::collections::BTreeMap;

use tracing::{debug, info, trace};

use super::engine::Broker;
use crate::connection::{ConnectionId, ConsumerId, Session, SessionId};
use crate::destination::Destination;
use crate::subscription::InFlight;
use crate::utils::BrokerError;

impl Broker {
    pub fn close_consumer(&mut self, consumer: &ConsumerId) -> Result<(), BrokerError> {
        if self.registry.get(consumer).is_none() {
            return Err(BrokerError::UnknownConsumer(consumer.to_string()));
        }
        self.release_consumer(consumer);
        self.reap_failed_consumers();
        Ok(())
    }

    pub fn close_session(&mut self, session: &SessionId) -> Result<(), BrokerError> {
        let removed = self
            .connection_mut(&session.connection)?
            .sessions
            .remove(&session.value)
            .ok_or_else(|| BrokerError::UnknownSession(session.to_string()))?;
        self.release_session(removed);
        self.reap_failed_consumers();
        Ok(())
    }

    /// Close every session, destroy the connection's temporary destinations
    /// and release its client id.
    pub fn close_connection(&mut self, connection: &ConnectionId) -> Result<(), BrokerError> {
        let removed = self
            .connections
            .remove(connection)
            .ok_or_else(|| BrokerError::UnknownConnection(connection.to_string()))?;

        for session in removed.sessions.into_values() {
            self.release_session(session);
        }
        for destination in &removed.temp_destinations {
            self.destroy_temp_destination(destination);
        }
        if let Some(client_id) = &removed.client_id {
            if self.client_ids.get(client_id) == Some(connection) {
                self.client_ids.remove(client_id);
            }
        }
        info!("connection {connection} closed");
        self.reap_failed_consumers();
        Ok(())
    }

    fn release_session(&mut self, session: Session) {
        for consumer in &session.consumers {
            self.release_consumer(consumer);
        }
        debug!(
            "session {} closed ({} producers)",
            session.id,
            session.producers.len()
        );
    }

    pub(super) fn release_consumer(&mut self, consumer: &ConsumerId) {
        let Some(mut subscription) = self.registry.remove(consumer) else {
            return;
        };
        subscription.closing = true;
        for destination in &subscription.attached {
            if let Some(engine) = self.destinations.get_mut(destination) {
                engine.detach(consumer);
            }
        }
        if let Some(session) = self
            .connections
            .get_mut(consumer.connection())
            .and_then(|c| c.sessions.get_mut(&consumer.session.value))
        {
            session.consumers.remove(consumer);
        }

        let mut window: Vec<InFlight> = subscription.window.drain(..).collect();
        let pending = std::mem::take(&mut subscription.pending);
        if let Some(key) = &subscription.durable {
            let (topic_entries, rest): (Vec<InFlight>, Vec<InFlight>) = window
                .into_iter()
                .partition(|entry| entry.destination.is_topic());
            self.registry.reclaim_durable(key, topic_entries, pending);
            window = rest;
        }
        if subscription.info.browser {
            trace!("browser {consumer} closed with {} copies outstanding", window.len());
        } else {
            let mut by_destination: BTreeMap<Destination, Vec<InFlight>> = BTreeMap::new();
            for entry in window {
                by_destination
                    .entry(entry.destination.clone())
                    .or_default()
                    .push(entry);
            }
            for (destination, entries) in by_destination {
                if let Some(engine) = self.destinations.get_mut(&destination) {
                    engine.reclaim(consumer, entries);
                }
            }
        }
        info!("consumer {consumer} closed");
        self.dispatch_all(subscription.attached.into_iter().collect());
    }

    fn destroy_temp_destination(&mut self, destination: &Destination) {
        if self.destinations.remove(destination).is_some() {
            self.registry.forget_destination(destination);
            info!("temporary destination {destination} destroyed");
        }
    }
}
