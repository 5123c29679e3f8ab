//! The capability interface shared by queue and topic dispatch.
//!
//! The broker keeps one engine per concrete destination and drives it only
//! through `DispatchEngine`, so adding a destination flavour never touches the
//! command handlers.

use std::fmt;

use crate::broker::message::Message;
use crate::broker::queue::QueueEngine;
use crate::broker::topic::TopicEngine;
use crate::config::BrokerSettings;
use crate::connection::ConsumerId;
use crate::destination::Destination;
use crate::subscription::{DurableKey, InFlight, SubscriptionRegistry};

/// Point-in-time counters for one concrete destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DestinationStats {
    /// Messages held by the destination: queued plus unacknowledged for a
    /// queue, matched-but-undispatched for a topic.
    pub depth: usize,
    /// Dispatched and not yet standard-acknowledged.
    pub in_flight: usize,
    pub consumers: usize,
    pub enqueued: u64,
    pub dequeued: u64,
}

pub(crate) trait DispatchEngine: Send + fmt::Debug {
    fn destination(&self) -> &Destination;

    /// Accept a produced message and dispatch what it can.
    fn offer(&mut self, message: Message, registry: &mut SubscriptionRegistry);

    /// Start routing to a consumer that the registry already knows about.
    fn attach(&mut self, consumer: &ConsumerId, registry: &mut SubscriptionRegistry);

    fn detach(&mut self, consumer: &ConsumerId);

    /// Keep collecting messages for an offline durable subscription.
    fn attach_durable(&mut self, _key: &DurableKey) {}

    fn forget_durable(&mut self, _key: &DurableKey) {}

    /// Hand ready messages to consumers with window capacity.
    fn dispatch(&mut self, registry: &mut SubscriptionRegistry);

    /// Settle window entries a consumer acknowledged. Returns the messages
    /// that were consumed.
    fn acknowledge(&mut self, consumer: &ConsumerId, entries: &[InFlight]) -> Vec<Message>;

    /// Take back unacknowledged entries from a closing consumer.
    fn reclaim(&mut self, consumer: &ConsumerId, entries: Vec<InFlight>);

    /// Reload messages recovered from the store.
    fn restore(&mut self, _messages: Vec<Message>) {}

    fn stats(&self, registry: &SubscriptionRegistry) -> DestinationStats;
}

pub(crate) fn engine_for(
    destination: &Destination,
    settings: &BrokerSettings,
) -> Box<dyn DispatchEngine> {
    if destination.is_topic() {
        Box::new(TopicEngine::new(
            destination.clone(),
            settings.retroactive_backlog,
        ))
    } else {
        Box::new(QueueEngine::new(destination.clone()))
    }
}
