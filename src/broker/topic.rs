use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace};

use super::message::Message;
use super::region::{DestinationStats, DispatchEngine};
use crate::connection::ConsumerId;
use crate::destination::Destination;
use crate::subscription::{DurableKey, InFlight, Pending, SubscriptionRegistry};

/// Broadcast dispatch for a single topic.
///
/// Each produced message is copied to every attached subscriber whose filter
/// accepts it at the time it is produced. Durable subscriptions receive
/// copies whether or not a consumer is attached to them. The most recent
/// messages are kept for retroactive subscribers.
#[derive(Debug)]
pub(crate) struct TopicEngine {
    destination: Destination,
    consumers: Vec<ConsumerId>,
    durables: BTreeSet<DurableKey>,
    backlog: VecDeque<(u64, Message)>,
    backlog_limit: usize,
    last_seq: u64,
    enqueued: u64,
    dequeued: u64,
}

impl TopicEngine {
    pub fn new(destination: Destination, backlog_limit: usize) -> Self {
        Self {
            destination,
            consumers: Vec::new(),
            durables: BTreeSet::new(),
            backlog: VecDeque::new(),
            backlog_limit,
            last_seq: 0,
            enqueued: 0,
            dequeued: 0,
        }
    }

    fn remember(&mut self, seq: u64, message: &Message) {
        if self.backlog_limit == 0 {
            return;
        }
        self.backlog.push_back((seq, message.clone()));
        while self.backlog.len() > self.backlog_limit {
            self.backlog.pop_front();
        }
    }

    fn replay_backlog(&self, consumer: &ConsumerId, registry: &mut SubscriptionRegistry) {
        for (seq, message) in &self.backlog {
            if registry.accepts(consumer, message) {
                registry.enqueue_pending(
                    consumer,
                    Pending {
                        destination: self.destination.clone(),
                        seq: *seq,
                        message: message.clone(),
                    },
                );
            }
        }
    }
}

impl DispatchEngine for TopicEngine {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn offer(&mut self, message: Message, registry: &mut SubscriptionRegistry) {
        self.last_seq += 1;
        self.enqueued += 1;
        let seq = self.last_seq;
        self.remember(seq, &message);

        for consumer in &self.consumers {
            if registry.accepts(consumer, &message) {
                registry.enqueue_pending(
                    consumer,
                    Pending {
                        destination: self.destination.clone(),
                        seq,
                        message: message.clone(),
                    },
                );
            }
        }
        for key in &self.durables {
            registry.offer_durable(key, &self.destination, &message);
        }
        trace!("{} offered to {}", message.id, self.destination);
        self.dispatch(registry);
    }

    fn attach(&mut self, consumer: &ConsumerId, registry: &mut SubscriptionRegistry) {
        let Some(subscription) = registry.get(consumer) else {
            return;
        };
        let retroactive = subscription.info.retroactive;

        match subscription.durable.clone() {
            Some(key) => {
                if self.durables.insert(key.clone()) && retroactive {
                    for (_, message) in &self.backlog {
                        registry.offer_durable(&key, &self.destination, message);
                    }
                }
            }
            None => {
                if self.consumers.contains(consumer) {
                    return;
                }
                self.consumers.push(consumer.clone());
                if retroactive {
                    self.replay_backlog(consumer, registry);
                }
            }
        }
        debug!("{consumer} attached to {}", self.destination);
    }

    fn detach(&mut self, consumer: &ConsumerId) {
        self.consumers.retain(|c| c != consumer);
    }

    fn attach_durable(&mut self, key: &DurableKey) {
        self.durables.insert(key.clone());
    }

    fn forget_durable(&mut self, key: &DurableKey) {
        self.durables.remove(key);
    }

    fn dispatch(&mut self, registry: &mut SubscriptionRegistry) {
        for consumer in &self.consumers {
            registry.pump(consumer);
        }
        for key in &self.durables {
            registry.pump_durable(key);
        }
    }

    fn acknowledge(&mut self, _consumer: &ConsumerId, entries: &[InFlight]) -> Vec<Message> {
        self.dequeued += entries.len() as u64;
        entries.iter().map(|e| e.message.clone()).collect()
    }

    fn reclaim(&mut self, consumer: &ConsumerId, entries: Vec<InFlight>) {
        if !entries.is_empty() {
            debug!(
                "dropping {} unacknowledged messages of {consumer} on {}",
                entries.len(),
                self.destination
            );
        }
    }

    fn stats(&self, registry: &SubscriptionRegistry) -> DestinationStats {
        let active_durables = self
            .durables
            .iter()
            .filter(|k| registry.durable(k).is_some_and(|d| d.active.is_some()))
            .count();
        DestinationStats {
            depth: registry.pending_from(&self.destination),
            in_flight: registry.in_flight_from(&self.destination),
            consumers: self.consumers.len() + active_durables,
            enqueued: self.enqueued,
            dequeued: self.dequeued,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::{ConnectionId, SessionId};
    use crate::persistence::MemoryStore;
    use crate::selector::SimpleSelector;
    use crate::subscription::{ConsumerInfo, Subscription};

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(
            Arc::new(SimpleSelector::default()),
            Arc::new(MemoryStore::default()),
        )
    }

    #[test]
    fn test_backlog_is_bounded() {
        let mut topic = TopicEngine::new(Destination::topic("T"), 2);
        let mut registry = registry();
        for n in 1..=3 {
            topic.offer(Message::new(Destination::topic("T"), format!("m{n}")), &mut registry);
        }
        let kept: Vec<_> = topic.backlog.iter().map(|(_, m)| m.payload.as_str()).collect();
        assert_eq!(kept, vec!["m2", "m3"]);
        assert_eq!(topic.stats(&registry).enqueued, 3);
    }

    #[test]
    fn test_retroactive_attach_replays_backlog() {
        let mut topic = TopicEngine::new(Destination::topic("T"), 10);
        let mut registry = registry();
        topic.offer(Message::new(Destination::topic("T"), "early"), &mut registry);

        let consumer = ConsumerId {
            session: SessionId {
                connection: ConnectionId::generate(),
                value: 1,
            },
            value: 1,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert(Subscription::new(
            consumer.clone(),
            ConsumerInfo::new(Destination::topic("T")).retroactive(),
            10,
            None,
            tx,
        ));
        topic.attach(&consumer, &mut registry);
        topic.dispatch(&mut registry);

        assert_eq!(rx.try_recv().unwrap().message.payload, "early");
    }
}
