//! Point-to-point dispatch.
//!
//! Every message is held in sequence order until a competing consumer
//! standard-acknowledges it. A message is either ready (no owner) or in
//! flight to exactly one consumer. Redelivered messages keep their sequence,
//! so they go out again ahead of anything produced after them.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use super::message::Message;
use super::region::{DestinationStats, DispatchEngine};
use crate::connection::ConsumerId;
use crate::destination::Destination;
use crate::subscription::{InFlight, SubscriptionRegistry};

#[derive(Debug)]
struct QueueEntry {
    message: Message,
    owner: Option<ConsumerId>,
}

/// Where a browser is in its snapshot. `limit` is the last sequence that
/// existed when the browser attached.
#[derive(Debug, Clone, Copy)]
struct BrowseCursor {
    next: u64,
    limit: u64,
}

#[derive(Debug)]
pub(crate) struct QueueEngine {
    destination: Destination,
    messages: BTreeMap<u64, QueueEntry>,
    /// Competing consumers in attach order.
    consumers: Vec<ConsumerId>,
    browsers: HashMap<ConsumerId, BrowseCursor>,
    /// Round-robin position into `consumers`.
    next: usize,
    last_seq: u64,
    enqueued: u64,
    dequeued: u64,
}

impl QueueEngine {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            messages: BTreeMap::new(),
            consumers: Vec::new(),
            browsers: HashMap::new(),
            next: 0,
            last_seq: 0,
            enqueued: 0,
            dequeued: 0,
        }
    }

    fn push(&mut self, message: Message) {
        self.last_seq += 1;
        self.enqueued += 1;
        self.messages.insert(
            self.last_seq,
            QueueEntry {
                message,
                owner: None,
            },
        );
    }

    /// The first live exclusive consumer in attach order. While one exists
    /// it receives every message its selector accepts.
    fn exclusive_owner(&self, registry: &SubscriptionRegistry) -> Option<ConsumerId> {
        self.consumers
            .iter()
            .find(|c| {
                registry
                    .get(c)
                    .is_some_and(|s| s.info.exclusive && !s.closing)
            })
            .cloned()
    }

    /// Messages the exclusive owner accepts wait for it; anything its
    /// selector rejects goes round-robin to the other consumers.
    fn select(&mut self, message: &Message, registry: &SubscriptionRegistry) -> Option<ConsumerId> {
        let owner = self.exclusive_owner(registry);
        if let Some(owner) = &owner {
            if registry.accepts(owner, message) {
                return registry.has_capacity(owner).then(|| owner.clone());
            }
        }

        let count = self.consumers.len();
        for offset in 0..count {
            let idx = (self.next + offset) % count;
            let candidate = &self.consumers[idx];
            if Some(candidate) == owner.as_ref() {
                continue;
            }
            if registry.has_capacity(candidate) && registry.accepts(candidate, message) {
                self.next = (idx + 1) % count;
                return Some(candidate.clone());
            }
        }
        None
    }

    fn dispatch_ready(&mut self, registry: &mut SubscriptionRegistry) {
        let ready: Vec<u64> = self
            .messages
            .iter()
            .filter(|(_, entry)| entry.owner.is_none())
            .map(|(seq, _)| *seq)
            .collect();

        for seq in ready {
            if !self.consumers.iter().any(|c| registry.has_capacity(c)) {
                break;
            }
            let Some(message) = self.messages.get(&seq).map(|e| e.message.clone()) else {
                continue;
            };
            let Some(target) = self.select(&message, registry) else {
                continue;
            };
            if let Some(entry) = self.messages.get_mut(&seq) {
                entry.owner = Some(target.clone());
            }
            registry.deliver(
                &target,
                InFlight {
                    destination: self.destination.clone(),
                    seq,
                    message,
                    delivered: false,
                },
            );
        }
    }

    /// Browsers get copies of everything up to their snapshot limit,
    /// skipping what was consumed before they reached it.
    fn dispatch_browsers(&mut self, registry: &mut SubscriptionRegistry) {
        let mut browsers: Vec<ConsumerId> = self.browsers.keys().cloned().collect();
        browsers.sort();

        for browser in browsers {
            let Some(cursor) = self.browsers.get_mut(&browser) else {
                continue;
            };
            if cursor.next > cursor.limit {
                continue;
            }
            for (seq, entry) in self.messages.range(cursor.next..=cursor.limit) {
                if !registry.has_capacity(&browser) {
                    break;
                }
                cursor.next = seq + 1;
                if registry.accepts(&browser, &entry.message) {
                    registry.deliver(
                        &browser,
                        InFlight {
                            destination: self.destination.clone(),
                            seq: *seq,
                            message: entry.message.clone(),
                            delivered: false,
                        },
                    );
                }
            }
            if registry.has_capacity(&browser) {
                // Nothing left below the limit.
                cursor.next = cursor.limit + 1;
            }
        }
    }
}

impl DispatchEngine for QueueEngine {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn offer(&mut self, message: Message, registry: &mut SubscriptionRegistry) {
        self.push(message);
        self.dispatch(registry);
    }

    fn attach(&mut self, consumer: &ConsumerId, registry: &mut SubscriptionRegistry) {
        let Some(subscription) = registry.get(consumer) else {
            return;
        };
        if subscription.info.browser {
            self.browsers.entry(consumer.clone()).or_insert(BrowseCursor {
                next: 1,
                limit: self.last_seq,
            });
        } else if !self.consumers.contains(consumer) {
            self.consumers.push(consumer.clone());
        }
        debug!("{consumer} attached to {}", self.destination);
    }

    fn detach(&mut self, consumer: &ConsumerId) {
        self.browsers.remove(consumer);
        if let Some(idx) = self.consumers.iter().position(|c| c == consumer) {
            self.consumers.remove(idx);
            if idx < self.next {
                self.next -= 1;
            }
            if self.next >= self.consumers.len() {
                self.next = 0;
            }
        }
    }

    fn dispatch(&mut self, registry: &mut SubscriptionRegistry) {
        self.dispatch_ready(registry);
        self.dispatch_browsers(registry);
    }

    fn acknowledge(&mut self, consumer: &ConsumerId, entries: &[InFlight]) -> Vec<Message> {
        let mut consumed = Vec::new();
        for entry in entries {
            let owned = self
                .messages
                .get(&entry.seq)
                .is_some_and(|e| e.owner.as_ref() == Some(consumer));
            if !owned {
                continue;
            }
            if let Some(removed) = self.messages.remove(&entry.seq) {
                self.dequeued += 1;
                consumed.push(removed.message);
            }
        }
        consumed
    }

    fn reclaim(&mut self, consumer: &ConsumerId, entries: Vec<InFlight>) {
        for entry in entries {
            if let Some(queued) = self.messages.get_mut(&entry.seq) {
                if queued.owner.as_ref() == Some(consumer) {
                    queued.owner = None;
                    queued.message.mark_redelivered();
                    trace!("{} back to ready on {}", queued.message.id, self.destination);
                }
            }
        }
    }

    fn restore(&mut self, messages: Vec<Message>) {
        for message in messages {
            self.push(message);
        }
    }

    fn stats(&self, _registry: &SubscriptionRegistry) -> DestinationStats {
        DestinationStats {
            depth: self.messages.len(),
            in_flight: self.messages.values().filter(|e| e.owner.is_some()).count(),
            consumers: self.consumers.len() + self.browsers.len(),
            enqueued: self.enqueued,
            dequeued: self.dequeued,
        }
    }
}
