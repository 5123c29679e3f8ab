//! Acknowledgment processing.
//!
//! Acks are cumulative: one ack settles the newest matching window entry and
//! everything dispatched before it. A delivered ack only records receipt and
//! leaves the window full; a standard ack consumes the messages and frees
//! window slots; a poison ack consumes them and moves them to the dead
//! letter queue.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use super::engine::Broker;
use super::message::{Message, MessageId};
use crate::connection::ConsumerId;
use crate::destination::Destination;
use crate::subscription::{Dispatch, InFlight};
use crate::utils::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// The client has the messages; dispatch state is unchanged.
    Delivered,
    /// The client consumed the messages.
    Standard,
    /// The client could not process the messages.
    Poison,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageAck {
    pub consumer: ConsumerId,
    pub kind: AckKind,
    /// Concrete destination the acknowledged copy came from.
    pub destination: Destination,
    pub last_message_id: MessageId,
}

impl MessageAck {
    /// Ack everything up to and including `dispatch`.
    pub fn new(kind: AckKind, dispatch: &Dispatch) -> Self {
        Self {
            consumer: dispatch.consumer.clone(),
            kind,
            destination: dispatch.message.destination.clone(),
            last_message_id: dispatch.message.id.clone(),
        }
    }

    pub fn delivered(dispatch: &Dispatch) -> Self {
        Self::new(AckKind::Delivered, dispatch)
    }

    pub fn standard(dispatch: &Dispatch) -> Self {
        Self::new(AckKind::Standard, dispatch)
    }

    pub fn poison(dispatch: &Dispatch) -> Self {
        Self::new(AckKind::Poison, dispatch)
    }
}

impl Broker {
    /// Apply an acknowledgment. Acks for unknown consumers or for messages no
    /// longer in the window are ignored.
    pub fn acknowledge(&mut self, ack: MessageAck) -> Result<(), BrokerError> {
        let Some(subscription) = self.registry.get_mut(&ack.consumer) else {
            debug!("ack from unknown consumer {} ignored", ack.consumer);
            return Ok(());
        };
        let Some(last) = subscription.window.iter().rposition(|entry| {
            entry.message.id == ack.last_message_id && entry.destination == ack.destination
        }) else {
            debug!(
                "ack for {} on {} matches nothing in the window of {}",
                ack.last_message_id, ack.destination, ack.consumer
            );
            return Ok(());
        };

        let browser = subscription.info.browser;
        if ack.kind == AckKind::Delivered && !browser {
            for entry in subscription.window.iter_mut().take(last + 1) {
                entry.delivered = true;
            }
            return Ok(());
        }

        let settled: Vec<InFlight> = subscription.window.drain(..=last).collect();
        let durable = subscription.durable.clone();
        let attached: Vec<Destination> = subscription.attached.iter().cloned().collect();

        // Browsers only hold copies; acking them just frees window slots.
        let mut result = Ok(());
        if !browser {
            if let Some(key) = &durable {
                // queue members of a composite keep their own sequences
                let topic_entries: Vec<InFlight> = settled
                    .iter()
                    .filter(|entry| entry.destination.is_topic())
                    .cloned()
                    .collect();
                result = self
                    .registry
                    .acknowledge_durable(key, &topic_entries)
                    .map_err(BrokerError::from);
            }

            let mut by_destination: BTreeMap<Destination, Vec<InFlight>> = BTreeMap::new();
            for entry in settled {
                by_destination
                    .entry(entry.destination.clone())
                    .or_default()
                    .push(entry);
            }
            for (destination, entries) in by_destination {
                let Some(engine) = self.destinations.get_mut(&destination) else {
                    continue;
                };
                for message in engine.acknowledge(&ack.consumer, &entries) {
                    if let Err(err) = self.settle(&destination, message, ack.kind) {
                        warn!("failed to settle ack on {destination}: {err}");
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
            }
        }

        self.dispatch_all(attached);
        self.reap_failed_consumers();
        result
    }

    fn settle(&mut self, source: &Destination, message: Message, kind: AckKind) -> Result<(), BrokerError> {
        if message.is_persistent() && !source.is_topic() && !source.is_temporary() {
            self.store.remove(source, &message.id)?;
        }
        if kind == AckKind::Poison {
            self.dead_letter(source, message)?;
        }
        Ok(())
    }

    fn dead_letter(&mut self, source: &Destination, mut message: Message) -> Result<(), BrokerError> {
        let dead_letter_queue = Destination::queue(self.settings.dead_letter_queue.clone());
        if source == &dead_letter_queue {
            warn!("dropping poisoned {} from {dead_letter_queue}", message.id);
            return Ok(());
        }
        warn!("{} from {source} moved to {dead_letter_queue}", message.id);
        message.original_destination = Some(source.clone());
        message.destination = dead_letter_queue;
        self.route(message)
    }
}
