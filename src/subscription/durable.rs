use std::collections::VecDeque;

use tracing::warn;

use super::{ConsumerInfo, DurableKey, InFlight, Pending};
use crate::broker::message::Message;
use crate::connection::ConsumerId;

/// A named topic subscription that keeps matching messages while no
/// consumer is attached to it.
#[derive(Debug)]
pub struct DurableSubscription {
    pub key: DurableKey,
    pub info: ConsumerInfo,
    pub active: Option<ConsumerId>,
    /// Last sequence standard-acknowledged by a consumer.
    pub cursor: u64,
    pub(crate) pending: VecDeque<Pending>,
    next_seq: u64,
}

impl DurableSubscription {
    /// `cursor` is the last acknowledged sequence recovered from the store.
    pub fn new(key: DurableKey, info: ConsumerInfo, cursor: u64) -> Self {
        Self {
            key,
            info,
            active: None,
            cursor,
            pending: VecDeque::new(),
            next_seq: cursor,
        }
    }

    /// Reload persistent messages held before a restart. Anything at or
    /// below the cursor was already acknowledged.
    pub(crate) fn restore(&mut self, held: Vec<(u64, Message)>) {
        for (seq, message) in held {
            self.next_seq = self.next_seq.max(seq);
            if seq > self.cursor {
                self.pending.push_back(Pending {
                    destination: message.destination.clone(),
                    seq,
                    message,
                });
            }
        }
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether reconnecting with `info` keeps this subscription's backlog.
    pub fn is_compatible(&self, info: &ConsumerInfo) -> bool {
        self.info.destination == info.destination && self.info.selector == info.selector
    }

    /// Buffer a message while offline, dropping the oldest past `limit`.
    /// Returns what was dropped.
    pub(crate) fn hold(&mut self, pending: Pending, limit: usize) -> Vec<Pending> {
        self.pending.push_back(pending);
        self.trim(limit)
    }

    fn trim(&mut self, limit: usize) -> Vec<Pending> {
        let excess = self.pending.len().saturating_sub(limit.max(1));
        let dropped: Vec<Pending> = self.pending.drain(..excess).collect();
        for pending in &dropped {
            warn!(
                "durable {} over its pending limit, dropping {}",
                self.key, pending.message.id
            );
        }
        dropped
    }

    /// Take back everything a closing consumer held: its window first, marked
    /// redelivered, then whatever was still pending for it. Returns what
    /// the pending limit dropped.
    pub(crate) fn reclaim(
        &mut self,
        window: Vec<InFlight>,
        pending: VecDeque<Pending>,
        limit: usize,
    ) -> Vec<Pending> {
        let mut restored: VecDeque<Pending> = window
            .into_iter()
            .map(|f| {
                let mut message = f.message;
                message.mark_redelivered();
                Pending {
                    destination: f.destination,
                    seq: f.seq,
                    message,
                }
            })
            .collect();
        restored.extend(pending);
        restored.extend(self.pending.drain(..));
        self.pending = restored;
        self.active = None;
        self.trim(limit)
    }

    /// Hand the backlog to a newly attached consumer, skipping anything at or
    /// below the acknowledged cursor.
    pub(crate) fn activate(&mut self, consumer: ConsumerId) -> VecDeque<Pending> {
        self.active = Some(consumer);
        let cursor = self.cursor;
        self.pending.drain(..).filter(|p| p.seq > cursor).collect()
    }
}
