//! Subscription registry
//!
//! Tracks every live consumer together with its in-flight window, plus the
//! durable topic subscriptions that outlive their consumers. Destinations
//! keep only consumer ids; the registry owns the per-consumer state so that
//! one consumer attached to several concrete destinations (wildcard or
//! composite) has a single window bounded by its prefetch.
//!
//! Matched-but-undispatched messages are bounded per consumer and per offline
//! durable subscription; past the bound the oldest are dropped. Persistent
//! messages routed to a durable subscription are written to the store until
//! acknowledged or dropped.

mod durable;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};

pub use durable::DurableSubscription;

use crate::broker::message::Message;
use crate::config::BrokerSettings;
use crate::connection::ConsumerId;
use crate::destination::Destination;
use crate::persistence::{DurableRecord, MessageStore, StoreError};
use crate::selector::SelectorEvaluator;

/// One message pushed to a consumer's delivery sink.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub consumer: ConsumerId,
    pub message: Message,
}

/// Outbound channel for a consumer. Flow control happens through the prefetch
/// window, never by blocking this channel.
pub type DeliverySink = UnboundedSender<Dispatch>;

/// Subscription attributes supplied when a consumer attaches.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    /// May be composite or wildcard.
    pub destination: Destination,
    pub selector: Option<String>,
    /// `None` uses the broker's configured default. `0` delivers only on `pull`.
    pub prefetch: Option<u32>,
    pub browser: bool,
    pub exclusive: bool,
    pub no_local: bool,
    /// Makes a topic subscription durable under the connection's client id.
    pub subscription_name: Option<String>,
    pub retroactive: bool,
}

impl ConsumerInfo {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            selector: None,
            prefetch: None,
            browser: false,
            exclusive: false,
            no_local: false,
            subscription_name: None,
            retroactive: false,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn durable(mut self, subscription_name: impl Into<String>) -> Self {
        self.subscription_name = Some(subscription_name.into());
        self
    }

    pub fn browser(mut self) -> Self {
        self.browser = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn retroactive(mut self) -> Self {
        self.retroactive = true;
        self
    }
}

/// Identity of a durable subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DurableKey {
    pub client_id: String,
    pub name: String,
}

impl DurableKey {
    pub fn new(client_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DurableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_id, self.name)
    }
}

/// A dispatched, not yet standard-acknowledged message.
///
/// `seq` is the position the owning destination (or durable subscription)
/// uses to find the message again on ack or reclaim.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub destination: Destination,
    pub seq: u64,
    pub message: Message,
    pub delivered: bool,
}

/// A message matched for a topic subscriber but not yet dispatched.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub destination: Destination,
    pub seq: u64,
    pub message: Message,
}

#[derive(Debug)]
pub(crate) struct Subscription {
    pub id: ConsumerId,
    pub info: ConsumerInfo,
    pub prefetch: u32,
    pub durable: Option<DurableKey>,
    pub window: VecDeque<InFlight>,
    pub pending: VecDeque<Pending>,
    /// Concrete destinations this consumer is attached to.
    pub attached: BTreeSet<Destination>,
    /// Set once teardown starts or the sink is found closed.
    pub closing: bool,
    pull_credit: u32,
    sink: DeliverySink,
}

impl Subscription {
    pub fn new(
        id: ConsumerId,
        info: ConsumerInfo,
        prefetch: u32,
        durable: Option<DurableKey>,
        sink: DeliverySink,
    ) -> Self {
        Self {
            id,
            info,
            prefetch,
            durable,
            window: VecDeque::new(),
            pending: VecDeque::new(),
            attached: BTreeSet::new(),
            closing: false,
            pull_credit: 0,
            sink,
        }
    }

    pub fn has_capacity(&self) -> bool {
        !self.closing && (self.window.len() < self.prefetch as usize || self.pull_credit > 0)
    }

    pub fn grant_pull(&mut self) {
        if self.prefetch == 0 {
            self.pull_credit += 1;
        }
    }

    /// Queue a matched message, dropping the oldest past `limit`.
    fn queue(&mut self, pending: Pending, limit: usize) -> Vec<Pending> {
        self.pending.push_back(pending);
        let excess = self.pending.len().saturating_sub(limit.max(1));
        self.pending.drain(..excess).collect()
    }

    /// Push into the window and the sink. Returns false if the sink is gone.
    fn deliver(&mut self, in_flight: InFlight) -> bool {
        if self.window.len() >= self.prefetch as usize {
            self.pull_credit = self.pull_credit.saturating_sub(1);
        }
        trace!(
            "dispatch {} from {} to {}",
            in_flight.message.id, in_flight.destination, self.id
        );
        let dispatch = Dispatch {
            consumer: self.id.clone(),
            message: in_flight.message.clone(),
        };
        self.window.push_back(in_flight);
        self.sink.send(dispatch).is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct SubscriptionRegistry {
    subscriptions: HashMap<ConsumerId, Subscription>,
    durables: BTreeMap<DurableKey, DurableSubscription>,
    selectors: Arc<dyn SelectorEvaluator>,
    store: Arc<dyn MessageStore>,
    subscriber_pending_limit: usize,
    durable_pending_limit: usize,
    failed: Vec<ConsumerId>,
}

impl SubscriptionRegistry {
    pub fn new(selectors: Arc<dyn SelectorEvaluator>, store: Arc<dyn MessageStore>) -> Self {
        let defaults = BrokerSettings::default();
        Self {
            subscriptions: HashMap::new(),
            durables: BTreeMap::new(),
            selectors,
            store,
            subscriber_pending_limit: defaults.subscriber_pending_limit,
            durable_pending_limit: defaults.durable_pending_limit,
            failed: Vec::new(),
        }
    }

    pub fn with_limits(mut self, settings: &BrokerSettings) -> Self {
        self.subscriber_pending_limit = settings.subscriber_pending_limit;
        self.durable_pending_limit = settings.durable_pending_limit;
        self
    }

    pub fn validate_selector(&self, selector: &str) -> Result<(), String> {
        self.selectors.validate(selector)
    }

    pub fn insert(&mut self, subscription: Subscription) {
        self.subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub fn remove(&mut self, id: &ConsumerId) -> Option<Subscription> {
        self.subscriptions.remove(id)
    }

    pub fn get(&self, id: &ConsumerId) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    pub fn get_mut(&mut self, id: &ConsumerId) -> Option<&mut Subscription> {
        self.subscriptions.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Live consumers whose destination expression addresses `destination`
    /// but which are not attached to it yet, in id order.
    pub fn unattached_matching(&self, destination: &Destination) -> Vec<ConsumerId> {
        let mut ids: Vec<ConsumerId> = self
            .subscriptions
            .values()
            .filter(|s| !s.closing && !s.attached.contains(destination))
            .filter(|s| s.info.destination.matches(destination))
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn mark_attached(&mut self, id: &ConsumerId, destination: &Destination) -> bool {
        self.subscriptions
            .get_mut(id)
            .is_some_and(|s| s.attached.insert(destination.clone()))
    }

    pub fn has_capacity(&self, id: &ConsumerId) -> bool {
        self.subscriptions.get(id).is_some_and(Subscription::has_capacity)
    }

    /// No-local and selector filtering for a live consumer.
    pub fn accepts(&self, id: &ConsumerId, message: &Message) -> bool {
        let Some(subscription) = self.subscriptions.get(id) else {
            return false;
        };
        if subscription.closing {
            return false;
        }
        if subscription.info.no_local
            && message.producer_connection.as_ref() == Some(id.connection())
        {
            return false;
        }
        self.selector_accepts(subscription.info.selector.as_deref(), message)
    }

    fn selector_accepts(&self, selector: Option<&str>, message: &Message) -> bool {
        match selector {
            None => true,
            Some(expr) => self.selectors.evaluate(expr, &message.properties),
        }
    }

    /// Hand a message straight to a consumer's window.
    pub fn deliver(&mut self, id: &ConsumerId, in_flight: InFlight) {
        let Some(subscription) = self.subscriptions.get_mut(id) else {
            return;
        };
        if !subscription.deliver(in_flight) {
            warn!("delivery sink for {id} is closed, closing consumer");
            subscription.closing = true;
            self.failed.push(id.clone());
        }
    }

    pub fn enqueue_pending(&mut self, id: &ConsumerId, pending: Pending) {
        let Some(subscription) = self.subscriptions.get_mut(id) else {
            return;
        };
        let dropped = subscription.queue(pending, self.subscriber_pending_limit);
        if dropped.is_empty() {
            return;
        }
        for pending in &dropped {
            warn!("{id} over its pending limit, dropping {}", pending.message.id);
        }
        if let Some(key) = subscription.durable.clone() {
            self.release_held(&key, &dropped);
        }
    }

    /// Move pending messages into the window while it has room.
    pub fn pump(&mut self, id: &ConsumerId) {
        loop {
            let Some(subscription) = self.subscriptions.get_mut(id) else {
                return;
            };
            if !subscription.has_capacity() {
                return;
            }
            let Some(next) = subscription.pending.pop_front() else {
                return;
            };
            self.deliver(
                id,
                InFlight {
                    destination: next.destination,
                    seq: next.seq,
                    message: next.message,
                    delivered: false,
                },
            );
        }
    }

    /// Consumers whose sinks were found closed since the last call.
    pub fn take_failed(&mut self) -> Vec<ConsumerId> {
        std::mem::take(&mut self.failed)
    }

    /// Drop every trace of a destroyed destination from live consumers.
    pub fn forget_destination(&mut self, destination: &Destination) {
        for subscription in self.subscriptions.values_mut() {
            if subscription.attached.remove(destination) {
                subscription
                    .window
                    .retain(|f| &f.destination != destination);
                subscription
                    .pending
                    .retain(|p| &p.destination != destination);
            }
        }
    }

    /// Number of in-flight messages that came from `destination`.
    pub fn in_flight_from(&self, destination: &Destination) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.attached.contains(destination))
            .map(|s| {
                s.window
                    .iter()
                    .filter(|f| &f.destination == destination)
                    .count()
            })
            .sum()
    }

    /// Number of matched-but-undispatched messages from `destination`,
    /// including those held for offline durable subscriptions.
    pub fn pending_from(&self, destination: &Destination) -> usize {
        let live: usize = self
            .subscriptions
            .values()
            .map(|s| {
                s.pending
                    .iter()
                    .filter(|p| &p.destination == destination)
                    .count()
            })
            .sum();
        let offline: usize = self
            .durables
            .values()
            .map(|d| {
                d.pending
                    .iter()
                    .filter(|p| &p.destination == destination)
                    .count()
            })
            .sum();
        live + offline
    }

    pub fn durable(&self, key: &DurableKey) -> Option<&DurableSubscription> {
        self.durables.get(key)
    }

    pub fn durable_mut(&mut self, key: &DurableKey) -> Option<&mut DurableSubscription> {
        self.durables.get_mut(key)
    }

    pub fn insert_durable(&mut self, durable: DurableSubscription) {
        self.durables.insert(durable.key.clone(), durable);
    }

    /// Register a new durable subscription and record it in the store.
    pub fn create_durable(
        &mut self,
        key: DurableKey,
        info: &ConsumerInfo,
        cursor: u64,
    ) -> Result<(), StoreError> {
        self.store.save_durable(&DurableRecord::new(key.clone(), info))?;
        self.insert_durable(DurableSubscription::new(key, info.clone(), cursor));
        Ok(())
    }

    /// Rebuild every durable subscription recorded in the store, offline,
    /// with the persistent messages it still holds.
    pub fn recover_durables(&mut self) -> Result<usize, StoreError> {
        let records = self.store.load_durables()?;
        let recovered = records.len();
        for record in records {
            let cursor = self.store.read_cursor(&record.key)?.unwrap_or_default();
            let mut durable =
                DurableSubscription::new(record.key.clone(), record.consumer_info(), cursor);
            durable.restore(self.store.held(&record.key)?);
            debug!(
                "recovered durable {} at cursor {cursor} holding {}",
                record.key,
                durable.pending_len()
            );
            self.insert_durable(durable);
        }
        Ok(recovered)
    }

    /// Forget a durable subscription here and in the store.
    pub fn remove_durable(&mut self, key: &DurableKey) -> Result<Option<DurableSubscription>, StoreError> {
        self.store.delete_durable(key)?;
        Ok(self.durables.remove(key))
    }

    /// Record acknowledged topic entries: advance the cursor and release
    /// the held copies.
    pub fn acknowledge_durable(&mut self, key: &DurableKey, settled: &[InFlight]) -> Result<(), StoreError> {
        let Some(durable) = self.durables.get_mut(key) else {
            return Ok(());
        };
        let newest = settled.iter().map(|entry| entry.seq).max().unwrap_or_default();
        if newest > durable.cursor {
            durable.cursor = newest;
            self.store.write_cursor(key, newest)?;
        }
        for entry in settled.iter().filter(|e| e.message.is_persistent()) {
            self.store.release(key, entry.seq)?;
        }
        Ok(())
    }

    /// Hand a closing consumer's topic entries back to its durable
    /// subscription.
    pub fn reclaim_durable(&mut self, key: &DurableKey, window: Vec<InFlight>, pending: VecDeque<Pending>) {
        let limit = self.durable_pending_limit;
        let Some(durable) = self.durables.get_mut(key) else {
            return;
        };
        let dropped = durable.reclaim(window, pending, limit);
        debug!("durable subscription {key} is offline with {} held", durable.pending_len());
        self.release_held(key, &dropped);
    }

    fn persist_held(&self, key: &DurableKey, pending: &Pending) {
        if !pending.message.is_persistent() {
            return;
        }
        if let Err(err) = self.store.hold(key, pending.seq, &pending.message) {
            warn!("failed to store {} for durable {key}: {err}", pending.message.id);
        }
    }

    fn release_held(&self, key: &DurableKey, dropped: &[Pending]) {
        for pending in dropped.iter().filter(|p| p.message.is_persistent()) {
            if let Err(err) = self.store.release(key, pending.seq) {
                warn!("failed to release {} for durable {key}: {err}", pending.message.id);
            }
        }
    }

    /// Offline durables whose destination addresses `destination`.
    pub fn offline_durables_matching(&self, destination: &Destination) -> Vec<DurableKey> {
        self.durables
            .values()
            .filter(|d| d.active.is_none() && d.info.destination.matches(destination))
            .map(|d| d.key.clone())
            .collect()
    }

    /// Route a topic message to a durable subscription, live or offline.
    pub fn offer_durable(&mut self, key: &DurableKey, destination: &Destination, message: &Message) {
        let Some(durable) = self.durables.get_mut(key) else {
            return;
        };
        let seq = durable.next_seq();
        let pending = Pending {
            destination: destination.clone(),
            seq,
            message: message.clone(),
        };

        match durable.active.clone() {
            Some(consumer) => {
                if self.accepts(&consumer, message) {
                    self.persist_held(key, &pending);
                    self.enqueue_pending(&consumer, pending);
                }
            }
            None => {
                let selector = durable.info.selector.clone();
                if !self.selector_accepts(selector.as_deref(), message) {
                    return;
                }
                self.persist_held(key, &pending);
                let limit = self.durable_pending_limit;
                let dropped = match self.durables.get_mut(key) {
                    Some(durable) => durable.hold(pending, limit),
                    None => Vec::new(),
                };
                self.release_held(key, &dropped);
            }
        }
    }

    pub fn pump_durable(&mut self, key: &DurableKey) {
        let active = self.durables.get(key).and_then(|d| d.active.clone());
        if let Some(consumer) = active {
            self.pump(&consumer);
        } else {
            debug!("durable {key} is offline, holding messages");
        }
    }
}
