//! Destination naming and resolution
//!
//! A `Destination` is a kind plus a physical name. Names may be:
//! - simple: `ORDERS`
//! - hierarchical wildcards over dot-delimited segments: `*` matches exactly
//!   one segment, `>` matches one or more trailing segments (`WILD.*.TEST`,
//!   `PRICES.>`)
//! - composite: comma-separated members, each optionally carrying its own
//!   kind prefix (`A,B`, `A,topic://B`)
//!
//! Wildcard and composite destinations are logical only. The broker resolves
//! them to the concrete destinations that actually hold messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::BrokerError;

const SEGMENT_SEPARATOR: char = '.';
const COMPOSITE_SEPARATOR: char = ',';
const ANY_SEGMENT: &str = "*";
const ANY_DESCENDANT: &str = ">";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
    TempQueue,
    TempTopic,
}

impl DestinationKind {
    pub fn is_topic(self) -> bool {
        matches!(self, Self::Topic | Self::TempTopic)
    }

    pub fn is_temporary(self) -> bool {
        matches!(self, Self::TempQueue | Self::TempTopic)
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Queue => "queue://",
            Self::Topic => "topic://",
            Self::TempQueue => "temp-queue://",
            Self::TempTopic => "temp-topic://",
        }
    }

    const ALL: [DestinationKind; 4] = [
        DestinationKind::TempQueue,
        DestinationKind::TempTopic,
        DestinationKind::Queue,
        DestinationKind::Topic,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    kind: DestinationKind,
    name: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }

    pub fn temp_queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::TempQueue, name)
    }

    pub fn temp_topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::TempTopic, name)
    }

    /// Parse a `kind://name` URI, e.g. `queue://A,B` or `topic://PRICES.>`.
    pub fn parse(uri: &str) -> Result<Self, BrokerError> {
        let (kind, name) = split_prefix(uri)
            .ok_or_else(|| BrokerError::InvalidDestination(uri.to_string()))?;
        let destination = Self::new(kind, name);
        destination.validate()?;
        Ok(destination)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_topic(&self) -> bool {
        self.kind.is_topic()
    }

    pub fn is_temporary(&self) -> bool {
        self.kind.is_temporary()
    }

    pub fn is_composite(&self) -> bool {
        self.name.contains(COMPOSITE_SEPARATOR)
    }

    pub fn is_wildcard(&self) -> bool {
        self.members().iter().any(|m| {
            m.name
                .split(SEGMENT_SEPARATOR)
                .any(|s| s == ANY_SEGMENT || s == ANY_DESCENDANT)
        })
    }

    /// True when this names exactly one concrete destination.
    pub fn is_concrete(&self) -> bool {
        !self.is_composite() && !self.is_wildcard()
    }

    /// Reject empty names, empty segments, and `>` anywhere but the last segment.
    pub fn validate(&self) -> Result<(), BrokerError> {
        let invalid = || BrokerError::InvalidDestination(self.to_string());
        if self.name.trim().is_empty() {
            return Err(invalid());
        }
        for member in self.members() {
            let segments: Vec<&str> = member.name.split(SEGMENT_SEPARATOR).collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(invalid());
            }
            let last = segments.len() - 1;
            if segments[..last].contains(&ANY_DESCENDANT) {
                return Err(invalid());
            }
        }
        Ok(())
    }

    /// The member destinations of a composite. A non-composite destination is
    /// its own single member.
    pub fn members(&self) -> Vec<Destination> {
        if !self.is_composite() {
            return vec![self.clone()];
        }
        self.name
            .split(COMPOSITE_SEPARATOR)
            .map(str::trim)
            .map(|member| match split_prefix(member) {
                Some((kind, name)) => Destination::new(kind, name),
                None => Destination::new(self.kind, member),
            })
            .collect()
    }

    /// Whether `concrete` is addressed by this (possibly composite or
    /// wildcard) destination. Kinds must agree member by member.
    pub fn matches(&self, concrete: &Destination) -> bool {
        self.members().iter().any(|member| {
            member.kind == concrete.kind
                && segments_match(
                    &member.name.split(SEGMENT_SEPARATOR).collect::<Vec<_>>(),
                    &concrete.name.split(SEGMENT_SEPARATOR).collect::<Vec<_>>(),
                )
        })
    }

    /// Resolve to concrete destinations. Plain members resolve to themselves
    /// (they are materialized on demand); wildcard members resolve to the
    /// matching entries of `existing`.
    pub fn resolve<'a, I>(&self, existing: I) -> Vec<Destination>
    where
        I: IntoIterator<Item = &'a Destination> + Clone,
    {
        let mut resolved: Vec<Destination> = Vec::new();
        for member in self.members() {
            if member.is_wildcard() {
                for candidate in existing.clone() {
                    if member.matches(candidate) && !resolved.contains(candidate) {
                        resolved.push(candidate.clone());
                    }
                }
            } else if !resolved.contains(&member) {
                resolved.push(member);
            }
        }
        resolved
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.name)
    }
}

fn split_prefix(uri: &str) -> Option<(DestinationKind, &str)> {
    DestinationKind::ALL
        .iter()
        .find_map(|kind| uri.strip_prefix(kind.prefix()).map(|name| (*kind, name)))
}

fn segments_match(pattern: &[&str], name: &[&str]) -> bool {
    match (pattern.split_first(), name.split_first()) {
        (None, None) => true,
        (Some((&ANY_DESCENDANT, rest)), _) => rest.is_empty() && !name.is_empty(),
        (Some((p, p_rest)), Some((n, n_rest))) => {
            (*p == ANY_SEGMENT || p == n) && segments_match(p_rest, n_rest)
        }
        _ => false,
    }
}
