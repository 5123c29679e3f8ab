//! The `error` module defines the error types returned by the broker.
//!
//! Every command handler returns `Result<_, BrokerError>`. Connection-level
//! teardown is never reported through these errors to unrelated connections;
//! it only drives the close/redelivery path.

use thiserror::Error;

use crate::destination::Destination;
use crate::persistence::StoreError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The destination was a temporary destination that does not exist
    /// (never created, or destroyed when its owning connection closed).
    #[error("destination {0} is unavailable")]
    DestinationUnavailable(Destination),

    /// The destination name could not be parsed.
    #[error("invalid destination name '{0}'")]
    InvalidDestination(String),

    /// The selector was rejected by the selector evaluator at subscribe time.
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("unknown connection {0}")]
    UnknownConnection(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("unknown producer {0}")]
    UnknownProducer(String),

    #[error("unknown consumer {0}")]
    UnknownConsumer(String),

    /// Another live connection already holds this client id.
    #[error("client id '{0}' is already connected")]
    InvalidClientId(String),

    /// Durable subscriptions are keyed by client id, so one must be set.
    #[error("durable subscription '{0}' requires a connection client id")]
    MissingClientId(String),

    #[error("durable subscription '{name}' for client '{client_id}' is already active")]
    DurableSubscriptionInUse { client_id: String, name: String },

    /// Temporary destinations can only be consumed by the connection that created them.
    #[error("cannot consume from temporary destination {0} owned by another connection")]
    ForeignTemporaryDestination(Destination),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The serialized decision loop has exited.
    #[error("broker service has stopped")]
    ServiceStopped,
}
