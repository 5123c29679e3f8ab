//! The distribution core: per-destination dispatch engines, acknowledgment
//! handling and teardown, all driven through `Broker`.

mod ack;
pub mod engine;
pub mod message;
mod queue;
pub mod region;
mod redelivery;
mod topic;

pub use ack::{AckKind, MessageAck};
pub use engine::Broker;
pub use region::DestinationStats;
