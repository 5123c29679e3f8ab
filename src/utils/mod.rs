//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `relaymq` crate.
//!
//! - `error`: the typed failures returned by every command handler.
//! - `logging`: `tracing` subscriber setup.

pub mod error;
pub mod logging;

pub use error::BrokerError;

#[cfg(test)]
mod tests;
