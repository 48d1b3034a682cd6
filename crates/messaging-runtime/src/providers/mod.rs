//! Broker implementations.
//!
//! Each provider implements the traits in [`crate::transport`] and
//! [`crate::admin`]. The in-memory broker is the reference implementation
//! used by tests and local development.

pub mod memory;

pub use memory::{HandleEvent, InMemoryBroker, InMemoryBrokerConfig, Transmission};
