//! Bridge oracle library
//!
//! Watchers turn confirmed source-chain bridge events into relay tasks,
//! validators sign them, and senders deliver them to the destination chain.
//! The modules are exposed so integration tests can drive the workers against
//! the in-memory store and the scripted chain client.

pub mod aggregator;
pub mod api;
pub mod chain;
pub mod config;
pub mod contracts;
pub mod db;
pub mod error;
pub mod events;
pub mod metrics;
pub mod sender;
pub mod store;
pub mod testing;
pub mod types;
pub mod watcher;
