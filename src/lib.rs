// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! courier-kernel: transactional message-item store core for the courier
//! point-to-point messaging engine.
//!
//! The kernel ties message persistence to transaction outcomes and hands
//! guaranteed-delivery messages to consumers that may be local or on a
//! remote engine:
//! - message envelopes with lazy body materialisation and a computed
//!   storage strategy (`item`),
//! - fixed-capacity, insertion-ordered event listener slots with the
//!   documented dispatch orders (`events`),
//! - the anycast request/lock/accept/reject/flush handshake for handing a
//!   single message instance to exactly one remote consumer (`anycast`),
//! - the schema-versioned binary record contract consumed by the durable
//!   log (`record`, `store`).
//!
//! The kernel owns no threads and installs no tracing subscriber. All
//! lifecycle transitions are driven synchronously by whatever drives the
//! transaction outcome; locks are scoped to a single entity instance.

pub mod anycast;
pub mod body;
pub mod config;
pub mod error;
pub mod events;
pub mod item;
pub mod record;
pub mod store;
pub mod txn;
pub mod types;

#[cfg(test)]
pub mod tests;

pub use error::{Result, StoreError};
