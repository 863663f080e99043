// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Anycast remote-get protocol state.
//!
//! A requesting engine obtains a single, one-off message instance from
//! exactly one remote source engine per request tick. The requester side
//! persists a [`RequestItem`] per outstanding tick; the supplier side
//! persists a [`ValueTick`] per message instance handed out; the requester
//! wraps the delivered message in a [`RemoteMessage`] envelope that routes
//! accept/reject decisions back through the handshake at transaction
//! boundaries. All three survive engine restarts and tolerate rollbacks on
//! either side.

pub mod chains;
pub mod gate;
pub mod remote;
pub mod request;
pub mod value;

pub use chains::TickChains;
pub use gate::OrderGate;
pub use remote::{AnycastResponder, RemoteDispatchKey, RemoteMessage};
pub use request::{ProtocolState, RequestCallback, RequestItem};
pub use value::ValueTick;
