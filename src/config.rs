// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Configuration constants.

/// Default time before a requester rejects a remote-get message back to
/// its supplier, in milliseconds.
pub const DEFAULT_REJECT_TIMEOUT_MS: u64 = 30_000;
