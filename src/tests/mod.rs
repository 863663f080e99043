// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Scenario tests spanning the envelope, dispatch and protocol modules.

pub mod lifecycle_tests;

use crate::body::MessageBody;
use crate::types::{ConnectionId, MessageId, Reliability};

pub fn sample_body(reliability: Reliability) -> MessageBody {
    MessageBody {
        message_id: MessageId(101),
        reliability,
        priority: 4,
        time_to_live: 120_000,
        wait_time: 1_000,
        arrival_timestamp: 1_700_000_000_000,
        connection_id: Some(ConnectionId(0xC0FFEE)),
        redelivered_count: 0,
        report_expiry: true,
        payload: b"remote-order".to_vec(),
    }
}
