// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Ceiling on any serialized gossip payload, including the tag byte.
pub const NETWORK_SIZE_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ManagerParameters {
    /// Peer attempts per block fetch before the fetch fails with `Exhausted`.
    pub max_retries: usize,
    /// Backoff between fetch attempts, also used while no peer is known.
    pub retry_sleep: Duration,
    /// Period of the advertised-range broadcast.
    pub gossip_frequency: Duration,
    /// Ceiling on serialized gossip size.
    pub network_size_limit: usize,
}

impl Default for ManagerParameters {
    fn default() -> Self {
        Self {
            max_retries: 20,
            retry_sleep: Duration::from_millis(50),
            gossip_frequency: Duration::from_millis(100),
            network_size_limit: NETWORK_SIZE_LIMIT,
        }
    }
}
