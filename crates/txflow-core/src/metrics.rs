// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_with_registry, register_int_gauge_with_registry, IntCounter, IntGauge,
    Registry,
};

#[derive(Clone)]
pub struct Metrics {
    pub fetched_blocks_total: IntCounter,
    pub fetch_retries_total: IntCounter,
    pub fetch_exhausted_total: IntCounter,
    pub evicted_blocks_total: IntCounter,
    pub verified_blocks_total: IntCounter,
    pub verification_failures_total: IntCounter,
    pub gossip_sent_total: IntCounter,
    pub gossip_received_total: IntCounter,
    pub block_store_entries: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            fetched_blocks_total: register_int_counter_with_registry!(
                "fetched_blocks_total",
                "Number of tx blocks fetched from peers",
                registry,
            )
            .unwrap(),
            fetch_retries_total: register_int_counter_with_registry!(
                "fetch_retries_total",
                "Number of retried tx block fetch attempts",
                registry,
            )
            .unwrap(),
            fetch_exhausted_total: register_int_counter_with_registry!(
                "fetch_exhausted_total",
                "Number of tx block fetches that ran out of retries",
                registry,
            )
            .unwrap(),
            evicted_blocks_total: register_int_counter_with_registry!(
                "evicted_blocks_total",
                "Number of tx blocks evicted below the accepted watermark",
                registry,
            )
            .unwrap(),
            verified_blocks_total: register_int_counter_with_registry!(
                "verified_blocks_total",
                "Number of tx blocks verified successfully",
                registry,
            )
            .unwrap(),
            verification_failures_total: register_int_counter_with_registry!(
                "verification_failures_total",
                "Number of tx block verification failures",
                registry,
            )
            .unwrap(),
            gossip_sent_total: register_int_counter_with_registry!(
                "gossip_sent_total",
                "Number of gossip messages broadcast",
                registry,
            )
            .unwrap(),
            gossip_received_total: register_int_counter_with_registry!(
                "gossip_received_total",
                "Number of gossip messages received",
                registry,
            )
            .unwrap(),
            block_store_entries: register_int_gauge_with_registry!(
                "block_store_entries",
                "Tx blocks currently held in memory",
                registry,
            )
            .unwrap(),
        })
    }
}

pub fn test_metrics() -> Arc<Metrics> {
    Metrics::new(&Registry::new())
}
