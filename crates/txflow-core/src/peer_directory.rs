// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;
use rand::Rng;

use crate::types::{AdvertisedRange, PeerId, TxHeight};

#[derive(Default)]
struct DirectoryInner {
    /// Latest advertised range per peer. A peer shows up here only after
    /// its first range gossip, which may trail the connect event.
    ranges: AHashMap<PeerId, AdvertisedRange>,
    connected: AHashSet<PeerId>,
}

/// Connected peers and what they claim to hold.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<DirectoryInner>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect(&self, peer: PeerId) {
        self.inner.write().connected.insert(peer);
    }

    pub fn on_disconnect(&self, peer: PeerId) {
        let mut inner = self.inner.write();
        inner.connected.remove(&peer);
        inner.ranges.remove(&peer);
    }

    pub fn update_range(&self, peer: PeerId, range: AdvertisedRange) {
        self.inner.write().ranges.insert(peer, range);
    }

    /// Snapshot of every peer whose advertised range covers `height`.
    pub fn peers_holding(&self, height: TxHeight) -> Vec<PeerId> {
        self.inner
            .read()
            .ranges
            .iter()
            .filter(|(_, range)| range.covers(height))
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Fallback when no advertised range covers the wanted height: any peer
    /// we have heard a range from at all.
    pub fn any_peer<R: Rng>(&self, rng: &mut R) -> Option<PeerId> {
        let inner = self.inner.read();
        if inner.ranges.is_empty() {
            return None;
        }
        let nth = rng.gen_range(0..inner.ranges.len());
        inner.ranges.keys().nth(nth).copied()
    }

    /// Snapshot of the connected set, for gossip fan-out.
    pub fn connected(&self) -> Vec<PeerId> {
        self.inner.read().connected.iter().copied().collect()
    }

    pub fn advertised(&self, peer: &PeerId) -> Option<AdvertisedRange> {
        self.inner.read().ranges.get(peer).copied()
    }
}
