// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use crate::metrics::Metrics;
use crate::types::{TxBlock, TxBlockId, TxHeight};

/// Tracked tx-block plus its verification flags.
///
/// `verifying` is the at-most-one-in-flight claim on the entry; `verified`
/// is the durable success latch and is never cleared once set. Both flags are
/// only touched under the store lock, which is what makes the
/// parent-check-then-claim sequence in `add` race-free against the cascade
/// scan in `mark_verified`.
struct BlockEntry {
    block: Arc<TxBlock>,
    verifying: AtomicBool,
    verified: AtomicBool,
}

impl BlockEntry {
    fn new(block: Arc<TxBlock>) -> Self {
        Self {
            block,
            verifying: AtomicBool::new(false),
            verified: AtomicBool::new(false),
        }
    }

    /// Claim the entry for verification. Wins at most once per conclusion.
    fn try_claim(&self) -> bool {
        self.verifying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Default)]
struct StoreInner {
    entries: AHashMap<TxBlockId, BlockEntry>,
    /// Sibling ids per height; a bucket exists iff at least one entry at
    /// that height does.
    buckets: AHashMap<TxHeight, AHashSet<TxBlockId>>,
    /// One entry per live bucket, keyed by height, for cheap eviction of the
    /// lowest bucket.
    eviction: BinaryHeap<Reverse<TxHeight>>,
}

/// Height-indexed in-memory map of tx-blocks pending acceptance.
///
/// Lower heights may be accepted while a tx-block on a rejected branch shows
/// up later, so entries are only removed once the accepted watermark passes
/// their height.
#[derive(Clone)]
pub struct TxBlockStore {
    inner: Arc<RwLock<StoreInner>>,
    metrics: Arc<Metrics>,
}

impl TxBlockStore {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
            metrics,
        }
    }

    /// Track a tx-block. Returns `(accepted, should_verify)`:
    /// `accepted` is false when the `(height, id)` pair is already present;
    /// `should_verify` is true iff the parent is verified (implicitly so at
    /// the genesis height) and the caller won the verification claim.
    pub fn add(&self, block: Arc<TxBlock>) -> (bool, bool) {
        let inner = &mut *self.inner.write();

        let id = block.id();
        let height = block.height();
        let parent = block.parent();

        if let Some(bucket) = inner.buckets.get_mut(&height) {
            if !bucket.insert(id) {
                return (false, false);
            }
        } else {
            let mut bucket = AHashSet::with_capacity(1);
            bucket.insert(id);
            inner.buckets.insert(height, bucket);
            inner.eviction.push(Reverse(height));
        }
        inner.entries.insert(id, BlockEntry::new(block));
        self.metrics
            .block_store_entries
            .set(inner.entries.len() as i64);

        let parent_verified = height == 0
            || inner
                .entries
                .get(&parent)
                .is_some_and(|entry| entry.verified.load(Ordering::SeqCst));
        if !parent_verified {
            return (true, false);
        }
        let entry = inner.entries.get(&id).expect("entry was just inserted");
        (true, entry.try_claim())
    }

    pub fn get(&self, id: &TxBlockId) -> Option<Arc<TxBlock>> {
        self.inner.read().entries.get(id).map(|e| e.block.clone())
    }

    /// Conclude a verification attempt. On success, latches `verified` and
    /// returns the children at `height + 1` whose verification claim this
    /// call won; siblings with a different parent are left alone. Returns
    /// nothing when the entry was evicted mid-verification.
    pub fn mark_verified(&self, id: &TxBlockId, success: bool) -> Vec<TxBlockId> {
        let inner = self.inner.write();

        let Some(entry) = inner.entries.get(id) else {
            return Vec::new();
        };
        entry.verifying.store(false, Ordering::SeqCst);
        if !success {
            return Vec::new();
        }
        entry.verified.store(true, Ordering::SeqCst);

        let Some(bucket) = inner.buckets.get(&(entry.block.height() + 1)) else {
            return Vec::new();
        };
        let mut to_verify = Vec::new();
        for child_id in bucket {
            let child = inner
                .entries
                .get(child_id)
                .expect("bucket ids always have entries");
            if child.block.parent() != *id {
                continue;
            }
            if !child.try_claim() {
                continue;
            }
            to_verify.push(*child_id);
        }
        to_verify
    }

    /// Drop every bucket strictly below `min`, returning the evicted ids.
    pub fn set_min(&self, min: TxHeight) -> Vec<TxBlockId> {
        let inner = &mut *self.inner.write();

        let mut evicted = Vec::new();
        while let Some(&Reverse(height)) = inner.eviction.peek() {
            if height >= min {
                break;
            }
            inner.eviction.pop();
            if let Some(bucket) = inner.buckets.remove(&height) {
                for id in bucket {
                    inner.entries.remove(&id);
                    evicted.push(id);
                }
            }
        }
        self.metrics
            .block_store_entries
            .set(inner.entries.len() as i64);
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::test_metrics;
    use crate::types::Transaction;
    use proptest::prelude::*;

    fn block(parent: TxBlockId, height: TxHeight, salt: u8) -> Arc<TxBlock> {
        let txs = vec![Transaction::new(vec![salt; 4])];
        Arc::new(TxBlock::new(parent, height, txs).unwrap())
    }

    fn store() -> TxBlockStore {
        TxBlockStore::new(test_metrics())
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let store = store();
        let a = block(TxBlockId::ZERO, 0, 1);
        assert_eq!(store.add(a.clone()), (true, true));
        assert_eq!(store.add(a), (false, false));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn linear_add_verify_cascade() {
        // Scenario: child added after its parent verified claims itself.
        let store = store();
        let genesis = block(TxBlockId::ZERO, 0, 1);
        assert_eq!(store.add(genesis.clone()), (true, true));
        assert!(store.mark_verified(&genesis.id(), true).is_empty());

        let a = block(genesis.id(), 1, 2);
        assert_eq!(store.add(a.clone()), (true, true));
        assert!(store.mark_verified(&a.id(), true).is_empty());

        let b = block(a.id(), 2, 3);
        assert_eq!(store.add(b.clone()), (true, true));
    }

    #[test]
    fn out_of_order_arrival_wakes_child() {
        // Scenario: child arrives before its parent; the parent's success
        // hands the child back exactly once.
        let store = store();
        let genesis = block(TxBlockId::ZERO, 0, 1);
        let a = block(genesis.id(), 1, 2);
        let b = block(a.id(), 2, 3);

        assert_eq!(store.add(genesis.clone()), (true, true));
        store.mark_verified(&genesis.id(), true);

        assert_eq!(store.add(b.clone()), (true, false));
        assert_eq!(store.add(a.clone()), (true, true));

        let woken = store.mark_verified(&a.id(), true);
        assert_eq!(woken, vec![b.id()]);
        // The child's claim is already taken; a second success of the parent
        // must not hand it out again.
        assert!(store.mark_verified(&a.id(), true).is_empty());
    }

    #[test]
    fn sibling_branches_cascade_independently() {
        let store = store();
        let genesis = block(TxBlockId::ZERO, 0, 1);
        assert_eq!(store.add(genesis.clone()), (true, true));
        store.mark_verified(&genesis.id(), true);

        let a1 = block(genesis.id(), 1, 2);
        let a2 = block(genesis.id(), 1, 3);
        assert_eq!(store.add(a1.clone()), (true, true));
        assert_eq!(store.add(a2.clone()), (true, true));

        let b = block(a1.id(), 2, 4);
        assert_eq!(store.add(b.clone()), (true, false));

        assert!(store.mark_verified(&a2.id(), true).is_empty());
        assert_eq!(store.mark_verified(&a1.id(), true), vec![b.id()]);
    }

    #[test]
    fn failed_verification_releases_the_claim() {
        let store = store();
        let genesis = block(TxBlockId::ZERO, 0, 1);
        assert_eq!(store.add(genesis.clone()), (true, true));
        assert!(store.mark_verified(&genesis.id(), false).is_empty());

        // A failed attempt must not latch `verified`: a child added later
        // waits instead of claiming itself.
        let a = block(genesis.id(), 1, 2);
        assert_eq!(store.add(a), (true, false));

        // The claim is re-takeable after the failure.
        let entry_claimed = {
            let inner = store.inner.read();
            inner.entries.get(&genesis.id()).unwrap().try_claim()
        };
        assert!(entry_claimed);
    }

    #[test]
    fn eviction_drops_only_lower_heights() {
        let store = store();
        let genesis = block(TxBlockId::ZERO, 0, 1);
        let a = block(genesis.id(), 1, 2);
        let b = block(a.id(), 2, 3);
        store.add(genesis.clone());
        store.add(a.clone());
        store.add(b.clone());

        let mut evicted = store.set_min(2);
        evicted.sort();
        let mut expected = vec![genesis.id(), a.id()];
        expected.sort();
        assert_eq!(evicted, expected);

        assert!(store.get(&genesis.id()).is_none());
        assert!(store.get(&a.id()).is_none());
        assert!(store.get(&b.id()).is_some());

        // Nothing below the watermark is left to evict.
        assert!(store.set_min(2).is_empty());
    }

    #[test]
    fn mark_verified_after_eviction_is_a_noop() {
        let store = store();
        let genesis = block(TxBlockId::ZERO, 0, 1);
        store.add(genesis.clone());
        store.set_min(1);
        assert!(store.mark_verified(&genesis.id(), true).is_empty());
    }

    fn assert_consistent(store: &TxBlockStore) {
        let inner = store.inner.read();
        for (id, entry) in &inner.entries {
            let bucket = inner
                .buckets
                .get(&entry.block.height())
                .expect("entry height has a bucket");
            assert!(bucket.contains(id), "entry id is in its height bucket");
        }
        for (height, bucket) in &inner.buckets {
            assert!(!bucket.is_empty(), "no empty bucket survives");
            for id in bucket {
                assert_eq!(inner.entries.get(id).unwrap().block.height(), *height);
            }
        }
        let heap_min = inner.eviction.peek().map(|Reverse(h)| *h);
        let bucket_min = inner.buckets.keys().min().copied();
        if let Some(bucket_min) = bucket_min {
            assert_eq!(heap_min, Some(bucket_min), "heap minimum tracks buckets");
        }
    }

    proptest! {
        /// Property: entries, buckets and the eviction heap stay mutually
        /// consistent under arbitrary add/set_min interleavings, and set_min
        /// is monotone in what it removes.
        #[test]
        fn bucket_consistency(ops in proptest::collection::vec((0u8..2, 0u64..12), 1..60)) {
            let store = store();
            let mut salt = 0u8;
            for (op, height) in ops {
                match op {
                    0 => {
                        salt = salt.wrapping_add(1);
                        store.add(block(TxBlockId::ZERO, height, salt));
                    }
                    _ => {
                        store.set_min(height);
                        let inner = store.inner.read();
                        prop_assert!(inner.buckets.keys().all(|h| *h >= height));
                        drop(inner);
                    }
                }
                assert_consistent(&store);
            }
        }
    }
}
