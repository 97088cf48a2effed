// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::TxBlockError;
use crate::types::{TxBlock, TxBlockId};

/// What a fetch waiter eventually receives.
pub type FetchResult = Result<Arc<TxBlock>, TxBlockError>;

#[derive(Default)]
struct TableInner {
    next_request_id: u32,
    /// One delivery slot per outstanding request; removed on delivery so a
    /// request id is consumed at most once.
    pending: AHashMap<u32, oneshot::Sender<Bytes>>,
    /// Everybody waiting on a block id. Only the first waiter runs the
    /// fetch; the rest are notified when it concludes.
    waiters: AHashMap<TxBlockId, Vec<oneshot::Sender<FetchResult>>>,
}

/// Correlates outgoing requests with their responses and coalesces
/// concurrent fetches of the same block id.
#[derive(Clone, Default)]
pub struct RequestTable {
    inner: Arc<Mutex<TableInner>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a request id and its delivery slot. Ids wrap at `u32::MAX`
    /// but never collide with a currently pending request.
    pub fn begin_request(&self) -> (u32, oneshot::Receiver<Bytes>) {
        let mut inner = self.inner.lock();
        let mut request_id = inner.next_request_id;
        while inner.pending.contains_key(&request_id) {
            request_id = request_id.wrapping_add(1);
        }
        inner.next_request_id = request_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(request_id, tx);
        (request_id, rx)
    }

    /// Complete a pending request with response bytes (possibly empty).
    /// Returns false when the id is unknown, so the caller can log it.
    pub fn deliver(&self, request_id: u32, bytes: Bytes) -> bool {
        let Some(slot) = self.inner.lock().pending.remove(&request_id) else {
            return false;
        };
        // The requester may have given up already; that is not an error.
        slot.send(bytes).ok();
        true
    }

    /// A failed request delivers empty bytes, same as a peer that does not
    /// have the block.
    pub fn fail(&self, request_id: u32) -> bool {
        self.deliver(request_id, Bytes::new())
    }

    /// Forget a pending request without completing it (send failure or
    /// cancelled waiter).
    pub fn abort(&self, request_id: u32) {
        self.inner.lock().pending.remove(&request_id);
    }

    /// Register a waiter for `id`. Returns true iff this is the first
    /// waiter, in which case the caller must run the fetch.
    pub fn await_fetch(&self, id: TxBlockId, waiter: oneshot::Sender<FetchResult>) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.get_mut(&id) {
            Some(list) => {
                list.push(waiter);
                false
            }
            None => {
                inner.waiters.insert(id, vec![waiter]);
                true
            }
        }
    }

    /// Fan a fetch conclusion out to every waiter registered for `id`.
    pub fn notify_fetch(&self, id: &TxBlockId, result: FetchResult) {
        let Some(waiters) = self.inner.lock().waiters.remove(id) else {
            return;
        };
        for waiter in waiters {
            waiter.send(result.clone()).ok();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
