// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures::future::try_join_all;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::block_store::TxBlockStore;
use crate::config::ManagerParameters;
use crate::error::TxBlockError;
use crate::metrics::Metrics;
use crate::network::{GossipMessage, TxBlockSender};
use crate::peer_directory::PeerDirectory;
use crate::request_table::{FetchResult, RequestTable};
use crate::types::{AdvertisedRange, PeerId, TxBlock, TxBlockId, TxHeight};

/// Read side of the accepted-block store. Serves request bodies for blocks
/// that already left the in-memory map, and bounds how far back fetches go.
pub trait AcceptedStore: Send + Sync + 'static {
    fn get_tx_block(&self, id: &TxBlockId) -> Option<Bytes>;

    /// Highest tx-block height committed by consensus.
    fn max_accepted_height(&self) -> TxHeight;
}

/// Boundary to the execution layer. A block is verified against a child
/// state derived from its parent; `parent` is `None` exactly for
/// genesis-height blocks, which verify against the implicit sentinel.
pub trait BlockVerifier: Send + Sync + 'static {
    type State;

    fn child_state(
        &self,
        parent: Option<&TxBlock>,
        capacity: usize,
    ) -> Result<Self::State, TxBlockError>;

    fn verify(&self, block: &TxBlock, state: Self::State) -> Result<(), TxBlockError>;
}

struct ManagerInner<S, A, V> {
    /// Set once by `run`. Hooks arriving before that log and drop, the
    /// transport is not wired up yet.
    sender: OnceLock<S>,
    accepted: A,
    verifier: V,
    store: TxBlockStore,
    peers: PeerDirectory,
    requests: RequestTable,
    /// Advertised watermarks.
    min: AtomicU64,
    max: AtomicU64,
    /// Explicit payloads to broadcast; `None` asks the gossip loop to
    /// compose a fresh advertisement instead.
    update: mpsc::Sender<Option<Bytes>>,
    shutdown: CancellationToken,
    parameters: ManagerParameters,
    metrics: Arc<Metrics>,
}

impl<S, A, V> ManagerInner<S, A, V> {
    fn advertised(&self) -> AdvertisedRange {
        AdvertisedRange {
            min: self.min.load(Ordering::SeqCst),
            max: self.max.load(Ordering::SeqCst),
        }
    }
}

/// Coordinates tx-block dissemination: advertises the held height range,
/// fetches missing blocks from peers that claim to have them, walks missing
/// ancestry backwards, and verifies children as soon as their parent
/// concludes.
pub struct TxBlockManager<S, A, V> {
    inner: Arc<ManagerInner<S, A, V>>,
    update_rx: Mutex<Option<mpsc::Receiver<Option<Bytes>>>>,
    gossip_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S, A, V> TxBlockManager<S, A, V>
where
    S: TxBlockSender,
    A: AcceptedStore,
    V: BlockVerifier,
{
    pub fn new(
        accepted: A,
        verifier: V,
        parameters: ManagerParameters,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (update, update_rx) = mpsc::channel(64);
        let inner = Arc::new(ManagerInner {
            sender: OnceLock::new(),
            accepted,
            verifier,
            store: TxBlockStore::new(metrics.clone()),
            peers: PeerDirectory::new(),
            requests: RequestTable::new(),
            min: AtomicU64::new(0),
            max: AtomicU64::new(0),
            update,
            shutdown: CancellationToken::new(),
            parameters,
            metrics,
        });
        Self {
            inner,
            update_rx: Mutex::new(Some(update_rx)),
            gossip_task: Mutex::new(None),
        }
    }

    /// Wire up the transport and start the gossip loop. All outbound gossip
    /// is owned by that single task.
    pub fn run(&self, sender: S) {
        if self.inner.sender.set(sender).is_err() {
            tracing::warn!("tx block manager is already running");
            return;
        }
        let Some(update_rx) = self.update_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(Self::gossip_loop(self.inner.clone(), update_rx));
        *self.gossip_task.lock() = Some(handle);
    }

    /// Signal every task owned by the manager to wind down.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait for the gossip loop to exit.
    pub async fn done(&self) {
        let handle = self.gossip_task.lock().take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
    }

    /// Called when this node authors a tx-block: track it, then gossip the
    /// block body followed by a refreshed advertisement. The two sends are
    /// consumed in order by the gossip loop.
    pub async fn issue(&self, block: TxBlock) {
        let bytes = block.bytes();
        let height = block.height();
        self.inner.store.add(Arc::new(block));
        match GossipMessage::Block(bytes).encode() {
            Ok(wire) => self.push_update(Some(wire)).await,
            Err(e) => tracing::warn!("unable to marshal tx block gossip: {e}"),
        }
        self.inner.max.fetch_max(height, Ordering::SeqCst);
        self.push_update(None).await;
    }

    /// Advance the advertised lower watermark, e.g. after pruning.
    pub async fn set_min(&self, min: TxHeight) {
        self.inner.min.store(min, Ordering::SeqCst);
        self.push_update(None).await;
    }

    /// Called when a block at `height` is accepted. Everything at or below
    /// it is dropped from memory; callers must have persisted those blocks
    /// first.
    pub async fn accept(&self, height: TxHeight) {
        let evicted = self.inner.store.set_min(height + 1);
        self.inner
            .metrics
            .evicted_blocks_total
            .inc_by(evicted.len() as u64);
        self.push_update(None).await;
        tracing::info!("evicted {} tx blocks from memory", evicted.len());
    }

    /// Fetch a run of tx-blocks at consecutive heights starting from
    /// `min_height`. On success every block's bytes are pushed into
    /// `results`; the first failure cancels the sibling fetches and is
    /// returned.
    pub async fn request_chunks(
        &self,
        min_height: TxHeight,
        ids: Vec<TxBlockId>,
        results: &mpsc::Sender<Bytes>,
    ) -> Result<(), TxBlockError> {
        let group = self.inner.shutdown.child_token();
        let mut receivers = Vec::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            let (reply, receiver) = oneshot::channel();
            self.request_chunk(group.clone(), min_height + i as u64, None, id, reply);
            receivers.push(receiver);
        }
        let fetches = receivers.into_iter().map(|receiver| async move {
            match receiver.await {
                Ok(Ok(block)) => Ok(block),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(TxBlockError::Cancelled),
            }
        });
        match try_join_all(fetches).await {
            Ok(blocks) => {
                for block in blocks {
                    results
                        .send(block.bytes())
                        .await
                        .map_err(|_| TxBlockError::Transport("result sink closed".to_string()))?;
                }
                self.push_update(None).await;
                Ok(())
            }
            Err(e) => {
                group.cancel();
                Err(e)
            }
        }
    }

    /// Single-block fetch primitive. Registers `reply` as a waiter for `id`;
    /// only the first waiter spawns the fetch task, everybody else is served
    /// by its conclusion. `hint` is preferred for the first two attempts.
    pub fn request_chunk(
        &self,
        cancel: CancellationToken,
        height: TxHeight,
        hint: Option<PeerId>,
        id: TxBlockId,
        reply: oneshot::Sender<FetchResult>,
    ) {
        Self::request_chunk_on(self.inner.clone(), cancel, height, hint, id, reply)
    }

    fn request_chunk_on(
        inner: Arc<ManagerInner<S, A, V>>,
        cancel: CancellationToken,
        height: TxHeight,
        hint: Option<PeerId>,
        id: TxBlockId,
        reply: oneshot::Sender<FetchResult>,
    ) {
        if !inner.requests.await_fetch(id, reply) {
            // A fetch for this id is in flight and will fan its result out.
            return;
        }
        if let Some(block) = inner.store.get(&id) {
            inner.requests.notify_fetch(&id, Ok(block));
            return;
        }
        tokio::spawn(Self::fetch_tx_block(inner, cancel, height, hint, id));
    }

    async fn fetch_tx_block(
        inner: Arc<ManagerInner<S, A, V>>,
        cancel: CancellationToken,
        height: TxHeight,
        hint: Option<PeerId>,
        id: TxBlockId,
    ) {
        let mut rng = StdRng::from_entropy();
        for attempt in 0..inner.parameters.max_retries {
            if cancel.is_cancelled() || inner.shutdown.is_cancelled() {
                inner.requests.notify_fetch(&id, Err(TxBlockError::Cancelled));
                return;
            }
            if attempt > 0 {
                inner.metrics.fetch_retries_total.inc();
            }

            let peer = match hint {
                Some(peer) if attempt <= 1 => peer,
                _ => {
                    let covering = inner.peers.peers_holding(height);
                    if !covering.is_empty() {
                        covering[rng.gen_range(0..covering.len())]
                    } else if let Some(peer) = inner.peers.any_peer(&mut rng) {
                        tracing::warn!(
                            "no peer advertises height {height} for {id}, trying {peer}"
                        );
                        peer
                    } else {
                        // Nobody to ask yet; wait for gossip to find peers.
                        if Self::sleep_or_cancel(&inner, &cancel).await.is_err() {
                            inner.requests.notify_fetch(&id, Err(TxBlockError::Cancelled));
                            return;
                        }
                        continue;
                    }
                }
            };

            let msg = match Self::request_from_peer(&inner, &cancel, peer, &id).await {
                Ok(msg) => msg,
                Err(TxBlockError::Cancelled) => {
                    inner.requests.notify_fetch(&id, Err(TxBlockError::Cancelled));
                    return;
                }
                Err(_) => {
                    if Self::sleep_or_cancel(&inner, &cancel).await.is_err() {
                        inner.requests.notify_fetch(&id, Err(TxBlockError::Cancelled));
                        return;
                    }
                    continue;
                }
            };

            let block = match TxBlock::decode(msg) {
                Ok(block) => Arc::new(block),
                Err(e) => {
                    tracing::warn!("invalid tx block from {peer}: {e}");
                    if Self::sleep_or_cancel(&inner, &cancel).await.is_err() {
                        inner.requests.notify_fetch(&id, Err(TxBlockError::Cancelled));
                        return;
                    }
                    continue;
                }
            };

            let (added, should_verify) = inner.store.add(block.clone());
            if !added {
                // Raced with gossip or another path; hand out the stored copy.
                let stored = inner.store.get(&id).unwrap_or(block);
                inner.requests.notify_fetch(&id, Ok(stored));
                return;
            }
            inner.metrics.fetched_blocks_total.inc();
            inner.requests.notify_fetch(&id, Ok(block));
            if should_verify {
                let inner = inner.clone();
                tokio::spawn(async move { Self::verify_all(&inner, id) });
            }
            return;
        }
        inner.metrics.fetch_exhausted_total.inc();
        inner.requests.notify_fetch(&id, Err(TxBlockError::Exhausted));
    }

    async fn sleep_or_cancel(
        inner: &ManagerInner<S, A, V>,
        cancel: &CancellationToken,
    ) -> Result<(), TxBlockError> {
        tokio::select! {
            _ = sleep(inner.parameters.retry_sleep) => Ok(()),
            _ = cancel.cancelled() => Err(TxBlockError::Cancelled),
            _ = inner.shutdown.cancelled() => Err(TxBlockError::Cancelled),
        }
    }

    /// One request/response round against a single peer. The response bytes
    /// must hash back to the requested id or the peer's answer is dropped.
    async fn request_from_peer(
        inner: &Arc<ManagerInner<S, A, V>>,
        cancel: &CancellationToken,
        peer: PeerId,
        id: &TxBlockId,
    ) -> Result<Bytes, TxBlockError> {
        let Some(sender) = inner.sender.get() else {
            return Err(TxBlockError::Transport(
                "tx block manager is not running".to_string(),
            ));
        };
        let (request_id, response) = inner.requests.begin_request();
        if let Err(e) = sender
            .send_request(peer, request_id, Bytes::copy_from_slice(id.as_ref()))
            .await
        {
            inner.requests.abort(request_id);
            tracing::warn!("tx block request for {id} to {peer} failed: {e}");
            return Err(e);
        }
        let msg = tokio::select! {
            msg = response => msg.map_err(|_| TxBlockError::Cancelled)?,
            _ = cancel.cancelled() => {
                inner.requests.abort(request_id);
                return Err(TxBlockError::Cancelled);
            }
            _ = inner.shutdown.cancelled() => {
                inner.requests.abort(request_id);
                return Err(TxBlockError::Cancelled);
            }
        };
        if msg.is_empty() {
            // The peer does not have the block we want.
            tracing::warn!("tx block fetch for {id} returned empty from {peer}");
            return Err(TxBlockError::NotFound);
        }
        if TxBlockId::digest(&msg) != *id {
            // TODO: penalize the sender via the peer scoring layer.
            tracing::warn!("received incorrect tx block from {peer}");
            return Err(TxBlockError::IdMismatch);
        }
        Ok(msg)
    }

    /// Answer a peer's fetch: from the in-memory map first, then from the
    /// accepted store, otherwise with empty bytes.
    pub async fn handle_request(
        &self,
        peer: PeerId,
        request_id: u32,
        request: Bytes,
    ) -> Result<(), TxBlockError> {
        let Some(sender) = self.inner.sender.get() else {
            tracing::warn!("dropping tx block request, manager is not running");
            return Ok(());
        };
        let id = match TxBlockId::from_slice(&request) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("unable to parse tx block request: {e}");
                return Ok(());
            }
        };
        if let Some(block) = self.inner.store.get(&id) {
            return sender.send_response(peer, request_id, block.bytes()).await;
        }
        match self.inner.accepted.get_tx_block(&id) {
            Some(bytes) => sender.send_response(peer, request_id, bytes).await,
            None => {
                tracing::warn!("unable to find tx block {id}");
                sender.send_response(peer, request_id, Bytes::new()).await
            }
        }
    }

    pub fn handle_response(&self, peer: PeerId, request_id: u32, response: Bytes) {
        if !self.inner.requests.deliver(request_id, response) {
            tracing::warn!("got unexpected response {request_id} from {peer}");
        }
    }

    pub fn handle_request_failed(&self, request_id: u32) {
        if !self.inner.requests.fail(request_id) {
            tracing::warn!("unexpected request {request_id} failed");
        }
    }

    /// Dispatch inbound gossip. Malformed or useless input is logged and
    /// swallowed; the transport never sees a failure for it.
    pub fn handle_gossip(&self, peer: PeerId, msg: Bytes) {
        if msg.is_empty() {
            return;
        }
        self.inner.metrics.gossip_received_total.inc();
        let message = match GossipMessage::decode(&msg) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("unable to parse gossip from {peer}: {e}");
                return;
            }
        };
        match message {
            GossipMessage::Range(range) => self.inner.peers.update_range(peer, range),
            GossipMessage::Block(bytes) => self.handle_block_gossip(peer, bytes),
        }
    }

    fn handle_block_gossip(&self, peer: PeerId, bytes: Bytes) {
        let id = TxBlockId::digest(&bytes);
        if self.inner.store.get(&id).is_some() {
            return;
        }
        let block = match TxBlock::decode(bytes) {
            Ok(block) => Arc::new(block),
            Err(e) => {
                tracing::error!("unable to parse tx block from {peer}: {e}");
                return;
            }
        };

        // A block at or below the accepted watermark can never be useful.
        if block.height() <= self.inner.accepted.max_accepted_height() {
            tracing::debug!("dropping useless tx block at height {}", block.height());
            return;
        }

        // Missing parent: walk the ancestry backwards from the advertiser
        // until we reconnect with something we hold.
        if block.height() > 0 && self.inner.store.get(&block.parent()).is_none() {
            let parent = block.parent();
            let parent_height = block.height() - 1;
            tokio::spawn(Self::fetch_ancestry(
                self.inner.clone(),
                peer,
                parent,
                parent_height,
            ));
            return;
        }

        let (added, should_verify) = self.inner.store.add(block);
        if !added {
            // The same tx block can arrive from several peers at once.
            tracing::debug!("already tracking tx block {id}");
            return;
        }
        if !should_verify {
            tracing::debug!("tx block {id} is not ready to verify");
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move { Self::verify_all(&inner, id) });
    }

    /// Iteratively fetch missing ancestors, preferring the peer that
    /// gossiped the descendant. Stops at the accepted watermark, at the
    /// first ancestor we already hold, or on the first fetch error.
    async fn fetch_ancestry(
        inner: Arc<ManagerInner<S, A, V>>,
        advertiser: PeerId,
        mut next_id: TxBlockId,
        mut next_height: TxHeight,
    ) {
        let cancel = inner.shutdown.child_token();
        while next_height > inner.accepted.max_accepted_height() {
            if inner.store.get(&next_id).is_some() {
                break;
            }
            let (reply, receiver) = oneshot::channel();
            Self::request_chunk_on(
                inner.clone(),
                cancel.clone(),
                next_height,
                Some(advertiser),
                next_id,
                reply,
            );
            let block = match receiver.await {
                Ok(Ok(block)) => block,
                Ok(Err(e)) => {
                    tracing::warn!("unable to get tx block {next_id}: {e}");
                    return;
                }
                Err(_) => return,
            };
            if block.height() == 0 {
                break;
            }
            next_id = block.parent();
            next_height = block.height() - 1;
        }
    }

    /// Breadth-first cascade from a freshly claimed entry: verify it, then
    /// pick up every child the store hands back, until no claim is won.
    fn verify_all(inner: &Arc<ManagerInner<S, A, V>>, start: TxBlockId) {
        let mut next = vec![start];
        while !next.is_empty() {
            let mut next_round = Vec::new();
            for id in next {
                let ok = match Self::verify(inner, &id) {
                    Ok(()) => {
                        inner.metrics.verified_blocks_total.inc();
                        true
                    }
                    Err(e) => {
                        inner.metrics.verification_failures_total.inc();
                        tracing::error!("unable to verify tx block {id}: {e}");
                        false
                    }
                };
                next_round.extend(inner.store.mark_verified(&id, ok));
            }
            next = next_round;
        }
    }

    fn verify(inner: &ManagerInner<S, A, V>, id: &TxBlockId) -> Result<(), TxBlockError> {
        let Some(block) = inner.store.get(id) else {
            return Err(TxBlockError::VerifyFailed(
                "tx block is no longer tracked".to_string(),
            ));
        };
        let parent = if block.height() == 0 {
            None
        } else {
            match inner.store.get(&block.parent()) {
                Some(parent) => Some(parent),
                None => {
                    return Err(TxBlockError::VerifyFailed(
                        "parent is no longer tracked".to_string(),
                    ))
                }
            }
        };
        let state = inner
            .verifier
            .child_state(parent.as_deref(), block.txs().len() * 2)?;
        inner.verifier.verify(&block, state)
    }

    /// Push our current advertisement to a peer that just connected, then
    /// include it in future broadcasts.
    pub async fn handle_connect(&self, peer: PeerId) {
        if let Some(sender) = self.inner.sender.get() {
            match GossipMessage::Range(self.inner.advertised()).encode() {
                Ok(bytes) => {
                    if let Err(e) = sender.broadcast(&[peer], bytes).await {
                        tracing::warn!("unable to push advertisement to {peer}: {e}");
                    }
                }
                Err(e) => tracing::warn!("unable to marshal advertisement: {e}"),
            }
        }
        self.inner.peers.on_connect(peer);
    }

    /// A disconnected peer is no longer a fetch candidate.
    pub fn handle_disconnect(&self, peer: PeerId) {
        self.inner.peers.on_disconnect(peer);
    }

    async fn push_update(&self, msg: Option<Bytes>) {
        self.inner.update.send(msg).await.ok();
    }

    async fn gossip_loop(
        inner: Arc<ManagerInner<S, A, V>>,
        mut update: mpsc::Receiver<Option<Bytes>>,
    ) {
        tracing::info!("starting tx block manager");
        let Some(sender) = inner.sender.get() else {
            return;
        };
        let period = inner.parameters.gossip_frequency;
        let mut timer = interval_at(Instant::now() + period, period);
        loop {
            let msg = tokio::select! {
                queued = update.recv() => queued.flatten(),
                _ = timer.tick() => None,
                _ = inner.shutdown.cancelled() => {
                    tracing::info!("stopping tx block manager");
                    return;
                }
            };
            let payload = match msg {
                Some(bytes) => bytes,
                None => match GossipMessage::Range(inner.advertised()).encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!("unable to marshal range gossip: {e}");
                        continue;
                    }
                },
            };
            if payload.len() > inner.parameters.network_size_limit {
                tracing::warn!("dropping oversized gossip of {} bytes", payload.len());
                continue;
            }
            let peers = inner.peers.connected();
            if let Err(e) = sender.broadcast(&peers, payload).await {
                tracing::warn!("unable to send gossip: {e}");
                continue;
            }
            inner.metrics.gossip_sent_total.inc();
        }
    }
}
