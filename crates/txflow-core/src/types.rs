// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use blake2::Blake2b;
use bytes::Bytes;
use digest::Digest;
use serde::{Deserialize, Serialize};

use crate::config::NETWORK_SIZE_LIMIT;
use crate::error::TxBlockError;

pub type TxHeight = u64;

pub const TX_BLOCK_ID_SIZE: usize = 32;
pub const PEER_ID_SIZE: usize = 32;

type IdHasher = Blake2b<digest::consts::U32>;

/// Content identifier of a tx-block: the hash of its canonical bytes.
#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Default, Hash, Serialize, Deserialize)]
pub struct TxBlockId([u8; TX_BLOCK_ID_SIZE]);

impl TxBlockId {
    /// Parent id of a genesis-height block.
    pub const ZERO: TxBlockId = TxBlockId([0; TX_BLOCK_ID_SIZE]);

    pub fn new(bytes: [u8; TX_BLOCK_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes into the id they would carry as a tx-block.
    pub fn digest(bytes: &[u8]) -> Self {
        let mut hasher = IdHasher::default();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, TxBlockError> {
        let raw: [u8; TX_BLOCK_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| TxBlockError::InvalidWire(format!("bad id length {}", bytes.len())))?;
        Ok(Self(raw))
    }
}

impl AsRef<[u8]> for TxBlockId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TxBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_string = hex::encode(self.0);
        write!(f, "@{}", &hex_string[..8])
    }
}

impl fmt::Debug for TxBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Identity of a gossip peer, as handed to us by the transport layer.
#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Default, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_SIZE]);

impl PeerId {
    pub fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_string = hex::encode(self.0);
        write!(f, "p{}", &hex_string[..8])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize, Default)]
pub struct Transaction {
    data: Vec<u8>,
}

impl Transaction {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx[{}b]", self.data.len())
    }
}

/// Serialized body of a tx-block. The id is not part of the wire form, it is
/// recomputed from the canonical bytes on every decode.
#[derive(Clone, Serialize, Deserialize)]
struct TxBlockBody {
    parent: TxBlockId,
    height: TxHeight,
    txs: Vec<Transaction>,
}

/// One node of the parent-linked tx-block chain.
///
/// `bytes` is the canonical bincode form used for re-gossip and responses;
/// `id` is derived from it, so a decoded block always hashes to the bytes it
/// was built from.
#[derive(Clone)]
pub struct TxBlock {
    body: TxBlockBody,
    id: TxBlockId,
    bytes: Bytes,
}

impl TxBlock {
    pub fn new(
        parent: TxBlockId,
        height: TxHeight,
        txs: Vec<Transaction>,
    ) -> Result<Self, TxBlockError> {
        let body = TxBlockBody {
            parent,
            height,
            txs,
        };
        let encoded = bincode::serialize(&body)
            .map_err(|e| TxBlockError::InvalidWire(format!("serialize tx block: {e}")))?;
        if encoded.len() > NETWORK_SIZE_LIMIT {
            return Err(TxBlockError::InvalidWire(format!(
                "tx block of {} bytes exceeds network limit",
                encoded.len()
            )));
        }
        let bytes = Bytes::from(encoded);
        let id = TxBlockId::digest(&bytes);
        Ok(Self { body, id, bytes })
    }

    pub fn decode(bytes: Bytes) -> Result<Self, TxBlockError> {
        if bytes.len() > NETWORK_SIZE_LIMIT {
            return Err(TxBlockError::InvalidWire(format!(
                "tx block of {} bytes exceeds network limit",
                bytes.len()
            )));
        }
        let body: TxBlockBody = bincode::deserialize(&bytes)
            .map_err(|e| TxBlockError::InvalidWire(format!("deserialize tx block: {e}")))?;
        let id = TxBlockId::digest(&bytes);
        Ok(Self { body, id, bytes })
    }

    pub fn id(&self) -> TxBlockId {
        self.id
    }

    pub fn parent(&self) -> TxBlockId {
        self.body.parent
    }

    pub fn height(&self) -> TxHeight {
        self.body.height
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.body.txs
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }
}

impl fmt::Debug for TxBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TxBlock({}, h{}, parent {}, {} txs)",
            self.id,
            self.body.height,
            self.body.parent,
            self.body.txs.len()
        )
    }
}

pub const RANGE_WIRE_SIZE: usize = 16;

/// The `[min, max]` height interval of tx-blocks a node claims to hold.
/// `{0, 0}` when the node holds nothing yet.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct AdvertisedRange {
    pub min: TxHeight,
    pub max: TxHeight,
}

impl AdvertisedRange {
    pub fn covers(&self, height: TxHeight) -> bool {
        self.min <= height && height <= self.max
    }

    pub fn to_wire(&self) -> [u8; RANGE_WIRE_SIZE] {
        let mut wire = [0u8; RANGE_WIRE_SIZE];
        wire[..8].copy_from_slice(&self.min.to_be_bytes());
        wire[8..].copy_from_slice(&self.max.to_be_bytes());
        wire
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, TxBlockError> {
        if bytes.len() != RANGE_WIRE_SIZE {
            return Err(TxBlockError::InvalidWire(format!(
                "bad advertised range length {}",
                bytes.len()
            )));
        }
        // Both fields may legitimately be zero at genesis.
        let min = u64::from_be_bytes(bytes[..8].try_into().unwrap());
        let max = u64::from_be_bytes(bytes[8..].try_into().unwrap());
        Ok(Self { min, max })
    }
}

impl fmt::Display for AdvertisedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
