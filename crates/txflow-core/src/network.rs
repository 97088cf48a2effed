// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::config::NETWORK_SIZE_LIMIT;
use crate::error::TxBlockError;
use crate::types::{AdvertisedRange, PeerId, RANGE_WIRE_SIZE};

const RANGE_TAG: u8 = 0x00;
const BLOCK_TAG: u8 = 0x01;

/// Tagged gossip payload broadcast to the connected peer set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GossipMessage {
    /// The sender's advertised `[min, max]` tx-block height range.
    Range(AdvertisedRange),
    /// Canonical bytes of one tx-block.
    Block(Bytes),
}

impl GossipMessage {
    pub fn encode(&self) -> Result<Bytes, TxBlockError> {
        let wire = match self {
            GossipMessage::Range(range) => {
                let mut wire = BytesMut::with_capacity(1 + RANGE_WIRE_SIZE);
                wire.extend_from_slice(&[RANGE_TAG]);
                wire.extend_from_slice(&range.to_wire());
                wire
            }
            GossipMessage::Block(bytes) => {
                let mut wire = BytesMut::with_capacity(1 + bytes.len());
                wire.extend_from_slice(&[BLOCK_TAG]);
                wire.extend_from_slice(bytes);
                wire
            }
        };
        if wire.len() > NETWORK_SIZE_LIMIT {
            return Err(TxBlockError::InvalidWire(format!(
                "gossip of {} bytes exceeds network limit",
                wire.len()
            )));
        }
        Ok(wire.freeze())
    }

    /// Unknown tags fail closed.
    pub fn decode(bytes: &[u8]) -> Result<Self, TxBlockError> {
        if bytes.len() > NETWORK_SIZE_LIMIT {
            return Err(TxBlockError::InvalidWire(format!(
                "gossip of {} bytes exceeds network limit",
                bytes.len()
            )));
        }
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| TxBlockError::InvalidWire("empty gossip".to_string()))?;
        match *tag {
            RANGE_TAG => Ok(GossipMessage::Range(AdvertisedRange::from_wire(body)?)),
            BLOCK_TAG => {
                if body.is_empty() {
                    return Err(TxBlockError::InvalidWire("empty tx block gossip".to_string()));
                }
                Ok(GossipMessage::Block(Bytes::copy_from_slice(body)))
            }
            unknown => Err(TxBlockError::InvalidWire(format!(
                "unexpected gossip tag {unknown:#04x}"
            ))),
        }
    }
}

/// Outbound side of the transport layer.
///
/// `broadcast` carries gossip to a peer set; `send_request`/`send_response`
/// are the point-to-point request/response pair correlated by `request_id`.
#[async_trait]
pub trait TxBlockSender: Send + Sync + 'static {
    async fn broadcast(&self, peers: &[PeerId], bytes: Bytes) -> Result<(), TxBlockError>;

    async fn send_request(
        &self,
        peer: PeerId,
        request_id: u32,
        bytes: Bytes,
    ) -> Result<(), TxBlockError>;

    async fn send_response(
        &self,
        peer: PeerId,
        request_id: u32,
        bytes: Bytes,
    ) -> Result<(), TxBlockError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn block_gossip_roundtrip() {
        let body = Bytes::from_static(b"canonical tx block bytes");
        let msg = GossipMessage::Block(body.clone());
        let wire = msg.encode().unwrap();
        assert_eq!(wire[0], BLOCK_TAG);
        assert_eq!(GossipMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let err = GossipMessage::decode(&[0x02, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, TxBlockError::InvalidWire(_)));
        assert!(GossipMessage::decode(&[]).is_err());
    }

    #[test]
    fn truncated_range_fails_closed() {
        assert!(GossipMessage::decode(&[RANGE_TAG, 0, 0, 0]).is_err());
    }

    #[test]
    fn empty_block_body_fails_closed() {
        assert!(GossipMessage::decode(&[BLOCK_TAG]).is_err());
    }

    proptest! {
        #[test]
        fn range_gossip_roundtrip(min in any::<u64>(), span in any::<u64>()) {
            let max = min.saturating_add(span);
            let msg = GossipMessage::Range(AdvertisedRange { min, max });
            let wire = msg.encode().unwrap();
            prop_assert_eq!(wire.len(), 17);
            prop_assert_eq!(GossipMessage::decode(&wire).unwrap(), msg);
        }
    }
}
