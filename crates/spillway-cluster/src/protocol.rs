//! Wire messages for export coordination
//!
//! Two families of messages travel between replicas:
//!
//! - [`CoordinatorMessage`]: payloads carried by the coordination service
//!   (leader proposals, tracker requests and replies), postcard-encoded.
//! - [`ReleaseBufferMessage`]: the point-to-point acknowledgement forwarded
//!   to every other replica of a partition, in a fixed big-endian layout:
//!
//! ```text
//! msg_type(1) partition_id(4) signature_len(4) signature(var)
//! committed_seq(8) generation_id(8)
//! ```

use crate::error::{ClusterError, Result};
use crate::node::{HostId, PartitionId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use spillway_core::{SequenceTracker, INFINITE_SEQNO};

/// Message type tag of [`ReleaseBufferMessage`]
pub const MSG_RELEASE_BUFFER: u8 = 1;

/// Upper bound on a table signature carried in an ack
pub const MAX_SIGNATURE_LEN: usize = 64 * 1024;

/// Payloads exchanged through the coordination service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorMessage {
    /// Group state: the recorded export leader
    LeaderState { leader: Option<HostId> },
    /// Tracker collection request, carrying the initiator's last released
    /// sequence number
    TrackerRequest { last_released: u64 },
    /// A member's tracker, serialized with [`SequenceTracker::serialize`]
    TrackerReply { tracker: Vec<u8> },
}

impl CoordinatorMessage {
    pub fn tracker_reply(tracker: &SequenceTracker) -> Self {
        CoordinatorMessage::TrackerReply {
            tracker: tracker.to_bytes().to_vec(),
        }
    }

    /// Serialize for the coordination service
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(postcard::to_allocvec(self)?))
    }

    /// Deserialize a payload produced by [`encode`](Self::encode)
    pub fn decode(data: &[u8]) -> Result<Self> {
        postcard::from_bytes(data).map_err(|e| ClusterError::Deserialization(e.to_string()))
    }

    /// Decode a tracker reply; empty payloads mean "not ready"
    pub fn decode_tracker(data: &[u8]) -> Result<Option<SequenceTracker>> {
        if data.is_empty() {
            return Ok(None);
        }
        match Self::decode(data)? {
            CoordinatorMessage::TrackerReply { tracker } => {
                let mut buf = tracker.as_slice();
                Ok(Some(SequenceTracker::deserialize(&mut buf)?))
            }
            other => Err(ClusterError::InvalidMessage(format!(
                "expected tracker reply, got {:?}",
                other
            ))),
        }
    }
}

/// Acknowledgement forwarded to peer replicas
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseBufferMessage {
    pub partition: PartitionId,
    pub signature: String,
    pub committed_seq: u64,
    pub generation: u64,
}

impl ReleaseBufferMessage {
    pub fn new(
        partition: PartitionId,
        signature: impl Into<String>,
        committed_seq: u64,
        generation: u64,
    ) -> Self {
        Self {
            partition,
            signature: signature.into(),
            committed_seq,
            generation,
        }
    }

    pub fn encoded_len(&self) -> usize {
        1 + 4 + 4 + self.signature.len() + 8 + 8
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(MSG_RELEASE_BUFFER);
        buf.put_u32(self.partition);
        buf.put_u32(self.signature.len() as u32);
        buf.put_slice(self.signature.as_bytes());
        buf.put_u64(self.committed_seq);
        buf.put_u64(self.generation);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 9 {
            return Err(ClusterError::InvalidMessage(format!(
                "release message too short: {} bytes",
                buf.remaining()
            )));
        }
        let msg_type = buf.get_u8();
        if msg_type != MSG_RELEASE_BUFFER {
            return Err(ClusterError::UnknownMessageType(msg_type));
        }
        let partition = buf.get_u32();
        let sig_len = buf.get_u32() as usize;
        if sig_len > MAX_SIGNATURE_LEN || buf.remaining() != sig_len + 16 {
            return Err(ClusterError::InvalidMessage(format!(
                "signature length {} does not fit {} remaining bytes",
                sig_len,
                buf.remaining()
            )));
        }
        let signature = std::str::from_utf8(&buf[..sig_len])
            .map_err(|e| ClusterError::InvalidMessage(format!("signature: {}", e)))?
            .to_string();
        buf.advance(sig_len);
        let committed_seq = buf.get_u64();
        let generation = buf.get_u64();
        if committed_seq >= INFINITE_SEQNO {
            return Err(ClusterError::InvalidMessage(format!(
                "release point {} out of range",
                committed_seq
            )));
        }

        Ok(Self {
            partition,
            signature,
            committed_seq,
            generation,
        })
    }
}
