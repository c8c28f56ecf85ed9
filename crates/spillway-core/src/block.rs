//! Buffered export blocks
//!
//! A block is an immutable run of rows pushed by the engine, identified by the
//! sequence number of its first row. Acknowledgements may land in the middle of
//! a block; instead of splitting the backing bytes the block records a release
//! point and exposes only the unreleased tail.

use crate::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

/// Milliseconds since the Unix epoch of 2008-01-01T00:00:00Z, the origin of
/// the timestamp component carried in unique ids.
pub const UNIQUE_ID_EPOCH_MILLIS: i64 = 1_199_145_600_000;

/// Low bits of a unique id that hold counter and partition components.
const UNIQUE_ID_TIMESTAMP_SHIFT: u32 = 23;

/// Fixed header written in front of every persisted block.
/// start(8) rows(4) committed(8) unique_id(8) generation(8) payload_len(4)
pub const BLOCK_HEADER_SIZE: usize = 40;

/// Wall-clock time encoded in a unique id
pub fn unique_id_timestamp(unique_id: u64) -> DateTime<Utc> {
    let millis = (unique_id >> UNIQUE_ID_TIMESTAMP_SHIFT) as i64 + UNIQUE_ID_EPOCH_MILLIS;
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

/// Build a unique id carrying `timestamp_millis` (Unix epoch) and a counter
pub fn make_unique_id(timestamp_millis: i64, counter: u64) -> u64 {
    let since_epoch = (timestamp_millis - UNIQUE_ID_EPOCH_MILLIS).max(0) as u64;
    (since_epoch << UNIQUE_ID_TIMESTAMP_SHIFT) | (counter & ((1 << UNIQUE_ID_TIMESTAMP_SHIFT) - 1))
}

/// A buffered run of rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    start_seq: u64,
    row_count: u32,
    committed_seq: u64,
    unique_id: u64,
    generation: u64,
    data: Bytes,
    /// Last acknowledged sequence inside this block (`start_seq - 1` if none)
    released_seq: u64,
}

impl Block {
    pub fn new(
        start_seq: u64,
        row_count: u32,
        committed_seq: u64,
        unique_id: u64,
        generation: u64,
        data: Bytes,
    ) -> Result<Self> {
        if row_count == 0 || start_seq == 0 {
            return Err(Error::InvalidRange {
                start: start_seq,
                end: start_seq.saturating_add(row_count as u64).saturating_sub(1),
            });
        }
        Ok(Self {
            start_seq,
            row_count,
            committed_seq,
            unique_id,
            generation,
            data,
            released_seq: start_seq - 1,
        })
    }

    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    pub fn last_seq(&self) -> u64 {
        self.start_seq + self.row_count as u64 - 1
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    /// Last row of the last fully committed transaction in the block
    pub fn committed_seq(&self) -> u64 {
        self.committed_seq
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        unique_id_timestamp(self.unique_id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Backing bytes (a cheap reference-counted handle)
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }

    /// Last acknowledged sequence in this block
    pub fn released_seq(&self) -> u64 {
        self.released_seq
    }

    /// First sequence not yet acknowledged
    pub fn first_unreleased_seq(&self) -> u64 {
        self.released_seq + 1
    }

    /// Rows not yet acknowledged
    pub fn unreleased_rows(&self) -> u64 {
        self.last_seq() - self.released_seq
    }

    pub fn is_partially_released(&self) -> bool {
        self.released_seq >= self.start_seq && !self.is_fully_released()
    }

    pub fn is_fully_released(&self) -> bool {
        self.released_seq >= self.last_seq()
    }

    /// Move the release point forward to `seq` (clamped to the block).
    ///
    /// Returns the number of rows newly released.
    pub fn release_to(&mut self, seq: u64) -> u64 {
        let target = seq.min(self.last_seq());
        if target <= self.released_seq {
            return 0;
        }
        let released = target - self.released_seq;
        self.released_seq = target;
        released
    }

    /// Cut the block so that `last` becomes its final row.
    ///
    /// The payload is left untouched; readers size it by `row_count`.
    pub fn truncate_rows(&mut self, last: u64) -> Result<()> {
        if last < self.start_seq || last > self.last_seq() {
            return Err(Error::InvalidRange {
                start: self.start_seq,
                end: last,
            });
        }
        self.row_count = (last - self.start_seq + 1) as u32;
        self.committed_seq = self.committed_seq.min(last);
        self.released_seq = self.released_seq.min(last);
        Ok(())
    }

    /// Whether `seq` falls inside this block
    pub fn contains_seq(&self, seq: u64) -> bool {
        seq >= self.start_seq && seq <= self.last_seq()
    }

    /// Encode header and payload for persistence.
    ///
    /// The release point is not persisted: on recovery it is reapplied from the
    /// source's last released sequence.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BLOCK_HEADER_SIZE + self.data.len());
        buf.put_u64(self.start_seq);
        buf.put_u32(self.row_count);
        buf.put_u64(self.committed_seq);
        buf.put_u64(self.unique_id);
        buf.put_u64(self.generation);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode a block written by [`encode`](Self::encode)
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE {
            return Err(Error::Truncated {
                needed: BLOCK_HEADER_SIZE,
                available: buf.len(),
            });
        }
        let start_seq = buf.get_u64();
        let row_count = buf.get_u32();
        let committed_seq = buf.get_u64();
        let unique_id = buf.get_u64();
        let generation = buf.get_u64();
        let len = buf.get_u32() as usize;
        if buf.remaining() != len {
            return Err(Error::CorruptBlock(format!(
                "payload length {} does not match {} remaining bytes",
                len,
                buf.remaining()
            )));
        }
        Block::new(start_seq, row_count, committed_seq, unique_id, generation, buf)
            .map_err(|e| Error::CorruptBlock(e.to_string()))
    }
}
