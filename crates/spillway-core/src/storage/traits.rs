use crate::block::Block;
use crate::tracker::SequenceTracker;
use std::fmt;

/// Ordered queue of buffered blocks for one table-partition.
///
/// Blocks are offered in ascending sequence order and consumed from the head.
/// Implementations that persist blocks must make `offer` durable before it
/// returns; any I/O error is treated as unrecoverable by callers.
pub trait BlockBuffer: Send + fmt::Debug {
    /// Append a block at the tail
    fn offer(&mut self, block: Block) -> crate::Result<()>;

    /// Oldest block still buffered
    fn peek(&self) -> Option<&Block>;

    /// Oldest block, for in-place partial release
    fn peek_mut(&mut self) -> Option<&mut Block>;

    /// Remove and return the oldest block
    fn pop(&mut self) -> crate::Result<Option<Block>>;

    /// Walk buffered blocks head to tail without mutating the store
    fn iter(&self) -> Box<dyn Iterator<Item = &Block> + '_>;

    /// Number of buffered blocks
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes currently buffered
    fn size_in_bytes(&self) -> u64;

    /// Rebuild the set of buffered sequence numbers from block headers
    fn scan_for_gap(&self) -> crate::Result<SequenceTracker>;

    /// Discard every buffered row after `seq`
    fn truncate_to_sequence_number(&mut self, seq: u64) -> crate::Result<()>;

    /// Discard blocks written by a generation older than `generation`.
    /// Returns the number of blocks removed.
    fn delete_stale_blocks(&mut self, generation: u64) -> crate::Result<usize>;

    /// Flush pending writes
    fn sync(&mut self) -> crate::Result<()>;

    /// Remove everything, including any on-disk state
    fn destroy(&mut self) -> crate::Result<()>;
}
