use super::traits::BlockBuffer;
use crate::block::Block;
use crate::tracker::SequenceTracker;
use std::collections::VecDeque;

/// In-memory block buffer (no persistence)
#[derive(Debug, Default)]
pub struct MemoryBlockBuffer {
    blocks: VecDeque<Block>,
    bytes: u64,
}

impl MemoryBlockBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockBuffer for MemoryBlockBuffer {
    fn offer(&mut self, block: Block) -> crate::Result<()> {
        self.bytes += block.size_in_bytes() as u64;
        self.blocks.push_back(block);
        Ok(())
    }

    fn peek(&self) -> Option<&Block> {
        self.blocks.front()
    }

    fn peek_mut(&mut self) -> Option<&mut Block> {
        self.blocks.front_mut()
    }

    fn pop(&mut self) -> crate::Result<Option<Block>> {
        let block = self.blocks.pop_front();
        if let Some(b) = &block {
            self.bytes -= b.size_in_bytes() as u64;
        }
        Ok(block)
    }

    fn iter(&self) -> Box<dyn Iterator<Item = &Block> + '_> {
        Box::new(self.blocks.iter())
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn size_in_bytes(&self) -> u64 {
        self.bytes
    }

    fn scan_for_gap(&self) -> crate::Result<SequenceTracker> {
        let mut tracker = SequenceTracker::new();
        for block in &self.blocks {
            tracker.add_range(block.start_seq(), block.last_seq());
        }
        Ok(tracker)
    }

    fn truncate_to_sequence_number(&mut self, seq: u64) -> crate::Result<()> {
        while let Some(last) = self.blocks.back_mut() {
            if last.start_seq() > seq {
                let removed = self.blocks.pop_back().map(|b| b.size_in_bytes() as u64);
                self.bytes -= removed.unwrap_or(0);
            } else {
                if last.last_seq() > seq {
                    last.truncate_rows(seq)?;
                }
                break;
            }
        }
        Ok(())
    }

    fn delete_stale_blocks(&mut self, generation: u64) -> crate::Result<usize> {
        let before = self.blocks.len();
        self.blocks.retain(|b| b.generation() >= generation);
        self.bytes = self.blocks.iter().map(|b| b.size_in_bytes() as u64).sum();
        Ok(before - self.blocks.len())
    }

    fn sync(&mut self) -> crate::Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> crate::Result<()> {
        self.blocks.clear();
        self.bytes = 0;
        Ok(())
    }
}
