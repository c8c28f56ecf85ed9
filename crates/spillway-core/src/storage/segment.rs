//! Durable block store
//!
//! Each block lives in its own file named `<generation>-<start_seq>.blk` inside
//! the source directory. A file holds a single frame:
//! `[CRC: 4][Len: 4][encoded block: Len]`. Writes go to a `.tmp` sibling and
//! are renamed into place so a crash never leaves a half-written block under
//! its final name.

use super::traits::BlockBuffer;
use crate::block::Block;
use crate::tracker::SequenceTracker;
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BLOCK_SUFFIX: &str = "blk";
const TMP_SUFFIX: &str = "tmp";
const FRAME_HEADER_SIZE: usize = 8; // 4 bytes CRC, 4 bytes length

/// Block buffer persisted as one file per block
#[derive(Debug)]
pub struct FileBlockBuffer {
    dir: PathBuf,
    blocks: VecDeque<Block>,
    bytes: u64,
    sync_writes: bool,
}

impl FileBlockBuffer {
    /// Open (or create) the store in `dir`, loading every persisted block.
    pub fn open(dir: impl Into<PathBuf>, sync_writes: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut blocks = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(BLOCK_SUFFIX) => blocks.push(Self::read_block(&path)?),
                Some(TMP_SUFFIX) => {
                    warn!(path = %path.display(), "Removing incomplete block write");
                    fs::remove_file(&path)?;
                }
                _ => {}
            }
        }
        blocks.sort_by_key(|b| b.start_seq());

        let bytes = blocks.iter().map(|b| b.size_in_bytes() as u64).sum();
        if !blocks.is_empty() {
            info!(
                dir = %dir.display(),
                blocks = blocks.len(),
                bytes,
                "Recovered persisted export blocks"
            );
        }

        Ok(Self {
            dir,
            blocks: blocks.into(),
            bytes,
            sync_writes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn block_path(&self, block: &Block) -> PathBuf {
        self.dir.join(format!(
            "{:020}-{:020}.{}",
            block.generation(),
            block.start_seq(),
            BLOCK_SUFFIX
        ))
    }

    fn frame(block: &Block) -> Bytes {
        let encoded = block.encode();
        let mut hasher = Hasher::new();
        hasher.update(&encoded);
        let crc = hasher.finalize();

        let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + encoded.len());
        frame.put_u32(crc);
        frame.put_u32(encoded.len() as u32);
        frame.put_slice(&encoded);
        frame.freeze()
    }

    fn write_block(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block);
        let tmp = path.with_extension(TMP_SUFFIX);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&Self::frame(block))?;
            if self.sync_writes {
                file.sync_data()?;
            }
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_block(path: &Path) -> Result<Block> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;

        if data.len() < FRAME_HEADER_SIZE {
            return Err(Error::CorruptBlock(format!(
                "{}: frame header truncated",
                path.display()
            )));
        }
        let stored_crc = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if data.len() != FRAME_HEADER_SIZE + len {
            return Err(Error::CorruptBlock(format!(
                "{}: expected {} payload bytes, found {}",
                path.display(),
                len,
                data.len() - FRAME_HEADER_SIZE
            )));
        }

        let payload = &data[FRAME_HEADER_SIZE..];
        let mut hasher = Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(Error::CorruptBlock(format!(
                "{}: CRC mismatch",
                path.display()
            )));
        }

        Block::decode(Bytes::copy_from_slice(payload))
    }

    fn remove_block_file(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl BlockBuffer for FileBlockBuffer {
    fn offer(&mut self, block: Block) -> Result<()> {
        // The write path holds its own reference to the backing bytes
        self.write_block(&block)?;
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

    fn pop(&mut self) -> Result<Option<Block>> {
        let block = match self.blocks.pop_front() {
            Some(b) => b,
            None => return Ok(None),
        };
        self.remove_block_file(&block)?;
        self.bytes -= block.size_in_bytes() as u64;
        Ok(Some(block))
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

    fn scan_for_gap(&self) -> Result<SequenceTracker> {
        let mut tracker = SequenceTracker::new();
        for block in &self.blocks {
            tracker.add_range(block.start_seq(), block.last_seq());
        }
        Ok(tracker)
    }

    fn truncate_to_sequence_number(&mut self, seq: u64) -> Result<()> {
        while let Some(last) = self.blocks.back() {
            if last.start_seq() > seq {
                if let Some(block) = self.blocks.pop_back() {
                    self.remove_block_file(&block)?;
                    self.bytes -= block.size_in_bytes() as u64;
                }
                continue;
            }
            if last.last_seq() > seq {
                let mut cut = last.clone();
                cut.truncate_rows(seq)?;
                self.write_block(&cut)?;
                if let Some(slot) = self.blocks.back_mut() {
                    *slot = cut;
                }
            }
            break;
        }
        debug!(dir = %self.dir.display(), seq, "Truncated persisted blocks");
        Ok(())
    }

    fn delete_stale_blocks(&mut self, generation: u64) -> Result<usize> {
        let (stale, live): (Vec<Block>, Vec<Block>) = self
            .blocks
            .drain(..)
            .partition(|b| b.generation() < generation);
        for block in &stale {
            self.remove_block_file(block)?;
        }
        self.blocks = live.into();
        self.bytes = self.blocks.iter().map(|b| b.size_in_bytes() as u64).sum();
        Ok(stale.len())
    }

    fn sync(&mut self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.blocks.clear();
        self.bytes = 0;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
