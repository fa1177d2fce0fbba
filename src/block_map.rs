//! Ordered mapping between compressed bit offsets and decompressed byte
//! offsets, one entry per confirmed chunk. This is the seek index at
//! runtime: `find_containing_byte` answers "which chunk holds decompressed
//! offset o" by binary search.

use crate::error::{PargzError, PargzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMapEntry {
    pub bit_offset: u64,
    pub byte_offset: u64,
}

/// A chunk located by a lookup, with its end coordinates when known (the
/// next entry, or the stream totals once finalized).
#[derive(Debug, Clone, Copy)]
pub struct ChunkSpan {
    pub index: usize,
    pub start_bits: u64,
    pub start_byte: u64,
    pub end_bits: Option<u64>,
    pub end_byte: Option<u64>,
}

#[derive(Debug, Default)]
pub struct BlockMap {
    entries: Vec<BlockMapEntry>,
    finalized: bool,
    end_bits: u64,
    total_bytes: u64,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn finalized(&self) -> bool {
        self.finalized
    }

    /// Total decompressed size; known only once finalized.
    pub fn total_size(&self) -> Option<u64> {
        self.finalized.then_some(self.total_bytes)
    }

    /// Bit offset one past the last chunk; known only once finalized.
    pub fn end_bits(&self) -> Option<u64> {
        self.finalized.then_some(self.end_bits)
    }

    pub fn entries(&self) -> &[BlockMapEntry] {
        &self.entries
    }

    /// Append a confirmed chunk start. Both coordinates must grow strictly
    /// monotonically (equal byte offsets would mean an empty chunk, which
    /// the walk never appends).
    pub fn push(&mut self, bit_offset: u64, byte_offset: u64) -> PargzResult<()> {
        if self.finalized {
            return Err(PargzError::internal("block map already finalized"));
        }
        if let Some(last) = self.entries.last() {
            if bit_offset <= last.bit_offset || byte_offset < last.byte_offset {
                return Err(PargzError::internal(format!(
                    "non-monotone block map entry ({bit_offset}, {byte_offset}) after \
                     ({}, {})",
                    last.bit_offset, last.byte_offset
                )));
            }
        }
        self.entries.push(BlockMapEntry {
            bit_offset,
            byte_offset,
        });
        Ok(())
    }

    /// Seal the map once a chunk reached the stream trailer.
    pub fn finalize(&mut self, end_bits: u64, total_bytes: u64) {
        self.finalized = true;
        self.end_bits = end_bits;
        self.total_bytes = total_bytes;
    }

    /// Chunk containing the decompressed byte offset, if already mapped.
    /// Offsets at or past the finalized total return `None`.
    pub fn find_containing_byte(&self, byte_offset: u64) -> Option<ChunkSpan> {
        if self.entries.is_empty() {
            return None;
        }
        if self.finalized && byte_offset >= self.total_bytes {
            return None;
        }
        let index = self
            .entries
            .partition_point(|entry| entry.byte_offset <= byte_offset)
            .checked_sub(1)?;
        // Unfinalized maps only cover up to the walk frontier; whether the
        // last chunk contains the offset is only known once its successor
        // exists.
        if index + 1 == self.entries.len() && !self.finalized {
            return None;
        }
        Some(self.span_at(index))
    }

    /// Chunk containing the compressed bit offset, if already mapped.
    pub fn find_containing_bit(&self, bit_offset: u64) -> Option<ChunkSpan> {
        if self.entries.is_empty() {
            return None;
        }
        if self.finalized && bit_offset >= self.end_bits {
            return None;
        }
        let index = self
            .entries
            .partition_point(|entry| entry.bit_offset <= bit_offset)
            .checked_sub(1)?;
        if index + 1 == self.entries.len() && !self.finalized {
            return None;
        }
        Some(self.span_at(index))
    }

    fn span_at(&self, index: usize) -> ChunkSpan {
        let entry = self.entries[index];
        let (end_bits, end_byte) = match self.entries.get(index + 1) {
            Some(next) => (Some(next.bit_offset), Some(next.byte_offset)),
            None => (
                self.finalized.then_some(self.end_bits),
                self.finalized.then_some(self.total_bytes),
            ),
        };
        ChunkSpan {
            index,
            start_bits: entry.bit_offset,
            start_byte: entry.byte_offset,
            end_bits,
            end_byte,
        }
    }
}
