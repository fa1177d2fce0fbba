//! Block finder: confirmed chunk starts plus spacing-based guesses.
//!
//! The finder does no decoding of its own. It knows the first deflate
//! block (right after the leading gzip header), collects confirmed offsets
//! as chunk decodes publish their exit boundaries, and beyond the last
//! confirmed offset hands out partition guesses at multiples of the
//! configured spacing. On BGZF files the guesses are never needed: block
//! sizes are read straight from the headers and every offset is exact.
//!
//! The speculative scan that locates a real block inside a partition lives
//! here too: a precode filter pass over successive bit offsets, with a
//! cheap zero-padding/LEN/NLEN check for stored blocks, and a full header
//! parse for the rare survivors.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bgzf::{self, BgzfScanner};
use crate::bit_reader::BitReader;
use crate::deflate;
use crate::error::{PargzError, PargzResult};
use crate::gzip;
use crate::precode;
use crate::source::Source;

pub const MIN_SPACING_BITS: u64 = 32 * 1024 * 8;

pub struct BlockFinder {
    source: Arc<Source>,
    stream_bits: u64,
    spacing_bits: u64,
    is_bgzf: bool,
    /// BGZF offsets are harvested in batches of this many ahead of demand.
    batch_fetch_count: usize,
    state: Mutex<FinderState>,
}

struct FinderState {
    /// Confirmed block offsets, sorted and unique. A deque because
    /// confirmations arrive almost always at the back.
    offsets: VecDeque<u64>,
    finalized: bool,
    bgzf_scanner: Option<BgzfScanner>,
}

impl BlockFinder {
    pub fn new(source: Arc<Source>, spacing_bits: u64, parallelization: usize) -> PargzResult<Self> {
        if spacing_bits < MIN_SPACING_BITS {
            return Err(PargzError::invalid_argument(format!(
                "spacing of {spacing_bits} bits is smaller than the 32 KiB window"
            )));
        }

        let header = gzip::parse_header(&source, 0).map_err(|error| match error {
            PargzError::EndOfFile => PargzError::IncompleteStream,
            other => other,
        })?;
        let first_offset = header.data_offset as u64 * 8;

        let is_bgzf = bgzf::is_bgzf(&source);
        let stream_bits = source.bit_len();

        let mut offsets = VecDeque::new();
        offsets.push_back(first_offset);

        Ok(Self {
            source,
            stream_bits,
            spacing_bits,
            is_bgzf,
            batch_fetch_count: 16.max(3 * parallelization),
            state: Mutex::new(FinderState {
                offsets,
                finalized: false,
                bgzf_scanner: is_bgzf.then(BgzfScanner::new),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.state.lock().unwrap().offsets.len()
    }

    pub fn finalize(&self) {
        self.state.lock().unwrap().finalized = true;
    }

    pub fn finalized(&self) -> bool {
        self.state.lock().unwrap().finalized
    }

    pub fn is_bgzf(&self) -> bool {
        self.is_bgzf
    }

    pub fn spacing_bits(&self) -> u64 {
        self.spacing_bits
    }

    pub fn stream_bits(&self) -> u64 {
        self.stream_bits
    }

    /// Round an offset down to its partition grid point.
    pub fn partition_offset_containing(&self, offset: u64) -> u64 {
        offset / self.spacing_bits * self.spacing_bits
    }

    /// The offset for a block index: confirmed offsets verbatim, partition
    /// guesses beyond them, the stream size as one-past-the-end sentinel,
    /// `None` past that. On BGZF files a non-zero `timeout` (seconds)
    /// allows harvesting further exact offsets from the block headers.
    pub fn get(&self, index: usize, timeout: f64) -> Option<u64> {
        let mut state = self.state.lock().unwrap();

        if !state.finalized && state.bgzf_scanner.is_some() && timeout != 0.0 {
            self.gather_more_bgzf_blocks(&mut state, index, timeout);
        }

        if index < state.offsets.len() {
            return Some(state.offsets[index]);
        }

        if state.finalized {
            // All real offsets are known; the only thing left to hand out
            // is the end-of-stream sentinel.
            return (index == state.offsets.len()).then_some(self.stream_bits);
        }

        let beyond = (index - state.offsets.len()) as u64;
        let partition_index = self.first_partition_index(&state) + beyond;
        let offset = partition_index * self.spacing_bits;
        if offset < self.stream_bits {
            return Some(offset);
        }
        if partition_index > 0 && (partition_index - 1) * self.spacing_bits < self.stream_bits {
            return Some(self.stream_bits);
        }
        None
    }

    /// Record a confirmed block offset. Inserts keep the deque sorted;
    /// offsets at or past the stream end are ignored.
    pub fn insert(&self, offset: u64) -> PargzResult<()> {
        let mut state = self.state.lock().unwrap();
        if offset >= self.stream_bits {
            return Ok(());
        }
        let position = state.offsets.partition_point(|&existing| existing < offset);
        if state.offsets.get(position) == Some(&offset) {
            return Ok(());
        }
        if state.finalized {
            return Err(PargzError::internal(
                "block finder already finalized, refusing new offsets",
            ));
        }
        state.offsets.insert(position, offset);
        Ok(())
    }

    /// Index of a confirmed offset, or of an exactly-on-grid guess.
    pub fn find(&self, offset: u64) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let position = state.offsets.partition_point(|&existing| existing < offset);
        if state.offsets.get(position) == Some(&offset) {
            return Some(position);
        }

        let last = *state.offsets.back()?;
        if offset > last && offset < self.stream_bits && offset % self.spacing_bits == 0 {
            let partition_index = offset / self.spacing_bits;
            let first = self.first_partition_index(&state);
            if partition_index >= first {
                return Some(state.offsets.len() + (partition_index - first) as usize);
            }
        }
        None
    }

    pub fn is_confirmed(&self, offset: u64) -> bool {
        let state = self.state.lock().unwrap();
        let position = state.offsets.partition_point(|&existing| existing < offset);
        state.offsets.get(position) == Some(&offset)
    }

    /// Replace all offsets with a known-complete list (index import) and
    /// finalize.
    pub fn set_offsets(&self, offsets: Vec<u64>) {
        let mut state = self.state.lock().unwrap();
        state.offsets = offsets.into();
        state.finalized = true;
    }

    /// Index of the first partition guess strictly past the last confirmed
    /// offset.
    fn first_partition_index(&self, state: &FinderState) -> u64 {
        state
            .offsets
            .back()
            .map(|&last| last / self.spacing_bits + 1)
            .unwrap_or(0)
    }

    fn gather_more_bgzf_blocks(&self, state: &mut FinderState, index: usize, timeout: f64) {
        let deadline = (timeout.is_finite() && timeout > 0.0)
            .then(|| Instant::now() + Duration::from_secs_f64(timeout));

        while index + self.batch_fetch_count >= state.offsets.len() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return;
                }
            }
            let next = state
                .bgzf_scanner
                .as_mut()
                .expect("checked by caller")
                .next_offset(&self.source);
            match next {
                Some(offset) if offset < self.stream_bits => {
                    let position = state.offsets.partition_point(|&existing| existing < offset);
                    if state.offsets.get(position) != Some(&offset) {
                        state.offsets.insert(position, offset);
                    }
                }
                _ => {
                    // The chain ended: every block offset is now known.
                    state.finalized = true;
                    return;
                }
            }
        }
    }
}

/// Scan `[start_bits, end_bits)` for the first provable deflate block
/// header. Dynamic blocks go through the precode filter and then a full
/// header parse; stored blocks are matched on zero padding plus the
/// LEN/NLEN complement. Fixed blocks carry no checkable header and are
/// only ever reached through confirmed boundaries.
pub fn find_first_block(data: &[u8], start_bits: u64, end_bits: u64) -> Option<u64> {
    let end_bits = end_bits.min(data.len() as u64 * 8);
    let mut offset = start_bits;
    while offset < end_bits {
        if check_candidate(data, offset) {
            return Some(offset);
        }
        offset += 1;
    }
    None
}

/// Full validation of a candidate block start at one bit offset.
fn check_candidate(data: &[u8], offset: u64) -> bool {
    let mut reader = match BitReader::at_bit_offset(data, offset) {
        Ok(reader) => reader,
        Err(_) => return false,
    };

    // A chunk start mid-stream is a non-final block.
    let header = reader.peek(17);
    let is_final = header & 1;
    let block_type = (header >> 1) & 0b11;
    if is_final != 0 {
        return false;
    }

    match block_type {
        0b00 => check_stored_candidate(data, &mut reader, offset),
        0b10 => check_dynamic_candidate(&mut reader, header, offset),
        // Fixed blocks (01) are unverifiable here; 11 is reserved.
        _ => false,
    }
}

fn check_stored_candidate(data: &[u8], reader: &mut BitReader<'_>, offset: u64) -> bool {
    // Padding up to the byte boundary is written as zeros by encoders.
    if reader.consume(3).is_err() {
        return false;
    }
    let padding_bits = ((8 - (offset + 3) % 8) % 8) as u32;
    if padding_bits > 0 {
        if reader.peek(padding_bits) != 0 || reader.consume(padding_bits).is_err() {
            return false;
        }
    }
    let (Ok(length), Ok(complement)) = (reader.read_u16_le(), reader.read_u16_le()) else {
        return false;
    };
    if length == 0 || length != !complement {
        return false;
    }
    // The full payload must exist in the stream.
    reader.tell() / 8 + length as u64 <= data.len() as u64
}

fn check_dynamic_candidate(reader: &mut BitReader<'_>, header: u64, offset: u64) -> bool {
    let literal_count_bits = (header >> 3) & 0b11111;
    let distance_count_bits = (header >> 8) & 0b11111;
    if literal_count_bits > 29 || distance_count_bits > 29 {
        return false;
    }

    let hclen_bits = (header >> 13) & 0b1111;
    if reader.consume(17).is_err() {
        return false;
    }
    let precode_bits = reader.peek(57);
    if precode::check_precode(hclen_bits, precode_bits).is_err() {
        return false;
    }

    // Survivor: prove it by building the actual tables. Rewind to just
    // past the three block-header bits and parse the whole header.
    if reader.seek(offset + 3).is_err() {
        return false;
    }
    deflate::read_dynamic_tables(reader).is_ok()
}
