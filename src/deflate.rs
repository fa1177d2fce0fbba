//! Chunk decoder: deflate from an arbitrary bit offset, without the window.
//!
//! A chunk that starts mid-stream cannot resolve back-references reaching
//! before its first byte. Decoding therefore produces `u16` cells: 0–255
//! are literals, values `MARKER_BASE + d` stand for "the byte `d + 1`
//! positions before this chunk's start". Once the preceding chunk's exit
//! window is known, `resolve` rewrites the cells to plain bytes in one pass
//! and derives the chunk's CRC segments and its own exit window.
//!
//! Chunks also cross gzip member boundaries: on a final block the footer is
//! read and recorded, the window resets to empty (references never span
//! members), and decoding continues into the next member unless a stop
//! condition is met. Stops only ever happen at block boundaries, so the
//! exit bit offset is always a valid next chunk start.

use tracing::debug;

use crate::bit_reader::BitReader;
use crate::crc32;
use crate::error::{PargzError, PargzResult};
use crate::gzip;
use crate::huffman::{self, HuffmanTable};
use crate::precode::PRECODE_SYMBOL_ORDER;

pub const WINDOW_SIZE: usize = 32 * 1024;

/// Cells at or above this value are unresolved window references.
pub const MARKER_BASE: u16 = WINDOW_SIZE as u16;

pub const MAX_MATCH_LENGTH: usize = 258;

const END_OF_BLOCK: u16 = 256;

static LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
static LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
static DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
static DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// A gzip member trailer crossed while decoding a chunk.
#[derive(Debug, Clone, Copy)]
pub struct MemberFooter {
    /// Offset within the chunk's decoded output where the member ends.
    pub decoded_offset: u64,
    pub stored_crc32: u32,
    /// ISIZE field: member size modulo 2^32.
    pub stored_size: u32,
}

/// CRC over one footer-delimited slice of a chunk's output. Segments let
/// the owner combine chunk checksums into member checksums without ever
/// re-reading decoded data.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCrc {
    pub length: u64,
    pub crc32: u32,
}

#[derive(Debug, Clone)]
enum ChunkData {
    /// Intermediate representation, possibly containing markers.
    Marked(Vec<u16>),
    /// Fully resolved output bytes.
    Bytes(Vec<u8>),
}

/// Stop conditions for one chunk decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkLimits {
    /// Hard boundary: stop at the first block boundary at or past this bit
    /// offset. Used when the next chunk start is already confirmed.
    pub until_bits: Option<u64>,
    /// Soft output-side bound: stop at the first block boundary once this
    /// many bytes were produced.
    pub soft_size: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DecodedChunk {
    /// Bit offset of the first decoded block.
    pub start_bits: u64,
    /// Exit bit offset: the next block boundary (or end of stream).
    pub end_bits: u64,
    pub footers: Vec<MemberFooter>,
    /// The input ended mid-member; decoded bytes are a valid prefix but the
    /// stream is missing its trailer.
    pub incomplete: bool,
    /// This chunk consumed the last member's trailer (or hit true EOF).
    pub ends_stream: bool,
    pub marker_count: u64,
    data: ChunkData,
    /// Filled in by `resolve`.
    segments: Vec<SegmentCrc>,
    exit_window: Vec<u8>,
}

impl DecodedChunk {
    #[inline]
    pub fn is_resolved(&self) -> bool {
        matches!(self.data, ChunkData::Bytes(_))
    }

    #[inline]
    pub fn decoded_size(&self) -> u64 {
        match &self.data {
            ChunkData::Marked(cells) => cells.len() as u64,
            ChunkData::Bytes(bytes) => bytes.len() as u64,
        }
    }

    /// Decoded bytes, available once resolved.
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.data {
            ChunkData::Bytes(bytes) => Some(bytes),
            ChunkData::Marked(_) => None,
        }
    }

    /// Per-member-segment checksums, available once resolved.
    pub fn segments(&self) -> &[SegmentCrc] {
        &self.segments
    }

    /// Trailing window for the next chunk: empty when this chunk ends
    /// exactly at a member boundary.
    pub fn exit_window(&self) -> &[u8] {
        &self.exit_window
    }

    /// Replace markers with bytes from the preceding window, then compute
    /// segment CRCs and the exit window. Idempotent.
    pub fn resolve(&mut self, window: &[u8]) -> PargzResult<()> {
        let cells = match &self.data {
            ChunkData::Bytes(_) => return Ok(()),
            ChunkData::Marked(cells) => cells,
        };

        let mut bytes = Vec::with_capacity(cells.len());
        for &cell in cells {
            let byte = if cell < 256 {
                cell as u8
            } else if cell >= MARKER_BASE {
                let back = (cell - MARKER_BASE) as usize;
                if back >= window.len() {
                    return Err(PargzError::InvalidBackreference {
                        bit_position: self.start_bits,
                    });
                }
                window[window.len() - 1 - back]
            } else {
                return Err(PargzError::internal(format!(
                    "marker cell {cell} outside the intermediate alphabet"
                )));
            };
            bytes.push(byte);
        }

        self.finish_resolution(bytes, window);
        Ok(())
    }

    fn finish_resolution(&mut self, bytes: Vec<u8>, window: &[u8]) {
        let total = bytes.len() as u64;

        let mut segments = Vec::with_capacity(self.footers.len() + 1);
        let mut begin = 0u64;
        for footer in &self.footers {
            let end = footer.decoded_offset;
            segments.push(SegmentCrc {
                length: end - begin,
                crc32: crc32::checksum(&bytes[begin as usize..end as usize]),
            });
            begin = end;
        }
        if begin < total || segments.is_empty() {
            segments.push(SegmentCrc {
                length: total - begin,
                crc32: crc32::checksum(&bytes[begin as usize..]),
            });
        }
        self.segments = segments;

        // Exit window: the trailing 32 KiB of history visible to the next
        // chunk. History never crosses a member boundary; before the first
        // boundary it extends into the preceding window.
        let barrier = self.footers.last().map(|f| f.decoded_offset).unwrap_or(0);
        let produced = (total - barrier) as usize;
        let take_new = produced.min(WINDOW_SIZE);
        let mut exit_window = Vec::with_capacity(WINDOW_SIZE.min(produced + window.len()));
        if barrier == 0 && take_new < WINDOW_SIZE {
            let take_old = (WINDOW_SIZE - take_new).min(window.len());
            exit_window.extend_from_slice(&window[window.len() - take_old..]);
        }
        exit_window.extend_from_slice(&bytes[bytes.len() - take_new..]);
        self.exit_window = exit_window;

        self.data = ChunkData::Bytes(bytes);
    }
}

/// Decode one chunk starting at `start_bits` (which must be a deflate
/// block boundary).
///
/// With `window == Some(w)` the preceding history is known and the result
/// comes back resolved; distances reaching past `w` are data errors. With
/// `window == None` the decode is speculative: out-of-chunk references
/// become markers and the caller resolves them later.
pub fn decode_chunk(
    data: &[u8],
    start_bits: u64,
    window: Option<&[u8]>,
    limits: ChunkLimits,
) -> PargzResult<DecodedChunk> {
    let mut decoder = Decoder::new(data, start_bits, window)?;
    match decoder.run(&limits) {
        Ok(()) => {}
        // The stream ran out mid-member: everything decoded so far is a
        // valid prefix, the missing remainder surfaces as IncompleteStream
        // when a read crosses it.
        Err(PargzError::EndOfFile) => {
            decoder.incomplete = true;
            decoder.ends_stream = true;
        }
        Err(error) => return Err(error),
    }

    let mut chunk = DecodedChunk {
        start_bits,
        end_bits: decoder.reader.tell(),
        footers: decoder.footers,
        incomplete: decoder.incomplete,
        ends_stream: decoder.ends_stream,
        marker_count: decoder.marker_count,
        data: ChunkData::Marked(decoder.out),
        segments: Vec::new(),
        exit_window: Vec::new(),
    };
    if let Some(window) = window {
        chunk.resolve(window)?;
    }
    Ok(chunk)
}

/// Parse a dynamic block header (everything after the three block-header
/// bits) and build its literal/length and distance tables. Shared with the
/// block finder, which uses a successful parse as the final proof that a
/// candidate offset really starts a block.
pub(crate) fn read_dynamic_tables(
    reader: &mut BitReader<'_>,
) -> PargzResult<(HuffmanTable, HuffmanTable)> {
    let literal_count = reader.read(5)? as usize + 257;
    let distance_count = reader.read(5)? as usize + 1;
    let precode_count = reader.read(4)? as usize + 4;
    if literal_count > huffman::MAX_LITLEN_SYMBOLS || distance_count > huffman::MAX_DISTANCE_SYMBOLS
    {
        return Err(PargzError::InvalidCodeLengths);
    }

    let mut precode_lengths = [0u8; 19];
    for &symbol in PRECODE_SYMBOL_ORDER.iter().take(precode_count) {
        precode_lengths[symbol] = reader.read(3)? as u8;
    }
    let precode = HuffmanTable::from_lengths(&precode_lengths, false)?;

    let total = literal_count + distance_count;
    let mut lengths = [0u8; 286 + 30];
    let mut filled = 0usize;
    while filled < total {
        let symbol = precode.decode(reader)?;
        match symbol {
            0..=15 => {
                lengths[filled] = symbol as u8;
                filled += 1;
            }
            16 => {
                if filled == 0 {
                    return Err(PargzError::InvalidCodeLengths);
                }
                let repeat = reader.read(2)? as usize + 3;
                if filled + repeat > total {
                    return Err(PargzError::InvalidCodeLengths);
                }
                let previous = lengths[filled - 1];
                lengths[filled..filled + repeat].fill(previous);
                filled += repeat;
            }
            17 => {
                let repeat = reader.read(3)? as usize + 3;
                if filled + repeat > total {
                    return Err(PargzError::InvalidCodeLengths);
                }
                filled += repeat;
            }
            18 => {
                let repeat = reader.read(7)? as usize + 11;
                if filled + repeat > total {
                    return Err(PargzError::InvalidCodeLengths);
                }
                filled += repeat;
            }
            _ => return Err(PargzError::InvalidCodeLengths),
        }
    }

    if lengths[END_OF_BLOCK as usize] == 0 {
        // A block with no way to terminate cannot be valid.
        return Err(PargzError::InvalidCodeLengths);
    }

    let litlen = HuffmanTable::from_lengths(&lengths[..literal_count], false)?;
    let distance = HuffmanTable::from_lengths(&lengths[literal_count..total], true)?;
    Ok((litlen, distance))
}

struct Decoder<'a> {
    reader: BitReader<'a>,
    data: &'a [u8],
    out: Vec<u16>,
    /// Ring of the last 32 KiB of cells, indexed by absolute output
    /// position; negative positions hold the preloaded window.
    ring: Vec<u16>,
    total: u64,
    /// Output offset of the last member boundary within this chunk.
    barrier: u64,
    /// Bytes of known preceding window (resolved mode only).
    preload: usize,
    marker_mode: bool,
    marker_count: u64,
    footers: Vec<MemberFooter>,
    ends_stream: bool,
    incomplete: bool,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], start_bits: u64, window: Option<&[u8]>) -> PargzResult<Self> {
        let reader = BitReader::at_bit_offset(data, start_bits)?;
        let mut ring = vec![0u16; WINDOW_SIZE];
        let (preload, marker_mode) = match window {
            Some(window) => {
                let tail = &window[window.len().saturating_sub(WINDOW_SIZE)..];
                for (i, &byte) in tail.iter().enumerate() {
                    ring[(WINDOW_SIZE - tail.len() + i) & (WINDOW_SIZE - 1)] = byte as u16;
                }
                (tail.len(), false)
            }
            None => (0, true),
        };
        Ok(Self {
            reader,
            data,
            out: Vec::new(),
            ring,
            total: 0,
            barrier: 0,
            preload,
            marker_mode,
            marker_count: 0,
            footers: Vec::new(),
            ends_stream: false,
            incomplete: false,
        })
    }

    fn run(&mut self, limits: &ChunkLimits) -> PargzResult<()> {
        loop {
            if self.should_stop(limits) {
                return Ok(());
            }

            let block_start = self.reader.tell();
            let is_final = self.reader.read(1)? == 1;
            let block_type = self.reader.read(2)?;
            match block_type {
                0 => self.decode_stored(block_start)?,
                1 => self.decode_huffman(huffman::fixed_litlen_table(), huffman::fixed_distance_table())?,
                2 => {
                    let (litlen, distance) = self.decode_dynamic_header()?;
                    self.decode_huffman(&litlen, &distance)?;
                }
                _ => {
                    return Err(PargzError::InvalidBlockType {
                        bit_position: block_start,
                    })
                }
            }

            if is_final && !self.finish_member(limits)? {
                return Ok(());
            }
        }
    }

    /// Read the member trailer and, when decoding continues, the following
    /// member header. Returns whether to keep decoding.
    fn finish_member(&mut self, limits: &ChunkLimits) -> PargzResult<bool> {
        self.reader.align_to_byte()?;
        let stored_crc32 = self.reader.read_u32_le()?;
        let stored_size = self.reader.read_u32_le()?;
        self.footers.push(MemberFooter {
            decoded_offset: self.total,
            stored_crc32,
            stored_size,
        });
        self.barrier = self.total;

        if self.reader.is_eof() {
            self.ends_stream = true;
            return Ok(false);
        }

        let header_offset = (self.reader.tell() / 8) as usize;
        match gzip::parse_header(self.data, header_offset) {
            Ok(header) => {
                self.reader.seek(header.data_offset as u64 * 8)?;
                Ok(!self.should_stop(limits))
            }
            Err(error) => {
                // Trailing non-gzip bytes end the stream, like gzip(1).
                debug!(offset = header_offset, %error, "ignoring trailing bytes after final member");
                self.ends_stream = true;
                Ok(false)
            }
        }
    }

    fn should_stop(&mut self, limits: &ChunkLimits) -> bool {
        if let Some(until) = limits.until_bits {
            if self.reader.tell() >= until {
                return true;
            }
        }
        if let Some(soft) = limits.soft_size {
            if self.total >= soft {
                return true;
            }
        }
        false
    }

    #[inline]
    fn push(&mut self, cell: u16) {
        self.out.push(cell);
        self.ring[(self.total as usize) & (WINDOW_SIZE - 1)] = cell;
        self.total += 1;
    }

    fn decode_stored(&mut self, block_start: u64) -> PargzResult<()> {
        self.reader.align_to_byte()?;
        let length = self.reader.read_u16_le()?;
        let complement = self.reader.read_u16_le()?;
        if length != !complement {
            return Err(PargzError::InvalidBlockType {
                bit_position: block_start,
            });
        }
        for _ in 0..length {
            let byte = self.reader.read_u8()?;
            self.push(byte as u16);
        }
        Ok(())
    }

    fn decode_dynamic_header(&mut self) -> PargzResult<(HuffmanTable, HuffmanTable)> {
        read_dynamic_tables(&mut self.reader)
    }

    fn decode_huffman(
        &mut self,
        litlen: &HuffmanTable,
        distance_table: &HuffmanTable,
    ) -> PargzResult<()> {
        loop {
            let symbol = litlen.decode(&mut self.reader)?;
            if symbol < 256 {
                self.push(symbol);
            } else if symbol == END_OF_BLOCK {
                return Ok(());
            } else {
                let index = (symbol - 257) as usize;
                if index >= LENGTH_BASE.len() {
                    return Err(PargzError::InvalidHuffmanCode {
                        bit_position: self.reader.tell(),
                    });
                }
                let length =
                    LENGTH_BASE[index] as u32 + self.reader.read(LENGTH_EXTRA[index] as u32)? as u32;

                let distance_symbol = distance_table.decode(&mut self.reader)? as usize;
                if distance_symbol >= DIST_BASE.len() {
                    return Err(PargzError::InvalidHuffmanCode {
                        bit_position: self.reader.tell(),
                    });
                }
                let distance = DIST_BASE[distance_symbol] as u64
                    + self.reader.read(DIST_EXTRA[distance_symbol] as u32)?;

                self.copy_match(distance, length)?;
            }
        }
    }

    fn copy_match(&mut self, distance: u64, length: u32) -> PargzResult<()> {
        let since_member = self.total - self.barrier;
        let known = if self.barrier == 0 {
            self.preload as u64
        } else {
            0
        };
        if distance > since_member + known && !(self.marker_mode && self.barrier == 0) {
            return Err(PargzError::InvalidBackreference {
                bit_position: self.reader.tell(),
            });
        }

        for _ in 0..length {
            let source = self.total as i64 - distance as i64;
            let cell = if source >= 0 {
                self.ring[(source as usize) & (WINDOW_SIZE - 1)]
            } else if self.marker_mode {
                self.marker_count += 1;
                MARKER_BASE + (-source - 1) as u16
            } else {
                self.ring[((WINDOW_SIZE as i64 + source) as usize) & (WINDOW_SIZE - 1)]
            };
            self.push(cell);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip_encode(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn first_block_offset(stream: &[u8]) -> u64 {
        gzip::parse_header(stream, 0).unwrap().data_offset as u64 * 8
    }

    #[test]
    fn decodes_whole_member_with_empty_window() {
        let original = b"the quick brown fox jumps over the lazy dog";
        let stream = gzip_encode(original);

        let chunk = decode_chunk(
            &stream,
            first_block_offset(&stream),
            Some(&[]),
            ChunkLimits::default(),
        )
        .unwrap();

        assert!(chunk.is_resolved());
        assert!(chunk.ends_stream);
        assert!(!chunk.incomplete);
        assert_eq!(chunk.bytes().unwrap(), original);
        assert_eq!(chunk.footers.len(), 1);
        assert_eq!(chunk.footers[0].stored_crc32, crc32::checksum(original));
        assert_eq!(chunk.footers[0].stored_size, original.len() as u32);
        // Ends at a member boundary: the next chunk needs no history.
        assert!(chunk.exit_window().is_empty());
    }

    #[test]
    fn repeated_data_round_trips() {
        let original: Vec<u8> = b"aaaaaaaaaaaaaaaa".to_vec();
        let stream = gzip_encode(&original);
        let chunk = decode_chunk(
            &stream,
            first_block_offset(&stream),
            Some(&[]),
            ChunkLimits::default(),
        )
        .unwrap();
        assert_eq!(chunk.bytes().unwrap(), &original[..]);
    }

    #[test]
    fn empty_member_decodes_to_nothing() {
        let stream = gzip_encode(b"");
        let chunk = decode_chunk(
            &stream,
            first_block_offset(&stream),
            Some(&[]),
            ChunkLimits::default(),
        )
        .unwrap();
        assert_eq!(chunk.decoded_size(), 0);
        assert!(chunk.ends_stream);
        assert_eq!(chunk.segments().len(), 1);
        assert_eq!(chunk.segments()[0].length, 0);
    }

    #[test]
    fn multi_member_stream_decodes_in_one_chunk() {
        let mut stream = gzip_encode(b"Hello");
        stream.extend_from_slice(&gzip_encode(b"World"));

        let chunk = decode_chunk(
            &stream,
            first_block_offset(&stream),
            Some(&[]),
            ChunkLimits::default(),
        )
        .unwrap();

        assert_eq!(chunk.bytes().unwrap(), b"HelloWorld");
        assert_eq!(chunk.footers.len(), 2);
        assert_eq!(chunk.footers[0].decoded_offset, 5);
        assert_eq!(chunk.segments().len(), 2);
        assert_eq!(chunk.segments()[0].crc32, crc32::checksum(b"Hello"));
        assert_eq!(chunk.segments()[1].crc32, crc32::checksum(b"World"));
    }

    #[test]
    fn truncated_stream_is_incomplete_with_valid_prefix() {
        let original: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let stream = gzip_encode(&original);
        let truncated = &stream[..stream.len() - 10];

        let chunk = decode_chunk(
            truncated,
            first_block_offset(truncated),
            Some(&[]),
            ChunkLimits::default(),
        )
        .unwrap();

        assert!(chunk.incomplete);
        assert!(chunk.footers.is_empty());
        let bytes = chunk.bytes().unwrap();
        assert_eq!(bytes, &original[..bytes.len()]);
    }

    #[test]
    fn speculative_decode_marks_unresolved_references() {
        // Compress data whose tail references its head, then decode only
        // the second member... single member case: decode from the first
        // block with no window and verify markers resolve correctly.
        let mut original = Vec::new();
        for i in 0..2000u32 {
            original.extend_from_slice(format!("line {:06} of filler\n", i % 37).as_bytes());
        }
        let stream = gzip_encode(&original);
        let start = first_block_offset(&stream);

        let mut speculative =
            decode_chunk(&stream, start, None, ChunkLimits::default()).unwrap();
        assert!(!speculative.is_resolved());

        // The leading chunk of a stream has an empty preceding window, so
        // no marker may survive resolution against it.
        assert_eq!(speculative.marker_count, 0);
        speculative.resolve(&[]).unwrap();
        assert_eq!(speculative.bytes().unwrap(), &original[..]);

        let resolved = decode_chunk(&stream, start, Some(&[]), ChunkLimits::default()).unwrap();
        assert_eq!(
            resolved.bytes().unwrap(),
            speculative.bytes().unwrap()
        );
    }

    #[test]
    fn markers_resolve_against_previous_window() {
        // Two chunks cut at a block boundary: decode the whole stream once
        // to learn a mid-stream boundary, then decode the tail
        // speculatively and resolve it with the head's exit window.
        let mut original = Vec::new();
        let mut i = 0u64;
        while original.len() < 600_000 {
            original.extend_from_slice(format!("{i:016x} abcdefghijklmnop\n").as_bytes());
            i = i.wrapping_mul(6364136223846793005).wrapping_add(17);
        }
        let stream = gzip_encode(&original);
        let start = first_block_offset(&stream);

        let head = decode_chunk(
            &stream,
            start,
            Some(&[]),
            ChunkLimits {
                until_bits: None,
                soft_size: Some(100_000),
            },
        )
        .unwrap();
        assert!(!head.ends_stream);
        let split = head.decoded_size() as usize;
        assert!(split >= 100_000 && split < original.len());

        let mut tail =
            decode_chunk(&stream, head.end_bits, None, ChunkLimits::default()).unwrap();
        assert!(tail.marker_count > 0, "expected unresolved references");
        tail.resolve(head.exit_window()).unwrap();
        assert_eq!(tail.bytes().unwrap(), &original[split..]);
    }

    #[test]
    fn soft_size_stops_at_block_boundary() {
        let original: Vec<u8> = (0..400_000u32).map(|i| (i * 31 % 256) as u8).collect();
        let stream = gzip_encode(&original);
        let start = first_block_offset(&stream);

        let chunk = decode_chunk(
            &stream,
            start,
            Some(&[]),
            ChunkLimits {
                until_bits: None,
                soft_size: Some(1),
            },
        )
        .unwrap();
        // At least one full block, and decoding can resume at end_bits.
        assert!(chunk.decoded_size() >= 1);
        assert!(!chunk.ends_stream);

        let rest = decode_chunk(
            &stream,
            chunk.end_bits,
            Some(chunk.exit_window()),
            ChunkLimits::default(),
        )
        .unwrap();
        let mut joined = chunk.bytes().unwrap().to_vec();
        joined.extend_from_slice(rest.bytes().unwrap());
        assert_eq!(joined, original);
    }

    #[test]
    fn distance_beyond_window_is_invalid() {
        // A reference at distance 1 before any output with an empty window.
        // Hand-built fixed-Huffman block: symbol 257 (length 3),
        // distance 0 (1), end with 256... simpler to validate via the
        // resolved-mode error on a crafted stored+reference stream is
        // brittle; instead check the resolve-side range check.
        let chunk = DecodedChunk {
            start_bits: 0,
            end_bits: 0,
            footers: Vec::new(),
            incomplete: false,
            ends_stream: true,
            marker_count: 1,
            data: ChunkData::Marked(vec![MARKER_BASE]),
            segments: Vec::new(),
            exit_window: Vec::new(),
        };
        let mut too_short = chunk.clone();
        assert!(matches!(
            too_short.resolve(&[]),
            Err(PargzError::InvalidBackreference { .. })
        ));

        let mut long_enough = chunk;
        long_enough.resolve(&[42]).unwrap();
        assert_eq!(long_enough.bytes().unwrap(), &[42]);
    }

    #[test]
    fn marker_distance_boundaries() {
        // Marker for the farthest reachable byte (32768 back) resolves
        // from the first byte of a full window; one further must fail.
        let window: Vec<u8> = (0..WINDOW_SIZE).map(|i| (i % 256) as u8).collect();

        let mut chunk = DecodedChunk {
            start_bits: 0,
            end_bits: 0,
            footers: Vec::new(),
            incomplete: false,
            ends_stream: true,
            marker_count: 1,
            data: ChunkData::Marked(vec![MARKER_BASE + (WINDOW_SIZE as u16 - 1)]),
            segments: Vec::new(),
            exit_window: Vec::new(),
        };
        chunk.resolve(&window).unwrap();
        assert_eq!(chunk.bytes().unwrap(), &[window[0]]);

        let mut beyond = DecodedChunk {
            start_bits: 0,
            end_bits: 0,
            footers: Vec::new(),
            incomplete: false,
            ends_stream: true,
            marker_count: 1,
            data: ChunkData::Marked(vec![MARKER_BASE + (WINDOW_SIZE as u16 - 1)]),
            segments: Vec::new(),
            exit_window: Vec::new(),
        };
        let short_window = &window[1..];
        assert!(matches!(
            beyond.resolve(short_window),
            Err(PargzError::InvalidBackreference { .. })
        ));
    }

    #[test]
    fn reserved_block_type_is_rejected() {
        let stream = gzip_encode(b"payload");
        let start = first_block_offset(&stream);
        assert_eq!(start % 8, 0, "deflate data starts byte-aligned");

        let mut corrupted = stream.clone();
        // BTYPE occupies bits 1-2 of the first deflate byte; 11 is reserved.
        corrupted[(start / 8) as usize] |= 0b110;
        let result = decode_chunk(&corrupted, start, Some(&[]), ChunkLimits::default());
        assert!(matches!(
            result,
            Err(PargzError::InvalidBlockType { .. })
        ));
    }
}
