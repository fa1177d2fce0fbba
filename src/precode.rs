//! Fast validity filter for dynamic-block precodes.
//!
//! The block finder probes millions of bit offsets, and almost all of them
//! must be rejected without building a Huffman tree. The filter checks the
//! 19×3 = 57 precode length bits in three stages:
//!
//! 1. Five lookups map chunks of four 3-bit lengths to bit-packed partial
//!    histograms (field widths {nonzero:5, c1:1, c2:2, c3:3, c4:4, c5:5,
//!    c6:5, c7:4}, overflow sentinels above bit 29).
//! 2. The partials are summed with plain integer addition; a parallel
//!    carryless xor exposes any carry across a field boundary.
//! 3. The 24-bit histogram (non-zero count stripped) indexes a 2^24-bit
//!    bitmap of histograms that form complete depth-≤7 trees. Histograms
//!    whose counts overflow their fields are power-of-two shapes and are
//!    matched against a small table keyed by the non-zero count — before
//!    the overflow rejection, because their carries alias neighbor fields.
//!
//! False positives are fine (the header parse after the filter is exact);
//! false negatives are not, since a missed candidate loses a chunk start.

use std::sync::LazyLock;

use crate::error::{PargzError, PargzResult};

pub const MAX_PRECODE_SYMBOLS: usize = 19;
pub const PRECODE_BITS: u32 = 3;
pub const MAX_PRECODE_LENGTH: u32 = 7;

/// RFC 1951 order in which precode lengths are stored in the header.
pub const PRECODE_SYMBOL_ORDER: [usize; MAX_PRECODE_SYMBOLS] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// Packed histogram members: non-zero count, then counts of lengths 1..=7.
const MEMBER_WIDTHS: [u32; 8] = [5, 1, 2, 3, 4, 5, 5, 4];
const MEMBER_OFFSETS: [u32; 8] = [0, 5, 6, 8, 11, 15, 20, 25];
const OVERFLOW_OFFSET: u32 = 29;

const HISTOGRAM_LOOKUP_BITS: u32 = 24;
const HISTOGRAM_LOOKUP_MASK: u32 = (1 << HISTOGRAM_LOOKUP_BITS) - 1;

/// Lowest bit of every member; a carry landing on one of these came from
/// the member below it.
const LOWEST_MEMBER_BITS: u32 = (1 << MEMBER_OFFSETS[0])
    | (1 << MEMBER_OFFSETS[1])
    | (1 << MEMBER_OFFSETS[2])
    | (1 << MEMBER_OFFSETS[3])
    | (1 << MEMBER_OFFSETS[4])
    | (1 << MEMBER_OFFSETS[5])
    | (1 << MEMBER_OFFSETS[6])
    | (1 << MEMBER_OFFSETS[7]);

const OVERFLOW_BITS_MASK: u32 = LOWEST_MEMBER_BITS | (u32::MAX << OVERFLOW_OFFSET);

/// Add one code of `length` to a packed histogram, tagging the overflow
/// sentinel when the member saturates. The add itself is never suppressed:
/// associativity must hold so partial histograms can be summed blindly.
const fn increment_count(histogram: u32, length: usize) -> u32 {
    let offset = MEMBER_OFFSETS[length];
    let width = MEMBER_WIDTHS[length];
    let old = (histogram >> offset) & ((1 << width) - 1);
    let incremented = histogram.wrapping_add(1 << offset);
    if old + 1 < (1 << width) {
        incremented
    } else {
        incremented | (1 << OVERFLOW_OFFSET)
    }
}

/// Four 3-bit code lengths (a 12-bit key) to their packed partial histogram.
static PRECODE_CHUNK_TO_HISTOGRAM: [u32; 1 << 12] = build_chunk_histogram_lut();

const fn build_chunk_histogram_lut() -> [u32; 1 << 12] {
    let mut lut = [0u32; 1 << 12];
    let mut key = 0usize;
    while key < lut.len() {
        let mut histogram = 0u32;
        let mut position = 0;
        while position < 4 {
            let length = (key >> (position * 3)) & 0b111;
            if length > 0 {
                histogram = increment_count(histogram, length);
                histogram += 1; // non-zero count lives at offset 0
            }
            position += 1;
        }
        lut[key] = histogram;
        key += 1;
    }
    lut
}

const NO_SPECIAL_CASE: u32 = u32::MAX;

/// Histograms whose counts overflow their packed fields are all of the
/// power-of-two shapes {1:1}, {1:2}, {2:4}, {3:8}, {4:16} plus the one
/// maximally lopsided 19-symbol tree {1:1, 2:1, 3:1, 7:16}. Each non-zero
/// count identifies its shape uniquely, so the overflowed bit pattern the
/// summation produces is matched against this table, keyed by that count.
static POWER_OF_TWO_SPECIAL_CASES: [u32; 32] = build_special_cases();

const fn special_case(count: u32, length: usize) -> u32 {
    ((count << MEMBER_OFFSETS[length]) >> MEMBER_WIDTHS[0]) & HISTOGRAM_LOOKUP_MASK
}

const fn build_special_cases() -> [u32; 32] {
    let mut table = [NO_SPECIAL_CASE; 32];
    table[1] = special_case(1, 1);
    table[2] = special_case(2, 1);
    table[4] = special_case(4, 2);
    table[8] = special_case(8, 3);
    table[16] = special_case(16, 4);
    // {1:1, 2:1, 3:1, 7:16}: the sixteen 7-length codes carry clean out of
    // the 24-bit lookup window, leaving only the three short codes visible.
    table[19] = special_case(1, 1) | special_case(1, 2) | special_case(1, 3);
    table
}

/// 2^24-bit validity bitmap over packed histograms (non-zero count
/// stripped), enumerated from every complete Huffman tree with at most 19
/// leaves and depth at most 7.
static VALID_HISTOGRAM_BITMAP: LazyLock<Box<[u64]>> = LazyLock::new(|| {
    let mut bitmap = vec![0u64; (1usize << HISTOGRAM_LOOKUP_BITS) / 64].into_boxed_slice();
    let mut counts = [0u32; 8];
    enumerate_complete_trees(1, 2, 0, &mut counts, &mut bitmap);
    bitmap
});

fn enumerate_complete_trees(
    depth: usize,
    unused_leaves: u32,
    total: u32,
    counts: &mut [u32; 8],
    bitmap: &mut [u64],
) {
    if depth > MAX_PRECODE_LENGTH as usize {
        if unused_leaves == 0 {
            if let Some(value) = pack_histogram(counts) {
                bitmap[(value / 64) as usize] |= 1u64 << (value % 64);
            }
        }
        return;
    }
    let limit = unused_leaves.min(MAX_PRECODE_SYMBOLS as u32 - total);
    for count in 0..=limit {
        counts[depth] = count;
        enumerate_complete_trees(
            depth + 1,
            (unused_leaves - count) * 2,
            total + count,
            counts,
            bitmap,
        );
    }
    counts[depth] = 0;
}

/// Pack counts into the 24-bit lookup value, or `None` when a count does
/// not fit its field (those shapes live in the special-case table).
fn pack_histogram(counts: &[u32; 8]) -> Option<u32> {
    let mut value = 0u32;
    for length in 1..=MAX_PRECODE_LENGTH as usize {
        let count = counts[length];
        if count >= 1 << MEMBER_WIDTHS[length] {
            return None;
        }
        value |= count << (MEMBER_OFFSETS[length] - MEMBER_WIDTHS[0]);
    }
    Some(value)
}

/// Validate the precode of a dynamic deflate block without building a tree.
///
/// `hclen_bits` are the 4 HCLEN bits; `precode_bits` are the next 57 bits
/// of the stream (over-read is fine, the count masks them). ~10 ns per
/// call; rejects the overwhelming majority of random bit patterns.
#[inline]
pub fn check_precode(hclen_bits: u64, precode_bits: u64) -> PargzResult<()> {
    let code_length_count = 4 + hclen_bits as u32;
    let active_bits = code_length_count * PRECODE_BITS;
    let precode_bits = precode_bits & ((1u64 << active_bits) - 1);

    let mut frequencies = 0u32;
    let mut overflows_in_sum = 0u32;
    let mut overflows_in_lut = 0u32;

    for chunk in 0..5 {
        let key = ((precode_bits >> (chunk * 12)) & 0xFFF) as usize;
        let partial = PRECODE_CHUNK_TO_HISTOGRAM[key];

        // Carryless addition is xor; a bit where the real sum differs from
        // the xor received a carry from below, i.e. a member overflowed.
        let carryless = frequencies ^ partial;
        frequencies = frequencies.wrapping_add(partial);
        overflows_in_sum |= carryless ^ frequencies;
        overflows_in_lut |= partial;
    }

    let to_look_up = (frequencies >> MEMBER_WIDTHS[0]) & HISTOGRAM_LOOKUP_MASK;
    let non_zero_count = frequencies & ((1 << MEMBER_WIDTHS[0]) - 1);

    if POWER_OF_TWO_SPECIAL_CASES[non_zero_count as usize] == to_look_up {
        return Ok(());
    }

    if overflows_in_sum & OVERFLOW_BITS_MASK != 0
        || overflows_in_lut & (u32::MAX << OVERFLOW_OFFSET) != 0
    {
        return Err(PargzError::InvalidCodeLengths);
    }

    let word = VALID_HISTOGRAM_BITMAP[(to_look_up / 64) as usize];
    if word & (1u64 << (to_look_up % 64)) == 0 {
        // Also covers the all-zero histogram: an empty precode is invalid.
        return Err(PargzError::BloatingHuffmanCoding);
    }

    Ok(())
}
