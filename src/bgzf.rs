//! BGZF probing: the genomics gzip profile with sized blocks.
//!
//! BGZF members carry their own compressed size in a `BC` extra subfield,
//! so block boundaries can be read straight off the headers instead of
//! being guessed. The block finder uses this as an exact fast path: every
//! harvested offset is a confirmed chunk start.

use crate::gzip;

const BGZF_SUBFIELD_ID: [u8; 2] = *b"BC";

/// True when the stream leads with a BGZF header (gzip + FEXTRA carrying a
/// two-byte `BC` subfield).
pub fn is_bgzf(data: &[u8]) -> bool {
    let header = match gzip::parse_header(data, 0) {
        Ok(header) => header,
        Err(_) => return false,
    };
    let Some(extra) = header.extra else {
        return false;
    };
    gzip::find_extra_subfield(data, extra, BGZF_SUBFIELD_ID)
        .map_or(false, |payload| payload.len() == 2)
}

/// Walks the chain of BGZF blocks, yielding the bit offset of each block's
/// deflate stream. Stops permanently at the first malformed header.
#[derive(Debug, Default)]
pub struct BgzfScanner {
    cursor: usize,
    done: bool,
}

impl BgzfScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_offset(&mut self, data: &[u8]) -> Option<u64> {
        if self.done || self.cursor >= data.len() {
            self.done = true;
            return None;
        }

        let header = match gzip::parse_header(data, self.cursor) {
            Ok(header) => header,
            Err(_) => {
                self.done = true;
                return None;
            }
        };
        let block_size = header
            .extra
            .and_then(|extra| gzip::find_extra_subfield(data, extra, BGZF_SUBFIELD_ID))
            .filter(|payload| payload.len() == 2)
            .map(|payload| u16::from_le_bytes([payload[0], payload[1]]) as usize + 1);

        let Some(block_size) = block_size else {
            self.done = true;
            return None;
        };
        // The stored size covers the whole member; anything smaller than
        // its own header is corrupt.
        if block_size <= header.data_offset - self.cursor {
            self.done = true;
            return None;
        }

        let offset_bits = header.data_offset as u64 * 8;
        self.cursor += block_size;
        Some(offset_bits)
    }
}
