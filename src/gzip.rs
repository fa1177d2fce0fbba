//! RFC 1952 framing: member headers, trailers, multi-member streams.
//!
//! Headers and trailers are always byte-aligned (a member's deflate stream
//! ends on a byte boundary before its trailer), so this module works on
//! plain byte offsets and leaves bit arithmetic to the deflate decoder.

use crate::crc32;
use crate::error::{PargzError, PargzResult};

pub const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const METHOD_DEFLATE: u8 = 8;

const FLAG_HCRC: u8 = 0b0000_0010;
const FLAG_EXTRA: u8 = 0b0000_0100;
const FLAG_NAME: u8 = 0b0000_1000;
const FLAG_COMMENT: u8 = 0b0001_0000;
const FLAG_RESERVED: u8 = 0b1110_0000;

pub const TRAILER_SIZE: usize = 8;
pub const MIN_HEADER_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberHeader {
    /// Byte offset just past the header: the start of the deflate stream.
    pub data_offset: usize,
    /// Byte range of the FEXTRA payload, when present.
    pub extra: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberTrailer {
    pub crc32: u32,
    /// Decompressed member size modulo 2^32.
    pub isize: u32,
}

/// Parse one member header starting at `offset`. Extra fields, file names
/// and comments are validated and skipped; a header CRC is verified when
/// present. Truncation mid-header reports `EndOfFile` so callers at the end
/// of a stream can map it to `IncompleteStream`.
pub fn parse_header(data: &[u8], offset: usize) -> PargzResult<MemberHeader> {
    if data.len() < offset + 2 {
        return Err(PargzError::EndOfFile);
    }
    if data[offset..offset + 2] != GZIP_MAGIC {
        return Err(PargzError::InvalidMagic);
    }
    if data.len() < offset + MIN_HEADER_SIZE {
        return Err(PargzError::EndOfFile);
    }
    if data[offset + 2] != METHOD_DEFLATE {
        return Err(PargzError::InvalidGzipHeader("unknown compression method"));
    }
    let flags = data[offset + 3];
    if flags & FLAG_RESERVED != 0 {
        return Err(PargzError::InvalidGzipHeader("reserved flag bits set"));
    }
    // MTIME (4), XFL (1), OS (1) carry no structural information.
    let mut cursor = offset + MIN_HEADER_SIZE;
    let mut extra = None;

    if flags & FLAG_EXTRA != 0 {
        if data.len() < cursor + 2 {
            return Err(PargzError::EndOfFile);
        }
        let extra_length = u16::from_le_bytes([data[cursor], data[cursor + 1]]) as usize;
        cursor += 2;
        if data.len() < cursor + extra_length {
            return Err(PargzError::EndOfFile);
        }
        extra = Some((cursor, cursor + extra_length));
        cursor += extra_length;
    }
    if flags & FLAG_NAME != 0 {
        cursor = skip_zero_terminated(data, cursor)?;
    }
    if flags & FLAG_COMMENT != 0 {
        cursor = skip_zero_terminated(data, cursor)?;
    }
    if flags & FLAG_HCRC != 0 {
        if data.len() < cursor + 2 {
            return Err(PargzError::EndOfFile);
        }
        let stored = u16::from_le_bytes([data[cursor], data[cursor + 1]]);
        let computed = (crc32::checksum(&data[offset..cursor]) & 0xFFFF) as u16;
        if stored != computed {
            return Err(PargzError::InvalidGzipHeader("header CRC mismatch"));
        }
        cursor += 2;
    }

    Ok(MemberHeader {
        data_offset: cursor,
        extra,
    })
}

fn skip_zero_terminated(data: &[u8], mut cursor: usize) -> PargzResult<usize> {
    while cursor < data.len() {
        if data[cursor] == 0 {
            return Ok(cursor + 1);
        }
        cursor += 1;
    }
    Err(PargzError::EndOfFile)
}

pub fn parse_trailer(data: &[u8], offset: usize) -> PargzResult<MemberTrailer> {
    if data.len() < offset + TRAILER_SIZE {
        return Err(PargzError::EndOfFile);
    }
    let crc32 = u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]);
    let isize = u32::from_le_bytes([
        data[offset + 4],
        data[offset + 5],
        data[offset + 6],
        data[offset + 7],
    ]);
    Ok(MemberTrailer { crc32, isize })
}

/// Find a subfield of a FEXTRA payload by its two-byte identifier.
pub fn find_extra_subfield<'a>(data: &'a [u8], extra: (usize, usize), id: [u8; 2]) -> Option<&'a [u8]> {
    let field = data.get(extra.0..extra.1)?;
    let mut cursor = 0;
    while cursor + 4 <= field.len() {
        let subfield_length =
            u16::from_le_bytes([field[cursor + 2], field[cursor + 3]]) as usize;
        let payload_start = cursor + 4;
        let payload_end = payload_start + subfield_length;
        if payload_end > field.len() {
            return None;
        }
        if field[cursor..cursor + 2] == id {
            return Some(&field[payload_start..payload_end]);
        }
        cursor = payload_end;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn encode(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn parses_plain_header() {
        let stream = encode(b"hello");
        let header = parse_header(&stream, 0).unwrap();
        assert!(header.data_offset >= MIN_HEADER_SIZE);
        assert!(header.extra.is_none());
    }

    #[test]
    fn parses_trailer_fields() {
        let payload = b"hello trailer";
        let stream = encode(payload);
        let trailer = parse_trailer(&stream, stream.len() - TRAILER_SIZE).unwrap();
        assert_eq!(trailer.crc32, crc32::checksum(payload));
        assert_eq!(trailer.isize, payload.len() as u32);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut stream = encode(b"x");
        stream[0] = 0x00;
        assert!(matches!(
            parse_header(&stream, 0),
            Err(PargzError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_reserved_flags() {
        let mut stream = encode(b"x");
        stream[3] |= 0x80;
        assert!(matches!(
            parse_header(&stream, 0),
            Err(PargzError::InvalidGzipHeader(_))
        ));
    }

    #[test]
    fn truncated_header_is_eof() {
        let stream = encode(b"x");
        assert!(matches!(
            parse_header(&stream[..4], 0),
            Err(PargzError::EndOfFile)
        ));
    }

    #[test]
    fn skips_name_extra_and_comment() {
        // Hand-build a header with FEXTRA + FNAME + FCOMMENT.
        let mut stream = vec![
            0x1F, 0x8B, 8, FLAG_EXTRA | FLAG_NAME | FLAG_COMMENT, 0, 0, 0, 0, 0, 255,
        ];
        stream.extend_from_slice(&[6, 0]); // XLEN
        stream.extend_from_slice(b"AB\x02\x00\x34\x12"); // one subfield
        stream.extend_from_slice(b"name\0");
        stream.extend_from_slice(b"comment\0");
        let header_end = stream.len();
        stream.extend_from_slice(&[0u8; 16]); // pretend deflate data

        let header = parse_header(&stream, 0).unwrap();
        assert_eq!(header.data_offset, header_end);

        let extra = header.extra.unwrap();
        let payload = find_extra_subfield(&stream, extra, *b"AB").unwrap();
        assert_eq!(payload, &[0x34, 0x12]);
        assert!(find_extra_subfield(&stream, extra, *b"ZZ").is_none());
    }
}
