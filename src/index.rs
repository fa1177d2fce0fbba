//! The persisted seek index: `GZIDX` format, version 1.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic            8  "GZIDX\0\0\x01"
//! format_version   1  = 1
//! flags            1  bit0 = windows deflate-compressed
//! chunk_count      8
//! record_count     8  = chunk_count + 1 (end-of-stream sentinel record)
//! per record:
//!   compressed_bit_offset     8
//!   decompressed_byte_offset  8
//!   window_length             4
//!   window_bytes              window_length
//! trailer:
//!   stream_total_decompressed_size  8
//!   stream_crc32                    4
//!   record_crc32_of_preceding_bytes 4
//! ```
//!
//! The sentinel record pairs the stream's end bit offset with its total
//! decompressed size and carries an empty window; importing it rebuilds a
//! finalized block map without touching the compressed stream.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tracing::debug;

use crate::crc32::{Crc32Reader, Crc32Writer};
use crate::deflate::WINDOW_SIZE;
use crate::error::{PargzError, PargzResult};
use crate::window_map::WindowCompression;

pub const INDEX_MAGIC: [u8; 8] = *b"GZIDX\0\0\x01";
pub const INDEX_FORMAT_VERSION: u8 = 1;
const FLAG_WINDOWS_COMPRESSED: u8 = 0b0000_0001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub compressed_bit_offset: u64,
    pub decompressed_byte_offset: u64,
    /// Raw (decompressed) window bytes; empty at member boundaries and on
    /// the sentinel record.
    pub window: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIndex {
    /// Chunk records followed by the end-of-stream sentinel.
    pub records: Vec<IndexRecord>,
    pub total_size: u64,
    pub stream_crc32: u32,
}

impl StreamIndex {
    pub fn chunk_count(&self) -> u64 {
        self.records.len().saturating_sub(1) as u64
    }
}

pub fn write_index<W: Write>(
    writer: W,
    index: &StreamIndex,
    compression: WindowCompression,
) -> PargzResult<()> {
    let mut writer = Crc32Writer::new(writer);

    writer.write_all(&INDEX_MAGIC)?;
    writer.write_all(&[INDEX_FORMAT_VERSION])?;
    let flags = match compression {
        WindowCompression::None => 0u8,
        WindowCompression::Deflate => FLAG_WINDOWS_COMPRESSED,
    };
    writer.write_all(&[flags])?;
    writer.write_all(&index.chunk_count().to_le_bytes())?;
    writer.write_all(&(index.records.len() as u64).to_le_bytes())?;

    for record in &index.records {
        writer.write_all(&record.compressed_bit_offset.to_le_bytes())?;
        writer.write_all(&record.decompressed_byte_offset.to_le_bytes())?;
        match compression {
            WindowCompression::None => {
                writer.write_all(&(record.window.len() as u32).to_le_bytes())?;
                writer.write_all(&record.window)?;
            }
            WindowCompression::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&record.window)?;
                let packed = encoder.finish()?;
                writer.write_all(&(packed.len() as u32).to_le_bytes())?;
                writer.write_all(&packed)?;
            }
        }
    }

    writer.write_all(&index.total_size.to_le_bytes())?;
    writer.write_all(&index.stream_crc32.to_le_bytes())?;

    let record_crc = writer.crc();
    let inner = writer.get_mut();
    inner.write_all(&record_crc.to_le_bytes())?;
    inner.flush()?;

    debug!(
        chunks = index.chunk_count(),
        total_size = index.total_size,
        "exported seek index"
    );
    Ok(())
}

pub fn read_index<R: Read>(reader: R) -> PargzResult<StreamIndex> {
    let mut reader = Crc32Reader::new(reader);

    let mut magic = [0u8; 8];
    read_exact(&mut reader, &mut magic)?;
    if magic != INDEX_MAGIC {
        return Err(PargzError::InvalidMagic);
    }
    let version = read_u8(&mut reader)?;
    if version != INDEX_FORMAT_VERSION {
        return Err(PargzError::UnsupportedVersion(version));
    }
    let flags = read_u8(&mut reader)?;
    if flags & !FLAG_WINDOWS_COMPRESSED != 0 {
        return Err(PargzError::index_format(format!(
            "unknown flag bits {flags:#04x}"
        )));
    }
    let windows_compressed = flags & FLAG_WINDOWS_COMPRESSED != 0;

    let chunk_count = read_u64(&mut reader)?;
    let record_count = read_u64(&mut reader)?;
    if record_count != chunk_count + 1 {
        return Err(PargzError::index_format(format!(
            "record count {record_count} does not match chunk count {chunk_count}"
        )));
    }

    let mut records: Vec<IndexRecord> = Vec::with_capacity(record_count.min(1 << 20) as usize);
    for _ in 0..record_count {
        let compressed_bit_offset = read_u64(&mut reader)?;
        let decompressed_byte_offset = read_u64(&mut reader)?;
        let window_length = read_u32(&mut reader)? as usize;

        let mut stored = vec![0u8; window_length];
        read_exact(&mut reader, &mut stored)?;
        let window = if windows_compressed && !stored.is_empty() {
            let mut unpacked = Vec::with_capacity(WINDOW_SIZE);
            DeflateDecoder::new(stored.as_slice())
                .read_to_end(&mut unpacked)
                .map_err(|error| {
                    PargzError::index_format(format!("corrupt window: {error}"))
                })?;
            unpacked
        } else {
            stored
        };
        if window.len() > WINDOW_SIZE {
            return Err(PargzError::index_format(format!(
                "window of {} bytes exceeds the 32 KiB maximum",
                window.len()
            )));
        }

        if let Some(previous) = records.last() {
            if compressed_bit_offset <= previous.compressed_bit_offset
                || decompressed_byte_offset < previous.decompressed_byte_offset
            {
                return Err(PargzError::index_format(
                    "record offsets are not monotonically increasing",
                ));
            }
        }
        records.push(IndexRecord {
            compressed_bit_offset,
            decompressed_byte_offset,
            window,
        });
    }

    let total_size = read_u64(&mut reader)?;
    let stream_crc32 = read_u32(&mut reader)?;

    if let Some(sentinel) = records.last() {
        if sentinel.decompressed_byte_offset != total_size {
            return Err(PargzError::index_format(
                "sentinel record disagrees with the stored total size",
            ));
        }
        if !sentinel.window.is_empty() {
            return Err(PargzError::index_format("sentinel record carries a window"));
        }
    }

    let computed_crc = reader.crc();
    let mut stored_crc = [0u8; 4];
    reader
        .get_mut()
        .read_exact(&mut stored_crc)
        .map_err(|_| PargzError::index_format("missing trailer checksum"))?;
    let stored_crc = u32::from_le_bytes(stored_crc);
    if stored_crc != computed_crc {
        return Err(PargzError::index_format(format!(
            "trailer checksum mismatch: stored {stored_crc:#010x}, computed {computed_crc:#010x}"
        )));
    }

    debug!(chunks = chunk_count, total_size, "imported seek index");
    Ok(StreamIndex {
        records,
        total_size,
        stream_crc32,
    })
}

fn read_exact<R: Read>(reader: &mut R, buffer: &mut [u8]) -> PargzResult<()> {
    reader
        .read_exact(buffer)
        .map_err(|_| PargzError::index_format("unexpected end of index data"))
}

fn read_u8<R: Read>(reader: &mut R) -> PargzResult<u8> {
    let mut buffer = [0u8; 1];
    read_exact(reader, &mut buffer)?;
    Ok(buffer[0])
}

fn read_u32<R: Read>(reader: &mut R) -> PargzResult<u32> {
    let mut buffer = [0u8; 4];
    read_exact(reader, &mut buffer)?;
    Ok(u32::from_le_bytes(buffer))
}

fn read_u64<R: Read>(reader: &mut R) -> PargzResult<u64> {
    let mut buffer = [0u8; 8];
    read_exact(reader, &mut buffer)?;
    Ok(u64::from_le_bytes(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> StreamIndex {
        let window: Vec<u8> = (0..WINDOW_SIZE).map(|i| (i % 249) as u8).collect();
        StreamIndex {
            records: vec![
                IndexRecord {
                    compressed_bit_offset: 80,
                    decompressed_byte_offset: 0,
                    window: Vec::new(),
                },
                IndexRecord {
                    compressed_bit_offset: 500_000,
                    decompressed_byte_offset: 4 << 20,
                    window: window.clone(),
                },
                IndexRecord {
                    compressed_bit_offset: 900_000,
                    decompressed_byte_offset: 8 << 20,
                    window,
                },
                IndexRecord {
                    compressed_bit_offset: 1_200_000,
                    decompressed_byte_offset: 10 << 20,
                    window: Vec::new(),
                },
            ],
            total_size: 10 << 20,
            stream_crc32: 0xDEAD_BEEF,
        }
    }

    #[test]
    fn round_trips_raw_and_compressed_windows() {
        for compression in [WindowCompression::None, WindowCompression::Deflate] {
            let index = sample_index();
            let mut encoded = Vec::new();
            write_index(&mut encoded, &index, compression).unwrap();
            let decoded = read_index(encoded.as_slice()).unwrap();
            assert_eq!(decoded, index);
        }
    }

    #[test]
    fn compressed_windows_shrink_the_file() {
        let index = sample_index();
        let mut raw = Vec::new();
        write_index(&mut raw, &index, WindowCompression::None).unwrap();
        let mut packed = Vec::new();
        write_index(&mut packed, &index, WindowCompression::Deflate).unwrap();
        assert!(packed.len() < raw.len());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = Vec::new();
        write_index(&mut encoded, &sample_index(), WindowCompression::None).unwrap();
        encoded[0] ^= 0xFF;
        assert!(matches!(
            read_index(encoded.as_slice()),
            Err(PargzError::InvalidMagic)
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut encoded = Vec::new();
        write_index(&mut encoded, &sample_index(), WindowCompression::None).unwrap();
        encoded[8] = 9;
        assert!(matches!(
            read_index(encoded.as_slice()),
            Err(PargzError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn rejects_corrupted_payload() {
        let mut encoded = Vec::new();
        write_index(&mut encoded, &sample_index(), WindowCompression::None).unwrap();
        // Flip one window byte; the trailer CRC must catch it.
        let middle = encoded.len() / 2;
        encoded[middle] ^= 0x01;
        assert!(matches!(
            read_index(encoded.as_slice()),
            Err(PargzError::IndexFormat(_))
        ));
    }

    #[test]
    fn rejects_non_monotone_records() {
        let mut index = sample_index();
        index.records.swap(1, 2);
        let mut encoded = Vec::new();
        write_index(&mut encoded, &index, WindowCompression::None).unwrap();
        assert!(matches!(
            read_index(encoded.as_slice()),
            Err(PargzError::IndexFormat(_))
        ));
    }

    #[test]
    fn rejects_truncated_index() {
        let mut encoded = Vec::new();
        write_index(&mut encoded, &sample_index(), WindowCompression::None).unwrap();
        encoded.truncate(encoded.len() - 6);
        assert!(read_index(encoded.as_slice()).is_err());
    }

    #[test]
    fn round_trips_through_a_file() {
        use std::io::{Seek, SeekFrom};

        let index = sample_index();
        let mut file = tempfile::tempfile().unwrap();
        write_index(&mut file, &index, WindowCompression::Deflate).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(read_index(&mut file).unwrap(), index);
    }
}
