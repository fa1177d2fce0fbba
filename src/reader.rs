//! The seekable decompressed view over a gzip stream.
//!
//! One owner thread drives everything: it walks chunks strictly in
//! ascending order to grow the block map, chains exit windows from one
//! chunk to the next, confirms exit boundaries back into the block finder,
//! and merges per-segment CRCs into member checksums. Worker threads only
//! ever decode; ownership stays linear (reader owns fetcher, fetcher owns
//! pool and caches).
//!
//! Trailer verification is deferred: a CRC or ISIZE mismatch is recorded
//! against the decompressed offset of the offending member boundary and
//! surfaces on the first read that would cross it. Reads before that
//! offset stay valid, and state is never poisoned: after any error the
//! caller may seek back into known-good territory and continue.
//!
//! A `ParallelGzipReader` is not thread-safe; clone-like sharing means
//! opening another reader on the same file.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block_finder::BlockFinder;
use crate::block_map::{BlockMap, ChunkSpan};
use crate::chunk_fetcher::{ChunkFetcher, FetcherStatistics};
use crate::crc32;
use crate::deflate::DecodedChunk;
use crate::error::{PargzError, PargzResult};
use crate::gzip;
use crate::index::{self, IndexRecord, StreamIndex};
use crate::source::Source;
use crate::window_map::{WindowCompression, WindowMap};

/// Tunables for a parallel reader.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Worker threads; 0 means one per logical CPU.
    pub parallelization: usize,
    /// Soft lower bound on decoded bytes per chunk.
    pub chunk_size: u64,
    /// Block-finder partition stride in bits; at least 32 KiB · 8.
    pub spacing_bits: u64,
    /// Turn trailer CRC-32/ISIZE mismatches into read errors.
    pub verify_checksums: bool,
    /// How windows are held in memory and in exported indexes.
    pub window_compression: WindowCompression,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            parallelization: 0,
            chunk_size: 4 << 20,
            spacing_bits: (512 << 10) * 8,
            verify_checksums: true,
            window_compression: WindowCompression::Deflate,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamDefect {
    Crc { stored: u32, computed: u32 },
    Size { stored: u64, computed: u64 },
    Truncated,
}

#[derive(Debug, Clone, Copy)]
struct PendingDefect {
    /// Decompressed offset of the boundary the defect belongs to.
    at_offset: u64,
    defect: StreamDefect,
}

impl PendingDefect {
    fn to_error(self) -> PargzError {
        match self.defect {
            StreamDefect::Crc { stored, computed } => PargzError::CrcMismatch { stored, computed },
            StreamDefect::Size { stored, computed } => {
                PargzError::SizeMismatch { stored, computed }
            }
            StreamDefect::Truncated => PargzError::IncompleteStream,
        }
    }
}

pub struct ParallelGzipReader {
    source: Arc<Source>,
    options: ReaderOptions,
    finder: Arc<BlockFinder>,
    fetcher: ChunkFetcher,
    block_map: BlockMap,
    windows: WindowMap,
    position: u64,

    // Walk frontier: the next chunk to stitch, in ascending order.
    next_index: usize,
    next_offset: u64,
    next_window: Vec<u8>,
    walked_bytes: u64,

    // Running checksums: the open member's combined CRC/size, and the
    // whole-stream CRC for the index trailer.
    member_crc: u32,
    member_size: u64,
    stream_crc: u32,

    pending_defect: Option<PendingDefect>,
}

impl ParallelGzipReader {
    pub fn open<P: AsRef<Path>>(path: P) -> PargzResult<Self> {
        Self::with_options(Source::open(path)?, ReaderOptions::default())
    }

    pub fn from_bytes(bytes: Vec<u8>) -> PargzResult<Self> {
        Self::with_options(Source::from_bytes(bytes), ReaderOptions::default())
    }

    pub fn with_options(source: Source, mut options: ReaderOptions) -> PargzResult<Self> {
        if options.chunk_size == 0 {
            return Err(PargzError::invalid_argument("chunk size must be positive"));
        }
        if options.parallelization == 0 {
            options.parallelization = num_cpus::get().max(1);
        }

        let source = Arc::new(source);
        let finder = Arc::new(BlockFinder::new(
            Arc::clone(&source),
            options.spacing_bits,
            options.parallelization,
        )?);
        let fetcher = ChunkFetcher::new(
            Arc::clone(&source),
            Arc::clone(&finder),
            options.parallelization,
            options.chunk_size,
        );

        let first_offset = finder.get(0, 0.0).expect("finder knows the first block");
        let mut windows = WindowMap::new(options.window_compression);
        // The leading chunk has no history.
        windows.insert(first_offset, &[]);

        Ok(Self {
            source,
            options,
            finder,
            fetcher,
            block_map: BlockMap::new(),
            windows,
            position: 0,
            next_index: 0,
            next_offset: first_offset,
            next_window: Vec::new(),
            walked_bytes: 0,
            member_crc: 0,
            member_size: 0,
            stream_crc: 0,
            pending_defect: None,
        })
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total decompressed size, known after a full walk or index import.
    pub fn size(&self) -> Option<u64> {
        self.block_map.total_size()
    }

    pub fn statistics(&self) -> FetcherStatistics {
        self.fetcher.statistics()
    }

    /// Replace the worker pool. Cached chunks survive; in-flight work is
    /// abandoned.
    pub fn set_parallelization(&mut self, parallelization: usize) {
        let parallelization = if parallelization == 0 {
            num_cpus::get().max(1)
        } else {
            parallelization
        };
        self.options.parallelization = parallelization;
        self.fetcher = ChunkFetcher::new(
            Arc::clone(&self.source),
            Arc::clone(&self.finder),
            parallelization,
            self.options.chunk_size,
        );
    }

    /// Adjust the soft decoded-size bound for chunks not yet walked.
    pub fn set_chunk_size(&mut self, chunk_size: u64) -> PargzResult<()> {
        if chunk_size == 0 {
            return Err(PargzError::invalid_argument("chunk size must be positive"));
        }
        self.options.chunk_size = chunk_size;
        self.fetcher.set_chunk_size(chunk_size);
        Ok(())
    }

    fn read_internal(&mut self, buffer: &mut [u8]) -> PargzResult<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        while written < buffer.len() {
            if let Some(pending) = self.active_defect() {
                if self.position >= pending.at_offset {
                    if written > 0 {
                        break;
                    }
                    return Err(pending.to_error());
                }
            }
            if let Some(total) = self.block_map.total_size() {
                if self.position >= total {
                    break;
                }
            }

            let Some(span) = self.block_map.find_containing_byte(self.position) else {
                if self.block_map.finalized() {
                    break;
                }
                self.walk_one_chunk()?;
                continue;
            };

            let chunk = self.fetch_span(&span)?;
            let bytes = chunk
                .bytes()
                .ok_or_else(|| PargzError::internal("fetched chunk is unresolved"))?;
            let local = (self.position - span.start_byte) as usize;
            let mut take = bytes
                .len()
                .saturating_sub(local)
                .min(buffer.len() - written);
            if let Some(pending) = self.active_defect() {
                take = take.min((pending.at_offset - self.position) as usize);
            }
            if take == 0 {
                return Err(PargzError::internal("mapped chunk yielded no bytes"));
            }
            buffer[written..written + take].copy_from_slice(&bytes[local..local + take]);
            written += take;
            self.position += take as u64;
        }

        Ok(written)
    }

    fn seek_internal(&mut self, target: SeekFrom) -> PargzResult<u64> {
        let position = match target {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => match self.size() {
                Some(size) => size as i128 + delta as i128,
                None => {
                    return Err(PargzError::invalid_argument(
                        "seeking from the end requires a finalized size (full walk or index import)",
                    ))
                }
            },
        };
        if position < 0 {
            return Err(PargzError::invalid_argument("seek before start of stream"));
        }
        self.position = position as u64;
        Ok(self.position)
    }

    /// Defects gate reads only when they are hard errors: truncation
    /// always, checksum mismatches only under `verify_checksums`.
    fn active_defect(&self) -> Option<PendingDefect> {
        let pending = self.pending_defect?;
        if self.options.verify_checksums || matches!(pending.defect, StreamDefect::Truncated) {
            Some(pending)
        } else {
            None
        }
    }

    fn record_defect(&mut self, at_offset: u64, defect: StreamDefect) {
        if !self.options.verify_checksums {
            if let StreamDefect::Crc { stored, computed } = defect {
                warn!(at_offset, stored, computed, "trailer CRC-32 mismatch ignored");
            }
            if let StreamDefect::Size { stored, computed } = defect {
                warn!(at_offset, stored, computed, "trailer size mismatch ignored");
            }
        }
        // Earliest defect wins; everything past it is suspect anyway.
        if self
            .pending_defect
            .map_or(true, |existing| at_offset < existing.at_offset)
        {
            self.pending_defect = Some(PendingDefect { at_offset, defect });
        }
    }

    fn fetch_span(&mut self, span: &ChunkSpan) -> PargzResult<Arc<DecodedChunk>> {
        let window = self
            .windows
            .get(span.start_bits)
            .ok_or_else(|| PargzError::internal("no window for a mapped chunk"))?
            .unpack()?;
        self.fetcher.get_resolved(span.start_bits, span.index, &window)
    }

    /// Stitch the next chunk onto the walk frontier: extend the block map,
    /// chain the window, confirm the exit boundary, fold in checksums.
    fn walk_one_chunk(&mut self) -> PargzResult<()> {
        debug_assert!(!self.block_map.finalized());
        let index = self.next_index;
        let offset = self.next_offset;
        let window = self.next_window.clone();

        let chunk = self.fetcher.get_resolved(offset, index, &window)?;
        self.block_map.push(offset, self.walked_bytes)?;

        let mut segments = chunk.segments().iter();
        for footer in &chunk.footers {
            let segment = segments.next().expect("one segment per footer");
            self.member_crc = crc32::combine(self.member_crc, segment.crc32, segment.length);
            self.member_size += segment.length;
            self.stream_crc = crc32::combine(self.stream_crc, segment.crc32, segment.length);

            let boundary = self.walked_bytes + footer.decoded_offset;
            if footer.stored_crc32 != self.member_crc {
                self.record_defect(
                    boundary,
                    StreamDefect::Crc {
                        stored: footer.stored_crc32,
                        computed: self.member_crc,
                    },
                );
            } else if footer.stored_size != (self.member_size & 0xFFFF_FFFF) as u32 {
                self.record_defect(
                    boundary,
                    StreamDefect::Size {
                        stored: footer.stored_size as u64,
                        computed: self.member_size,
                    },
                );
            }
            self.member_crc = 0;
            self.member_size = 0;
        }
        if let Some(trailing) = segments.next() {
            self.member_crc = crc32::combine(self.member_crc, trailing.crc32, trailing.length);
            self.member_size += trailing.length;
            self.stream_crc = crc32::combine(self.stream_crc, trailing.crc32, trailing.length);
        }

        self.walked_bytes += chunk.decoded_size();

        if chunk.ends_stream {
            if chunk.incomplete || self.member_size > 0 {
                self.record_defect(self.walked_bytes, StreamDefect::Truncated);
            }
            self.block_map.finalize(chunk.end_bits, self.walked_bytes);
            self.finder.finalize();
            debug!(
                chunks = self.block_map.len(),
                total = self.walked_bytes,
                "stream walk complete"
            );
        } else {
            self.finder.insert(chunk.end_bits)?;
            self.windows.insert(chunk.end_bits, chunk.exit_window());
            self.next_window = chunk.exit_window().to_vec();
            self.next_offset = chunk.end_bits;
            self.next_index = index + 1;
        }
        Ok(())
    }

    /// Write the seek index for this stream, walking whatever part of it
    /// has not been decoded yet.
    pub fn export_index<W: Write>(&mut self, writer: W) -> PargzResult<()> {
        while !self.block_map.finalized() {
            self.walk_one_chunk()?;
        }
        if matches!(
            self.pending_defect,
            Some(PendingDefect {
                defect: StreamDefect::Truncated,
                ..
            })
        ) {
            return Err(PargzError::IncompleteStream);
        }

        let mut records = Vec::with_capacity(self.block_map.len() + 1);
        for entry in self.block_map.entries() {
            let window = self
                .windows
                .get(entry.bit_offset)
                .ok_or_else(|| PargzError::internal("no window for a mapped chunk"))?;
            records.push(IndexRecord {
                compressed_bit_offset: entry.bit_offset,
                decompressed_byte_offset: entry.byte_offset,
                window: window.unpack()?,
            });
        }
        let total_size = self.block_map.total_size().expect("finalized above");
        records.push(IndexRecord {
            compressed_bit_offset: self.block_map.end_bits().expect("finalized above"),
            decompressed_byte_offset: total_size,
            window: Vec::new(),
        });

        let stream_index = StreamIndex {
            records,
            total_size,
            stream_crc32: self.stream_crc,
        };
        index::write_index(writer, &stream_index, self.options.window_compression)
    }

    /// Load a previously exported index: block map, window map, and block
    /// finder are fully populated and every subsequent read is exact.
    pub fn import_index<R: Read>(&mut self, reader: R) -> PargzResult<()> {
        let parsed = index::read_index(reader)?;
        let Some((sentinel, chunks)) = parsed.records.split_last() else {
            return Err(PargzError::index_format("index contains no records"));
        };

        let first_block = gzip::parse_header(&self.source, 0)?.data_offset as u64 * 8;
        if chunks.first().map(|record| record.compressed_bit_offset) != Some(first_block) {
            return Err(PargzError::index_format(
                "index does not belong to this stream",
            ));
        }
        if sentinel.compressed_bit_offset > self.source.bit_len() {
            return Err(PargzError::index_format(
                "index describes a longer stream than this file",
            ));
        }

        let mut block_map = BlockMap::new();
        let mut windows = WindowMap::new(self.options.window_compression);
        for record in chunks {
            block_map.push(record.compressed_bit_offset, record.decompressed_byte_offset)?;
            windows.insert(record.compressed_bit_offset, &record.window);
        }
        block_map.finalize(sentinel.compressed_bit_offset, parsed.total_size);

        self.finder.set_offsets(
            chunks
                .iter()
                .map(|record| record.compressed_bit_offset)
                .collect(),
        );
        self.fetcher.clear();
        self.block_map = block_map;
        self.windows = windows;
        self.walked_bytes = parsed.total_size;
        self.next_index = chunks.len();
        self.next_offset = sentinel.compressed_bit_offset;
        self.next_window.clear();
        self.member_crc = 0;
        self.member_size = 0;
        self.stream_crc = parsed.stream_crc32;
        self.pending_defect = None;
        Ok(())
    }
}

impl Read for ParallelGzipReader {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.read_internal(buffer).map_err(io::Error::from)
    }
}

impl Seek for ParallelGzipReader {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        self.seek_internal(target).map_err(io::Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip_encode(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn test_data(len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(len + 64);
        let mut i = 0u64;
        while data.len() < len {
            data.extend_from_slice(format!("{i:012} rolling filler content\n").as_bytes());
            i = i.wrapping_mul(0x9E37_79B9).wrapping_add(12345);
        }
        data.truncate(len);
        data
    }

    fn small_chunk_options(parallelization: usize) -> ReaderOptions {
        ReaderOptions {
            parallelization,
            chunk_size: 128 << 10,
            ..ReaderOptions::default()
        }
    }

    #[test]
    fn reads_the_whole_stream() {
        let original = test_data(900_000);
        let mut reader = ParallelGzipReader::with_options(
            Source::from_bytes(gzip_encode(&original)),
            small_chunk_options(4),
        )
        .unwrap();

        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();
        assert!(output == original);
        assert_eq!(reader.size(), Some(original.len() as u64));
    }

    #[test]
    fn single_threaded_matches_parallel() {
        let original = test_data(700_000);
        let stream = gzip_encode(&original);

        let mut sequential = Vec::new();
        ParallelGzipReader::with_options(
            Source::from_bytes(stream.clone()),
            small_chunk_options(1),
        )
        .unwrap()
        .read_to_end(&mut sequential)
        .unwrap();

        let mut parallel = Vec::new();
        ParallelGzipReader::with_options(Source::from_bytes(stream), small_chunk_options(8))
            .unwrap()
            .read_to_end(&mut parallel)
            .unwrap();

        assert!(sequential == parallel);
    }

    #[test]
    fn seek_and_read_single_bytes() {
        let original = test_data(400_000);
        let mut reader = ParallelGzipReader::with_options(
            Source::from_bytes(gzip_encode(&original)),
            small_chunk_options(2),
        )
        .unwrap();

        for &offset in &[0u64, 1, 131_071, 131_072, 250_000, 399_999] {
            reader.seek(SeekFrom::Start(offset)).unwrap();
            let mut byte = [0u8; 1];
            reader.read_exact(&mut byte).unwrap();
            assert_eq!(byte[0], original[offset as usize], "offset {offset}");
        }
    }

    #[test]
    fn multi_member_streams_concatenate() {
        let mut stream = gzip_encode(b"Hello");
        stream.extend_from_slice(&gzip_encode(b"World"));

        let mut reader = ParallelGzipReader::from_bytes(stream).unwrap();
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();
        assert_eq!(output, b"HelloWorld");
        assert_eq!(reader.size(), Some(10));
    }

    #[test]
    fn empty_member_reads_as_empty() {
        let mut reader = ParallelGzipReader::from_bytes(gzip_encode(b"")).unwrap();
        let mut output = Vec::new();
        reader.read_to_end(&mut output).unwrap();
        assert!(output.is_empty());
        assert_eq!(reader.size(), Some(0));
    }

    #[test]
    fn seek_to_size_then_read_returns_zero() {
        let original = test_data(50_000);
        let mut reader = ParallelGzipReader::from_bytes(gzip_encode(&original)).unwrap();
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).unwrap();

        let size = reader.size().unwrap();
        reader.seek(SeekFrom::Start(size)).unwrap();
        let mut buffer = [0u8; 16];
        assert_eq!(reader.read(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn truncated_stream_fails_only_past_the_valid_prefix() {
        let original = test_data(600_000);
        let mut stream = gzip_encode(&original);
        stream.truncate(stream.len() - 10);

        let mut reader = ParallelGzipReader::with_options(
            Source::from_bytes(stream),
            small_chunk_options(2),
        )
        .unwrap();

        // The leading chunk is intact.
        let mut head = vec![0u8; 100_000];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(head, original[..100_000]);

        // Draining the stream must hit the missing trailer.
        let mut rest = Vec::new();
        let error = reader.read_to_end(&mut rest).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn corrupted_trailer_crc_is_deferred_to_the_end() {
        let original = test_data(200_000);
        let mut stream = gzip_encode(&original);
        let crc_position = stream.len() - 8;
        stream[crc_position] ^= 0xFF;

        let mut reader = ParallelGzipReader::with_options(
            Source::from_bytes(stream.clone()),
            small_chunk_options(2),
        )
        .unwrap();
        let mut output = Vec::new();
        let error = reader.read_to_end(&mut output).unwrap_err();
        assert!(error.to_string().contains("CRC"), "got: {error}");
        // All payload bytes were delivered before the verdict.
        assert!(output == original);

        // With verification off the stream reads clean.
        let mut lenient = ParallelGzipReader::with_options(
            Source::from_bytes(stream),
            ReaderOptions {
                verify_checksums: false,
                ..small_chunk_options(2)
            },
        )
        .unwrap();
        let mut output = Vec::new();
        lenient.read_to_end(&mut output).unwrap();
        assert!(output == original);
    }

    #[test]
    fn corruption_in_one_chunk_leaves_others_readable() {
        let original = test_data(1_000_000);
        let mut stream = gzip_encode(&original);
        let corrupt_at = stream.len() * 3 / 4;
        stream[corrupt_at] ^= 0x5A;

        let mut reader = ParallelGzipReader::with_options(
            Source::from_bytes(stream),
            small_chunk_options(2),
        )
        .unwrap();

        // Early data decodes fine.
        let mut head = vec![0u8; 64 << 10];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(head, original[..64 << 10]);

        // Somewhere past the corruption the stream must fail.
        let mut rest = Vec::new();
        assert!(reader.read_to_end(&mut rest).is_err());
    }

    #[test]
    fn export_import_round_trip_is_identical() {
        let original = test_data(800_000);
        let stream = gzip_encode(&original);

        let mut writer_side = ParallelGzipReader::with_options(
            Source::from_bytes(stream.clone()),
            small_chunk_options(4),
        )
        .unwrap();
        let mut exported = Vec::new();
        writer_side.export_index(&mut exported).unwrap();

        let mut reader_side = ParallelGzipReader::with_options(
            Source::from_bytes(stream),
            small_chunk_options(4),
        )
        .unwrap();
        reader_side.import_index(exported.as_slice()).unwrap();
        assert_eq!(reader_side.size(), Some(original.len() as u64));

        // import(export(index)) == index
        let mut re_exported = Vec::new();
        reader_side.export_index(&mut re_exported).unwrap();
        assert_eq!(exported, re_exported);

        // Random access straight after import, no speculative decoding.
        for &offset in &[0u64, 300_000, 799_999] {
            reader_side.seek(SeekFrom::Start(offset)).unwrap();
            let mut byte = [0u8; 1];
            reader_side.read_exact(&mut byte).unwrap();
            assert_eq!(byte[0], original[offset as usize]);
        }
    }

    #[test]
    fn import_rejects_foreign_index() {
        let mut first = ParallelGzipReader::from_bytes(gzip_encode(&test_data(10_000))).unwrap();
        let mut exported = Vec::new();
        first.export_index(&mut exported).unwrap();

        // A stream with a different header layout (file name present), so
        // its first block sits at a different bit offset.
        let mut other = flate2::GzBuilder::new()
            .filename("other.txt")
            .write(Vec::new(), Compression::default());
        other.write_all(&test_data(10_000)).unwrap();
        let other_stream = other.finish().unwrap();

        let mut second = ParallelGzipReader::from_bytes(other_stream).unwrap();
        assert!(second.import_index(exported.as_slice()).is_err());
    }

    #[test]
    fn reconfiguring_parallelization_keeps_reads_correct() {
        let original = test_data(500_000);
        let mut reader = ParallelGzipReader::with_options(
            Source::from_bytes(gzip_encode(&original)),
            small_chunk_options(2),
        )
        .unwrap();

        let mut head = vec![0u8; 200_000];
        reader.read_exact(&mut head).unwrap();
        reader.set_parallelization(6);
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();

        let mut joined = head;
        joined.extend_from_slice(&tail);
        assert!(joined == original);
    }

    #[test]
    fn invalid_options_are_rejected_up_front() {
        let stream = gzip_encode(b"x");
        let result = ParallelGzipReader::with_options(
            Source::from_bytes(stream.clone()),
            ReaderOptions {
                chunk_size: 0,
                ..ReaderOptions::default()
            },
        );
        assert!(result.is_err());

        let result = ParallelGzipReader::with_options(
            Source::from_bytes(stream),
            ReaderOptions {
                spacing_bits: 1024,
                ..ReaderOptions::default()
            },
        );
        assert!(result.is_err());
    }
}
