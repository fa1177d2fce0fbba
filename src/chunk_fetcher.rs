//! Chunk scheduling: caches, prefetching, and decode submission.
//!
//! The fetcher is owned and driven by one thread. Workers only ever see a
//! shared source handle plus plain offsets, and hand results back through
//! futures, so no worker holds a reference back into the fetcher.
//!
//! Guarantees kept here:
//! - at-most-one in-flight decode per chunk offset (the in-flight map is
//!   consulted before any submission, and claimed futures are moved out);
//! - an on-demand miss is submitted at high priority even with a
//!   saturated pool, and never waits on prefetches;
//! - prefetches that would evict a still-wanted entry are skipped;
//! - in sequential mode the on-demand cache is cleared before inserting,
//!   so drained history cannot push out upcoming chunks;
//! - prefetch failures are logged and dropped, to resurface naturally if
//!   the same chunk is ever requested on demand.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::block_finder::{self, BlockFinder};
use crate::cache::{Cache, CacheStatistics};
use crate::deflate::{self, ChunkLimits, DecodedChunk};
use crate::error::{PargzError, PargzResult};
use crate::prefetcher::AccessPattern;
use crate::source::Source;
use crate::thread_pool::{TaskFuture, TaskPriority, ThreadPool};

type ChunkFuture = TaskFuture<PargzResult<DecodedChunk>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct FetcherStatistics {
    pub gets: u64,
    pub on_demand_fetches: u64,
    pub prefetches: u64,
    pub prefetch_direct_hits: u64,
    pub wait_on_finder: u64,
    pub sequential_accesses: u64,
    pub repeated_accesses: u64,
    pub backward_accesses: u64,
    pub forward_accesses: u64,
    pub cache: CacheStatistics,
    pub prefetch_cache: CacheStatistics,
}

impl FetcherStatistics {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.gets == 0 {
            return 0.0;
        }
        (self.cache.hits + self.prefetch_cache.hits + self.prefetch_direct_hits) as f64
            / self.gets as f64
    }
}

pub struct ChunkFetcher {
    source: Arc<Source>,
    finder: Arc<BlockFinder>,
    parallelization: usize,
    chunk_size: u64,
    pool: ThreadPool,
    /// Results handed to the caller.
    cache: Cache<u64, Arc<DecodedChunk>>,
    /// Speculative results, deliberately sized 2N to absorb prediction
    /// error without polluting the on-demand cache.
    prefetch_cache: Cache<u64, Arc<DecodedChunk>>,
    prefetching: BTreeMap<u64, ChunkFuture>,
    pattern: AccessPattern,
    last_index: Option<usize>,
    stats: FetcherStatistics,
}

impl ChunkFetcher {
    pub fn new(
        source: Arc<Source>,
        finder: Arc<BlockFinder>,
        parallelization: usize,
        chunk_size: u64,
    ) -> Self {
        let parallelization = parallelization.max(1);
        Self {
            source,
            finder,
            parallelization,
            chunk_size,
            pool: ThreadPool::new(parallelization),
            cache: Cache::new(16.max(parallelization)),
            prefetch_cache: Cache::new(2 * parallelization),
            prefetching: BTreeMap::new(),
            pattern: AccessPattern::new(),
            last_index: None,
            stats: FetcherStatistics::default(),
        }
    }

    pub fn parallelization(&self) -> usize {
        self.parallelization
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn set_chunk_size(&mut self, chunk_size: u64) {
        self.chunk_size = chunk_size;
    }

    pub fn statistics(&self) -> FetcherStatistics {
        let mut stats = self.stats;
        stats.cache = self.cache.statistics();
        stats.prefetch_cache = self.prefetch_cache.statistics();
        stats
    }

    /// Drop all cached and in-flight results. Outstanding futures are
    /// abandoned; workers finish into the void.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.prefetch_cache.clear();
        self.prefetching.clear();
    }

    /// Fetch the chunk at `offset` (block index `index`), decoding on
    /// demand if no cache or in-flight prefetch covers it. The result may
    /// still carry unresolved markers; `get_resolved` is the stitched
    /// variant.
    pub fn get(&mut self, offset: u64, index: usize) -> PargzResult<Arc<DecodedChunk>> {
        self.record_access(index);
        self.pattern.record(index);

        let (cached, claimed) = self.take_from_caches(offset);

        let pending = match (&cached, claimed) {
            (None, None) => {
                self.stats.on_demand_fetches += 1;
                Some(self.submit_decode(offset, index, TaskPriority::High, None))
            }
            (_, claimed) => claimed,
        };

        self.prefetch_new_chunks();

        if let Some(chunk) = cached {
            return Ok(chunk);
        }

        let future = pending.expect("miss without a submitted decode");
        // Advance ready prefetches into their cache while the on-demand
        // result cooks.
        while !future.wait_timeout(Duration::from_millis(1)) {
            self.prefetch_new_chunks();
        }
        let mut chunk = Arc::new(future.take()??);
        if chunk.start_bits != offset {
            // A claimed prefetch whose speculative scan skipped past the
            // requested block (e.g. an unverifiable fixed block). Decode
            // the real thing; the guess result is useless here.
            debug!(
                offset,
                found = chunk.start_bits,
                "prefetch decoded a later block, re-decoding exactly"
            );
            self.stats.on_demand_fetches += 1;
            let exact = self.submit_decode(offset, index, TaskPriority::High, None);
            chunk = Arc::new(exact.take()??);
            if chunk.start_bits != offset {
                return Err(PargzError::InvalidBlockType {
                    bit_position: offset,
                });
            }
        }
        self.insert_into_cache(offset, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Fetch and resolve against the preceding `window`. A chunk whose
    /// speculative decode failed or cannot be resolved is re-decoded with
    /// the window at high priority; only a failure of that decode
    /// surfaces.
    pub fn get_resolved(
        &mut self,
        offset: u64,
        index: usize,
        window: &[u8],
    ) -> PargzResult<Arc<DecodedChunk>> {
        match self.get(offset, index) {
            Ok(chunk) if chunk.is_resolved() => Ok(chunk),
            Ok(chunk) => {
                self.cache.evict(&offset);
                let mut owned = Arc::try_unwrap(chunk).unwrap_or_else(|shared| (*shared).clone());
                match owned.resolve(window) {
                    Ok(()) => {
                        let chunk = Arc::new(owned);
                        self.cache.insert(offset, Arc::clone(&chunk));
                        Ok(chunk)
                    }
                    Err(error) => {
                        debug!(offset, %error, "marker resolution failed, re-decoding with window");
                        self.redecode_with_window(offset, index, window)
                    }
                }
            }
            Err(error) => {
                debug!(offset, %error, "speculative decode failed, re-decoding with window");
                self.redecode_with_window(offset, index, window)
            }
        }
    }

    fn redecode_with_window(
        &mut self,
        offset: u64,
        index: usize,
        window: &[u8],
    ) -> PargzResult<Arc<DecodedChunk>> {
        let future = self.submit_decode(offset, index, TaskPriority::High, Some(window.to_vec()));
        let chunk = Arc::new(future.take()??);
        self.insert_into_cache(offset, Arc::clone(&chunk));
        Ok(chunk)
    }

    /// Check the in-flight map and both caches for `offset`, including the
    /// partition-guess alias under which a prefetch may have decoded the
    /// same block.
    fn take_from_caches(
        &mut self,
        offset: u64,
    ) -> (Option<Arc<DecodedChunk>>, Option<ChunkFuture>) {
        if let Some(future) = self.prefetching.remove(&offset) {
            self.stats.prefetch_direct_hits += 1;
            return (None, Some(future));
        }

        if let Some(chunk) = self.cache.get(&offset) {
            return (Some(Arc::clone(chunk)), None);
        }
        // Only promote a prefetch that decoded the block actually asked
        // for; a guess-keyed result may have scanned its way past it.
        if let Some(chunk) = self.prefetch_cache.get(&offset) {
            if chunk.start_bits == offset {
                let chunk = self
                    .prefetch_cache
                    .evict(&offset)
                    .expect("hit entry exists");
                self.insert_into_cache(offset, Arc::clone(&chunk));
                return (Some(chunk), None);
            }
        }

        // A prefetch issued at the partition guess may have scanned its
        // way to exactly this confirmed offset.
        self.process_ready_prefetches();
        let partition = self.finder.partition_offset_containing(offset);
        if partition != offset && self.prefetch_cache.test(&partition) {
            let chunk = self
                .prefetch_cache
                .evict(&partition)
                .expect("tested entry exists");
            if chunk.start_bits == offset {
                self.insert_into_cache(offset, Arc::clone(&chunk));
                return (Some(chunk), None);
            }
            // Different block than hoped; keep it for whoever asks for it.
            self.prefetch_cache.insert(partition, chunk);
        }

        (None, None)
    }

    fn insert_into_cache(&mut self, offset: u64, chunk: Arc<DecodedChunk>) {
        // Sequential reads never revisit: retaining history would only
        // push out the chunks the predictor is about to fetch.
        if self.pattern.is_sequential() {
            self.cache.clear();
        }
        self.cache.insert(offset, chunk);
    }

    fn is_in_cache_or_queue(&self, offset: u64) -> bool {
        self.prefetching.contains_key(&offset)
            || self.cache.test(&offset)
            || self.prefetch_cache.test(&offset)
    }

    /// Harvest finished prefetch futures into the prefetch cache.
    fn process_ready_prefetches(&mut self) {
        let ready: Vec<u64> = self
            .prefetching
            .iter()
            .filter(|(_, future)| future.is_ready())
            .map(|(&offset, _)| offset)
            .collect();
        for offset in ready {
            let future = self.prefetching.remove(&offset).expect("listed as ready");
            match future.take().and_then(|result| result) {
                Ok(chunk) => {
                    self.prefetch_cache.insert(offset, Arc::new(chunk));
                }
                Err(error) => {
                    debug!(offset, %error, "dropping failed prefetch");
                }
            }
        }
    }

    /// Fill the in-flight map with predicted chunks, up to pool capacity
    /// minus the slot reserved for on-demand work.
    fn prefetch_new_chunks(&mut self) {
        self.process_ready_prefetches();

        if self.prefetching.len() + 1 >= self.pool.size() {
            return;
        }

        let predictions = self.pattern.predict(self.prefetch_cache.capacity());
        if predictions.is_empty() {
            return;
        }

        // Resolve targets up front and touch them so one prefetch's
        // insertion cannot evict another target this round.
        let mut target_offsets = Vec::with_capacity(predictions.len() * 2);
        for &index in &predictions {
            if let Some(offset) = self.finder.get(index, 0.0) {
                target_offsets.push(offset);
                let partition = self.finder.partition_offset_containing(offset);
                if partition != offset {
                    target_offsets.push(partition);
                }
            }
        }
        for offset in target_offsets.iter().rev() {
            self.prefetch_cache.touch(offset);
            self.cache.touch(offset);
        }

        for index in predictions {
            if self.prefetching.len() + 1 >= self.pool.size() {
                break;
            }
            if self.finder.finalized() && index >= self.finder.size() {
                continue;
            }
            let Some(offset) = self.finder.get(index, 0.0) else {
                self.stats.wait_on_finder += 1;
                continue;
            };
            if offset >= self.finder.stream_bits() {
                continue;
            }
            if self.is_in_cache_or_queue(offset) {
                continue;
            }
            let partition = self.finder.partition_offset_containing(offset);
            if partition != offset && self.is_in_cache_or_queue(partition) {
                continue;
            }
            // Pollution guard: skip the whole round rather than evict an
            // entry this round still wants.
            if let Some(&victim) = self
                .prefetch_cache
                .next_nth_eviction(self.prefetching.len() + 1)
            {
                if target_offsets.contains(&victim) {
                    break;
                }
            }

            self.stats.prefetches += 1;
            let future = self.submit_decode(offset, index, TaskPriority::Normal, None);
            self.prefetching.insert(offset, future);
        }
    }

    fn submit_decode(
        &self,
        offset: u64,
        index: usize,
        priority: TaskPriority,
        window: Option<Vec<u8>>,
    ) -> ChunkFuture {
        // The caller's chunk index and the finder's block index coincide on
        // the walk path; trust the finder when it knows better.
        let index = self.finder.find(offset).unwrap_or(index);
        // On-demand lookups may block on BGZF offset harvesting; prefetch
        // lookups must return immediately.
        let timeout = match priority {
            TaskPriority::High => f64::INFINITY,
            TaskPriority::Normal => 0.0,
        };
        let until_bits = self.finder.get(index + 1, timeout);
        let exact = self.finder.is_confirmed(offset);
        // When the chunk's end is already a confirmed boundary the decode
        // must land exactly on it, so the soft bound is dropped: this makes
        // re-decodes after eviction reproduce the original chunk bit for
        // bit.
        let soft_size = match until_bits {
            Some(until) if self.finder.is_confirmed(until) => None,
            _ => Some(self.chunk_size),
        };
        let source = Arc::clone(&self.source);
        self.pool.submit(priority, move || {
            decode_task(&source, offset, until_bits, exact, soft_size, window)
        })
    }

    fn record_access(&mut self, index: usize) {
        self.stats.gets += 1;
        match self.last_index {
            // The first access counts as sequential.
            None => self.stats.sequential_accesses += 1,
            Some(last) if index == last + 1 => self.stats.sequential_accesses += 1,
            Some(last) if index == last => self.stats.repeated_accesses += 1,
            Some(last) if index < last => self.stats.backward_accesses += 1,
            Some(_) => self.stats.forward_accesses += 1,
        }
        self.last_index = Some(index);
    }
}

/// The actual worker-side decode. Receives only plain data: the shared
/// source, offsets, and an optional window.
fn decode_task(
    source: &Source,
    offset: u64,
    until_bits: Option<u64>,
    exact: bool,
    soft_size: Option<u64>,
    window: Option<Vec<u8>>,
) -> PargzResult<DecodedChunk> {
    let data = source.as_bytes();
    let start_bits = if exact {
        offset
    } else {
        // Partition guess: locate the first provable block header.
        let scan_end = until_bits.unwrap_or_else(|| source.bit_len());
        block_finder::find_first_block(data, offset, scan_end).ok_or(
            PargzError::InvalidBlockType {
                bit_position: offset,
            },
        )?
    };
    let limits = ChunkLimits {
        until_bits,
        soft_size,
    };
    deflate::decode_chunk(data, start_bits, window.as_deref(), limits)
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

    fn test_data(len: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(len + 64);
        let mut i = 0u64;
        while data.len() < len {
            data.extend_from_slice(format!("{i:012} some compressible filler\n").as_bytes());
            i += 1;
        }
        data.truncate(len);
        data
    }

    /// Drive the fetcher the way the reader does: chunks in ascending
    /// order, windows chained, exits confirmed back into the finder.
    fn walk_all(fetcher: &mut ChunkFetcher, finder: &BlockFinder) -> Vec<u8> {
        let mut output = Vec::new();
        let mut window = Vec::new();
        let mut offset = finder.get(0, 0.0).unwrap();
        for index in 0.. {
            let chunk = fetcher.get_resolved(offset, index, &window).unwrap();
            output.extend_from_slice(chunk.bytes().unwrap());
            if chunk.ends_stream {
                break;
            }
            finder.insert(chunk.end_bits).unwrap();
            window = chunk.exit_window().to_vec();
            offset = chunk.end_bits;
        }
        output
    }

    #[test]
    fn sequential_walk_reassembles_the_stream() {
        let original = test_data(1_200_000);
        let stream = gzip_encode(&original);
        let source = Arc::new(Source::from_bytes(stream));
        let finder = Arc::new(
            BlockFinder::new(Arc::clone(&source), block_finder::MIN_SPACING_BITS, 4).unwrap(),
        );
        let mut fetcher = ChunkFetcher::new(Arc::clone(&source), Arc::clone(&finder), 4, 64 * 1024);

        let output = walk_all(&mut fetcher, &finder);
        assert_eq!(output.len(), original.len());
        assert!(output == original, "reassembled stream differs");

        let stats = fetcher.statistics();
        assert!(stats.gets >= 2, "expected multiple chunks");
        assert_eq!(stats.gets, stats.sequential_accesses);
    }

    #[test]
    fn repeated_get_hits_the_cache() {
        let original = test_data(100_000);
        let stream = gzip_encode(&original);
        let source = Arc::new(Source::from_bytes(stream));
        let finder = Arc::new(
            BlockFinder::new(Arc::clone(&source), block_finder::MIN_SPACING_BITS, 2).unwrap(),
        );
        let mut fetcher = ChunkFetcher::new(Arc::clone(&source), Arc::clone(&finder), 2, 1 << 20);

        let offset = finder.get(0, 0.0).unwrap();
        let first = fetcher.get_resolved(offset, 0, &[]).unwrap();
        let second = fetcher.get_resolved(offset, 0, &[]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(fetcher.statistics().cache.hits >= 1);
    }

    #[test]
    fn prefetches_are_issued_on_sequential_access() {
        let original = test_data(2_000_000);
        let stream = gzip_encode(&original);
        let source = Arc::new(Source::from_bytes(stream));
        let finder = Arc::new(
            BlockFinder::new(Arc::clone(&source), block_finder::MIN_SPACING_BITS, 4).unwrap(),
        );
        let mut fetcher = ChunkFetcher::new(Arc::clone(&source), Arc::clone(&finder), 4, 32 * 1024);

        let output = walk_all(&mut fetcher, &finder);
        assert!(output == original);

        let stats = fetcher.statistics();
        assert!(stats.prefetches > 0, "sequential walk should prefetch");
    }

    #[test]
    fn clear_drops_cached_results() {
        let original = test_data(50_000);
        let stream = gzip_encode(&original);
        let source = Arc::new(Source::from_bytes(stream));
        let finder = Arc::new(
            BlockFinder::new(Arc::clone(&source), block_finder::MIN_SPACING_BITS, 2).unwrap(),
        );
        let mut fetcher = ChunkFetcher::new(Arc::clone(&source), Arc::clone(&finder), 2, 1 << 20);

        let offset = finder.get(0, 0.0).unwrap();
        let first = fetcher.get_resolved(offset, 0, &[]).unwrap();
        fetcher.clear();
        let second = fetcher.get_resolved(offset, 0, &[]).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.bytes().unwrap(), original.as_slice());
    }
}
