//! Sparse map from chunk start offsets to their preceding 32 KiB windows.
//!
//! A window is what lets an already-walked chunk be re-decoded after cache
//! eviction, and what the index file persists. Windows at member
//! boundaries are empty (no history crosses a gzip member). Since each
//! window is pure cold data it can be held DEFLATE-compressed in memory;
//! the trade is configured per reader.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::deflate::WINDOW_SIZE;
use crate::error::{PargzError, PargzResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowCompression {
    None,
    #[default]
    Deflate,
}

#[derive(Debug)]
enum Stored {
    Raw(Vec<u8>),
    /// Raw deflate stream (no zlib/gzip wrapper) plus decompressed length.
    Deflated(Vec<u8>, usize),
}

#[derive(Debug)]
pub struct Window {
    stored: Stored,
}

impl Window {
    fn from_bytes(bytes: &[u8], compression: WindowCompression) -> Self {
        debug_assert!(bytes.len() <= WINDOW_SIZE);
        let stored = match compression {
            WindowCompression::None => Stored::Raw(bytes.to_vec()),
            WindowCompression::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
                // Writing to a Vec cannot fail.
                encoder.write_all(bytes).expect("in-memory deflate");
                Stored::Deflated(encoder.finish().expect("in-memory deflate"), bytes.len())
            }
        };
        Self { stored }
    }

    pub fn len(&self) -> usize {
        match &self.stored {
            Stored::Raw(bytes) => bytes.len(),
            Stored::Deflated(_, length) => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unpack(&self) -> PargzResult<Vec<u8>> {
        match &self.stored {
            Stored::Raw(bytes) => Ok(bytes.clone()),
            Stored::Deflated(compressed, length) => {
                let mut bytes = Vec::with_capacity(*length);
                DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut bytes)?;
                if bytes.len() != *length {
                    return Err(PargzError::internal("stored window length mismatch"));
                }
                Ok(bytes)
            }
        }
    }
}

#[derive(Debug)]
pub struct WindowMap {
    windows: HashMap<u64, Arc<Window>>,
    compression: WindowCompression,
}

impl WindowMap {
    pub fn new(compression: WindowCompression) -> Self {
        Self {
            windows: HashMap::new(),
            compression,
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn contains(&self, chunk_offset_bits: u64) -> bool {
        self.windows.contains_key(&chunk_offset_bits)
    }

    /// Store the window preceding the chunk starting at `chunk_offset_bits`.
    /// Only the trailing 32 KiB are kept.
    pub fn insert(&mut self, chunk_offset_bits: u64, window: &[u8]) {
        let tail = &window[window.len().saturating_sub(WINDOW_SIZE)..];
        self.windows.insert(
            chunk_offset_bits,
            Arc::new(Window::from_bytes(tail, self.compression)),
        );
    }

    pub fn get(&self, chunk_offset_bits: u64) -> Option<Arc<Window>> {
        self.windows.get(&chunk_offset_bits).cloned()
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_raw_and_compressed() {
        let bytes: Vec<u8> = (0..WINDOW_SIZE).map(|i| (i % 253) as u8).collect();
        for compression in [WindowCompression::None, WindowCompression::Deflate] {
            let mut map = WindowMap::new(compression);
            map.insert(1234, &bytes);
            let window = map.get(1234).unwrap();
            assert_eq!(window.len(), WINDOW_SIZE);
            assert_eq!(window.unpack().unwrap(), bytes);
        }
    }

    #[test]
    fn keeps_only_the_trailing_window() {
        let mut long = vec![0u8; WINDOW_SIZE + 100];
        for (i, byte) in long.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let mut map = WindowMap::new(WindowCompression::None);
        map.insert(0, &long);
        let window = map.get(0).unwrap();
        assert_eq!(window.len(), WINDOW_SIZE);
        assert_eq!(window.unpack().unwrap(), long[100..]);
    }

    #[test]
    fn empty_window_for_member_boundaries() {
        let mut map = WindowMap::new(WindowCompression::Deflate);
        map.insert(42, &[]);
        let window = map.get(42).unwrap();
        assert!(window.is_empty());
        assert_eq!(window.unpack().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn missing_offsets_return_none() {
        let map = WindowMap::new(WindowCompression::None);
        assert!(map.get(7).is_none());
        assert!(!map.contains(7));
    }
}
