//! Shared read-only access to the compressed input.
//!
//! Worker threads decode disjoint chunks of the same compressed stream in
//! parallel. Instead of handing each worker a dup'd file descriptor with its
//! own seek position, the whole input is exposed as one immutable byte
//! region (a memory mapping for files, an owned buffer otherwise) and passed
//! around as `Arc<Source>`. Reads are absolute-offset slices, so no lock is
//! ever held during I/O.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

use crate::error::PargzResult;

pub enum Source {
    Mapped(Mmap),
    Buffer(Vec<u8>),
}

impl Source {
    /// Memory-map a file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> PargzResult<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Source::Mapped(mmap))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Source::Buffer(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Source::Mapped(mmap) => mmap,
            Source::Buffer(bytes) => bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Total size in bits, the coordinate system of the compressed side.
    #[inline]
    pub fn bit_len(&self) -> u64 {
        self.len() as u64 * 8
    }
}

impl Deref for Source {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Mapped(mmap) => write!(f, "Source::Mapped({} bytes)", mmap.len()),
            Source::Buffer(bytes) => write!(f, "Source::Buffer({} bytes)", bytes.len()),
        }
    }
}
