use std::fmt;
use std::io;
use thiserror::Error;

/// Errors produced while decoding gzip streams or handling seek indexes.
///
/// Decode errors carry the bit position inside the compressed stream where
/// the problem was detected, which the block finder uses to tell apart
/// header failures (bad candidate offset) from data failures (corruption).
#[derive(Error, Debug)]
pub enum PargzError {
    #[error("unexpected end of file")]
    EndOfFile,

    #[error("invalid gzip magic bytes")]
    InvalidMagic,

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid gzip header: {0}")]
    InvalidGzipHeader(&'static str),

    #[error("invalid deflate block type at bit {bit_position}")]
    InvalidBlockType { bit_position: u64 },

    #[error("invalid precode code lengths")]
    InvalidCodeLengths,

    #[error("bloating (incomplete) huffman coding")]
    BloatingHuffmanCoding,

    #[error("invalid huffman code at bit {bit_position}")]
    InvalidHuffmanCode { bit_position: u64 },

    #[error("invalid back-reference at bit {bit_position}")]
    InvalidBackreference { bit_position: u64 },

    #[error("CRC-32 mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("decompressed size mismatch: stored {stored}, computed {computed}")]
    SizeMismatch { stored: u64, computed: u64 },

    #[error("incomplete gzip stream")]
    IncompleteStream,

    #[error("index format error: {0}")]
    IndexFormat(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PargzError {
    pub fn index_format<T: fmt::Display>(msg: T) -> Self {
        PargzError::IndexFormat(msg.to_string())
    }

    pub fn invalid_argument<T: fmt::Display>(msg: T) -> Self {
        PargzError::InvalidArgument(msg.to_string())
    }

    pub fn internal<T: fmt::Display>(msg: T) -> Self {
        PargzError::Internal(msg.to_string())
    }

    /// True for errors that reject a speculative block-start candidate
    /// before any block data was decoded.
    pub fn is_header_failure(&self) -> bool {
        matches!(
            self,
            PargzError::InvalidBlockType { .. }
                | PargzError::InvalidCodeLengths
                | PargzError::BloatingHuffmanCoding
        )
    }
}

pub type PargzResult<T> = Result<T, PargzError>;

impl From<PargzError> for io::Error {
    fn from(error: PargzError) -> Self {
        match error {
            PargzError::Io(inner) => inner,
            PargzError::EndOfFile | PargzError::IncompleteStream => {
                io::Error::new(io::ErrorKind::UnexpectedEof, error.to_string())
            }
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}
