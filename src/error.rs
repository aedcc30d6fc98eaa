//! Error types shared by every layer of the crate.
//!
//! Each failure a caller may want to discriminate gets its own variant;
//! everything else is carried as a wrapped [`std::io::Error`].

use thiserror::Error;

/// Unified error type for VMDK parsing and partition discovery.
#[derive(Debug, Error)]
pub enum Error {
    /// The file does not carry the `KDMV` signature, or is too short to
    /// hold a sparse extent header.
    #[error("this file is not a vmdk")]
    NotVmdk,

    /// The descriptor names a create type other than `streamOptimized`.
    #[error("unsupported create type: {0}")]
    UnsupportedCreateType(String),

    /// The descriptor lists a number of extents other than one.
    #[error("divided images are not supported ({0} extents)")]
    UnsupportedDividedImage(usize),

    /// The sparse extent header announces a compression algorithm other
    /// than DEFLATE.
    #[error("unsupported compression algorithm: {0}")]
    UnsupportedCompression(u16),

    /// Malformed embedded descriptor text. The offending line (or a short
    /// reason) is kept for diagnostics.
    #[error("invalid descriptor")]
    InvalidDescriptor(String),

    /// A metadata marker did not carry the expected type tag.
    #[error("invalid marker: actual({actual}), expected({expected})")]
    InvalidMarker { actual: u32, expected: u32 },

    /// A marker type outside the known set was encountered while walking
    /// the stream sequentially.
    #[error("invalid marker type: {0}")]
    InvalidMarkerType(u32),

    /// A grain failed its structural checks, e.g. the decompressed length
    /// does not match the grain size.
    #[error("invalid grain: {0}")]
    InvalidGrain(String),

    /// Translation resolved to a sparse hole. Recovered internally by the
    /// read path, which substitutes zero bytes; callers only see this when
    /// translating offsets themselves.
    #[error("data not present")]
    DataNotPresent,

    /// The underlying source delivered fewer bytes than required.
    #[error("short read: actual({actual}), expected({expected})")]
    ShortRead { actual: usize, expected: usize },

    /// A seek on the underlying source landed off-target.
    #[error("short seek: actual({actual}), expected({expected})")]
    ShortSeek { actual: u64, expected: u64 },

    /// DEFLATE inflation of a grain payload failed.
    #[error("failed to decompress grain")]
    Decompression(#[source] std::io::Error),

    /// Sector-level reads require exactly one sector worth of buffer.
    #[error("invalid read length {actual}, reads must be {expected} bytes")]
    InvalidReadLength { actual: usize, expected: usize },

    /// The boot record signature bytes are not `0xAA55`.
    #[error("invalid master boot record signature")]
    InvalidSignature,

    /// A GUID partition table violated one of its header invariants.
    #[error("invalid partition table: {0}")]
    InvalidPartitionTable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
