//! 512-byte sector codec.
//!
//! Everything in the stream-optimized format is addressed in sectors, and
//! metadata is delimited by 512-byte [`Marker`] records. This module decodes
//! those records and provides the small I/O helpers the rest of the crate
//! builds on: an exact-read loop and an off-target-checked seek.

use std::io::{self, Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// End-of-stream metadata marker.
pub const MARKER_EOS: u32 = 0x0000_0000;
/// Grain table metadata marker.
pub const MARKER_GT: u32 = 0x0000_0001;
/// Grain directory metadata marker.
pub const MARKER_GD: u32 = 0x0000_0002;
/// Footer metadata marker.
pub const MARKER_FOOTER: u32 = 0x0000_0003;
/// Synthesised marker type for grain data; never stored on disk.
pub const MARKER_GRAIN: u32 = 0xffff_ffff;

/// A grain marker embeds the first 500 bytes of the compressed payload.
pub const MARKER_EMBEDDED_DATA_LEN: usize = 500;

/// Decoded form of a 512-byte marker sector.
///
/// When `size` is zero the marker delimits metadata and `kind` holds one of
/// the `MARKER_*` type constants read from the sector. When `size` is
/// non-zero the marker announces a grain: `kind` is [`MARKER_GRAIN`],
/// `value` is the grain's logical sector on the virtual disk and `data`
/// carries the first 500 bytes of its compressed payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    /// Sector index (grain markers) or trailing sector count (metadata).
    pub value: u64,
    /// Compressed payload length in bytes; zero for metadata markers.
    pub size: u32,
    /// One of the `MARKER_*` constants.
    pub kind: u32,
    /// First 500 compressed bytes, grain markers only.
    pub data: Vec<u8>,
}

impl Marker {
    /// Decodes one marker from a 512-byte sector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShortRead`] if fewer than 512 bytes are available.
    pub fn parse(sector: &[u8]) -> Result<Marker> {
        if sector.len() < SECTOR_SIZE as usize {
            return Err(Error::ShortRead {
                actual: sector.len(),
                expected: SECTOR_SIZE as usize,
            });
        }
        let value = le_u64(&sector[0..8]);
        let size = le_u32(&sector[8..12]);
        if size == 0 {
            Ok(Marker {
                value,
                size,
                kind: le_u32(&sector[12..16]),
                data: Vec::new(),
            })
        } else {
            Ok(Marker {
                value,
                size,
                kind: MARKER_GRAIN,
                data: sector[12..].to_vec(),
            })
        }
    }

    /// Reads one sector from `source` and decodes it as a marker.
    pub fn read_from<R: Read>(source: &mut R) -> Result<Marker> {
        let sector = read_sector(source)?;
        Marker::parse(&sector)
    }
}

pub(crate) fn le_u16(buf: &[u8]) -> u16 {
    u16::from_le_bytes(<[u8; 2]>::try_from(&buf[..2]).unwrap())
}

pub(crate) fn le_u32(buf: &[u8]) -> u32 {
    u32::from_le_bytes(<[u8; 4]>::try_from(&buf[..4]).unwrap())
}

pub(crate) fn le_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(<[u8; 8]>::try_from(&buf[..8]).unwrap())
}

/// Fills `buf` completely, retrying partial reads until end-of-file.
///
/// # Errors
///
/// Returns [`Error::ShortRead`] if the source ends before `buf` is full.
pub(crate) fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::ShortRead {
                    actual: filled,
                    expected: buf.len(),
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reads exactly one 512-byte sector.
pub(crate) fn read_sector<R: Read>(source: &mut R) -> Result<[u8; SECTOR_SIZE as usize]> {
    let mut sector = [0u8; SECTOR_SIZE as usize];
    read_full(source, &mut sector)?;
    Ok(sector)
}

/// Seeks to an absolute offset and verifies the position actually reached.
pub(crate) fn seek_to<S: Seek>(source: &mut S, offset: u64) -> Result<()> {
    let position = source.seek(SeekFrom::Start(offset))?;
    if position != offset {
        return Err(Error::ShortSeek {
            actual: position,
            expected: offset,
        });
    }
    Ok(())
}
