//! Stream-optimized sparse extent reading.
//!
//! A stream-optimized VMDK stores the virtual disk as DEFLATE-compressed
//! grains delimited by markers, with a two-level grain directory / grain
//! table index appended near the end of the file. This module implements
//! random access over that layout: logical offsets are translated through
//! the index, grains are fetched and inflated on demand, and decompressed
//! grains are kept in a pluggable cache so nearby reads do not pay the
//! DEFLATE cost twice.
//!
//! The authoritative header is the trailing copy at `file_size - 1024`;
//! stream-optimized writers only know the index offsets after all grains
//! have been written, so the leading header is left without them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;

use flate2::read::ZlibDecoder;
use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sector::{
    self, Marker, MARKER_EMBEDDED_DATA_LEN, MARKER_EOS, MARKER_FOOTER, MARKER_GD, MARKER_GRAIN,
    MARKER_GT, SECTOR_SIZE,
};

/// `KDMV` signature of the sparse extent header, little-endian on disk.
pub const SPARSE_MAGIC_NUMBER: u32 = 0x564d_444b;

/// The only compression algorithm stream-optimized images use.
pub const COMPRESSION_DEFLATE: u16 = 1;

/// Default number of decompressed grains kept resident (2 MiB at the
/// usual 64 KiB grain size).
pub const DEFAULT_CACHED_GRAINS: usize = 32;

/// Fixed 512-byte sparse extent header.
///
/// All integer fields are little-endian. Offsets and sizes are expressed
/// in sectors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SparseExtentHeader {
    pub version: u32,
    pub flags: u32,
    /// Capacity of the virtual disk in sectors.
    pub capacity: u64,
    /// Grain length in sectors; a power of two, typically 128.
    pub grain_size: u64,
    /// Sector of the embedded descriptor, or 0 if not set.
    pub descriptor_offset: u64,
    /// Length of the embedded descriptor in sectors.
    pub descriptor_size: u64,
    /// Number of entries per grain table, typically 512.
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory sector, unused by this reader.
    pub rgd_offset: u64,
    /// First data sector of the grain directory; the framing marker sits
    /// one sector before it.
    pub gd_offset: u64,
    /// Number of metadata sectors preceding grain data.
    pub overhead: u64,
    pub unclean_shutdown: u8,
    /// End-of-line sentinel bytes used to detect ASCII transfer mangling.
    pub single_end_line_char: u8,
    pub non_end_line_char: u8,
    pub double_end_line_char1: u8,
    pub double_end_line_char2: u8,
    /// 1 = DEFLATE.
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Decodes a header from one 512-byte sector.
    ///
    /// # Errors
    ///
    /// [`Error::NotVmdk`] if the `KDMV` signature is missing or the buffer
    /// is too short to hold a header.
    pub fn parse(data: &[u8]) -> Result<SparseExtentHeader> {
        if data.len() < 79 {
            return Err(Error::NotVmdk);
        }
        if sector::le_u32(&data[0..4]) != SPARSE_MAGIC_NUMBER {
            return Err(Error::NotVmdk);
        }
        Ok(SparseExtentHeader {
            version: sector::le_u32(&data[4..8]),
            flags: sector::le_u32(&data[8..12]),
            capacity: sector::le_u64(&data[12..20]),
            grain_size: sector::le_u64(&data[20..28]),
            descriptor_offset: sector::le_u64(&data[28..36]),
            descriptor_size: sector::le_u64(&data[36..44]),
            num_gtes_per_gt: sector::le_u32(&data[44..48]),
            rgd_offset: sector::le_u64(&data[48..56]),
            gd_offset: sector::le_u64(&data[56..64]),
            overhead: sector::le_u64(&data[64..72]),
            unclean_shutdown: data[72],
            single_end_line_char: data[73],
            non_end_line_char: data[74],
            double_end_line_char1: data[75],
            double_end_line_char2: data[76],
            compress_algorithm: sector::le_u16(&data[77..79]),
        })
    }

    /// Decompressed grain length in bytes.
    pub fn grain_byte_len(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Number of grain directory entries covering `capacity`.
    pub fn grain_directory_len(&self) -> u64 {
        let span = self.grain_size * u64::from(self.num_gtes_per_gt);
        self.capacity.div_ceil(span)
    }
}

/// Store for decompressed grains, keyed by the grain marker's sector.
///
/// The reader only requires that a hit returns the same bytes a miss would
/// have produced; retention is entirely up to the implementation, so a
/// no-op store is valid.
pub trait GrainCache {
    fn get(&mut self, grain_sector: u64) -> Option<&[u8]>;
    fn put(&mut self, grain_sector: u64, data: Vec<u8>);
}

/// LRU cache bounded by grain count.
pub struct LruGrainCache {
    entries: LruCache<u64, Vec<u8>>,
}

impl LruGrainCache {
    pub fn new(max_grains: usize) -> LruGrainCache {
        let capacity = NonZeroUsize::new(max_grains).unwrap_or(NonZeroUsize::MIN);
        LruGrainCache {
            entries: LruCache::new(capacity),
        }
    }
}

impl Default for LruGrainCache {
    fn default() -> LruGrainCache {
        LruGrainCache::new(DEFAULT_CACHED_GRAINS)
    }
}

impl GrainCache for LruGrainCache {
    fn get(&mut self, grain_sector: u64) -> Option<&[u8]> {
        self.entries.get(&grain_sector).map(|data| data.as_slice())
    }

    fn put(&mut self, grain_sector: u64, data: Vec<u8>) {
        self.entries.put(grain_sector, data);
    }
}

/// Store that retains nothing; every lookup misses.
pub struct NoGrainCache;

impl GrainCache for NoGrainCache {
    fn get(&mut self, _grain_sector: u64) -> Option<&[u8]> {
        None
    }

    fn put(&mut self, _grain_sector: u64, _data: Vec<u8>) {}
}

/// Result of translating a logical byte offset through the grain index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GrainLocation {
    /// The offset falls in a stored grain: the grain marker's sector and
    /// the byte offset inside the decompressed grain.
    Stored { grain_sector: u64, data_offset: u64 },
    /// No grain backs the offset; reads yield zeros.
    Sparse,
}

/// Random-access reader over one stream-optimized sparse extent.
///
/// The underlying source is owned exclusively: every read seeks first, so
/// no position is carried between calls. Reads never walk the marker
/// stream; they jump through the grain directory and grain tables loaded
/// from the trailing index.
pub struct StreamOptimizedImage<R: Read + Seek> {
    source: R,
    header: SparseExtentHeader,
    grain_directory: Vec<u32>,
    /// Grain tables memoised under their grain directory entry.
    grain_tables: HashMap<u64, Vec<u32>>,
    cache: Box<dyn GrainCache>,
    position: u64,
}

impl<R: Read + Seek> std::fmt::Debug for StreamOptimizedImage<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptimizedImage")
            .field("header", &self.header)
            .field("grain_directory", &self.grain_directory)
            .field("grain_tables", &self.grain_tables)
            .field("position", &self.position)
            .finish()
    }
}

impl<R: Read + Seek> StreamOptimizedImage<R> {
    /// Opens the extent with the default LRU grain cache.
    pub fn new(source: R) -> Result<StreamOptimizedImage<R>> {
        StreamOptimizedImage::with_cache(source, Box::<LruGrainCache>::default())
    }

    /// Opens the extent with a caller-provided grain cache.
    ///
    /// Reads the trailing header, validates the compression algorithm and
    /// loads the grain directory. Grain tables are loaded lazily.
    pub fn with_cache(
        mut source: R,
        cache: Box<dyn GrainCache>,
    ) -> Result<StreamOptimizedImage<R>> {
        let header = read_trailing_header(&mut source)?;
        debug!("trailing sparse extent header: {:?}", header);
        if header.compress_algorithm != COMPRESSION_DEFLATE {
            return Err(Error::UnsupportedCompression(header.compress_algorithm));
        }
        // A stream-optimized trailing header always carries a populated
        // index and a non-degenerate geometry.
        if header.gd_offset == 0 || header.grain_size == 0 || header.num_gtes_per_gt == 0 {
            return Err(Error::NotVmdk);
        }
        let grain_directory = read_grain_directory(&mut source, &header)?;
        debug!("grain directory entries: {}", grain_directory.len());
        Ok(StreamOptimizedImage {
            source,
            header,
            grain_directory,
            grain_tables: HashMap::new(),
            cache,
            position: 0,
        })
    }

    /// The trailing (authoritative) sparse extent header.
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Virtual disk size in bytes.
    pub fn size(&self) -> u64 {
        self.header.capacity * SECTOR_SIZE
    }

    /// Translates a logical byte offset into a grain location.
    pub fn translate_offset(&mut self, offset: u64) -> Result<GrainLocation> {
        let grain = self.header.grain_byte_len();
        let table_span = grain * u64::from(self.header.num_gtes_per_gt);
        let gt_index = (offset / table_span) as usize;
        let gde = match self.grain_directory.get(gt_index) {
            Some(&gde) => gde,
            None => return Err(Error::DataNotPresent),
        };
        if gde == 0 {
            return Ok(GrainLocation::Sparse);
        }
        let entry_index = ((offset % table_span) / grain) as usize;
        let table = self.grain_table(u64::from(gde))?;
        let grain_sector = table[entry_index];
        if grain_sector == 0 {
            return Ok(GrainLocation::Sparse);
        }
        Ok(GrainLocation::Stored {
            grain_sector: u64::from(grain_sector),
            data_offset: offset % grain,
        })
    }

    /// Loads (or returns the memoised) grain table for a directory entry.
    fn grain_table(&mut self, gde: u64) -> Result<&Vec<u32>> {
        match self.grain_tables.entry(gde) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let table = read_grain_table(&mut self.source, &self.header, gde)?;
                Ok(entry.insert(table))
            }
        }
    }

    /// Reads one sector worth of data at `offset`.
    ///
    /// `buf` must be exactly one sector long. Sparse regions fill the
    /// buffer with zeros and report a full sector. When `offset` is not
    /// grain-aligned and the tail of the grain is nearer than a sector,
    /// the copy is clamped to the grain boundary and the shorter count is
    /// returned.
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.len() != SECTOR_SIZE as usize {
            return Err(Error::InvalidReadLength {
                actual: buf.len(),
                expected: SECTOR_SIZE as usize,
            });
        }
        let (grain_sector, data_offset) = match self.translate_offset(offset)? {
            GrainLocation::Sparse => {
                buf.fill(0);
                return Ok(SECTOR_SIZE as usize);
            }
            GrainLocation::Stored {
                grain_sector,
                data_offset,
            } => (grain_sector, data_offset),
        };

        let start = data_offset as usize;
        let grain_len = self.header.grain_byte_len() as usize;
        let count = buf.len().min(grain_len - start);
        if let Some(data) = self.cache.get(grain_sector) {
            buf[..count].copy_from_slice(&data[start..start + count]);
            return Ok(count);
        }
        let logical_sector = offset / SECTOR_SIZE / self.header.grain_size * self.header.grain_size;
        let data = self.read_grain(grain_sector, logical_sector)?;
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.cache.put(grain_sector, data);
        Ok(count)
    }

    /// Reads and inflates the grain whose marker sits at `grain_sector`.
    /// The marker must claim `logical_sector` as its position on the
    /// virtual disk.
    fn read_grain(&mut self, grain_sector: u64, logical_sector: u64) -> Result<Vec<u8>> {
        let compressed = read_compressed_grain(&mut self.source, grain_sector, logical_sector)?;
        let grain_len = self.header.grain_byte_len();
        let mut data = Vec::with_capacity(grain_len as usize);
        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        decoder
            .read_to_end(&mut data)
            .map_err(Error::Decompression)?;
        if data.len() as u64 != grain_len {
            return Err(Error::InvalidGrain(format!(
                "decompressed {} bytes, expected {}",
                data.len(),
                grain_len
            )));
        }
        Ok(data)
    }
}

impl<R: Read + Seek> Read for StreamOptimizedImage<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.size();
        if self.position >= size {
            return Ok(0);
        }
        let limit = buf.len().min((size - self.position) as usize);
        let mut sector_buf = [0u8; SECTOR_SIZE as usize];
        let mut filled = 0;
        while filled < limit {
            let offset = self.position + filled as u64;
            let intra = (offset % SECTOR_SIZE) as usize;
            let produced = self
                .read_at(&mut sector_buf, offset - intra as u64)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            let available = produced.saturating_sub(intra);
            if available == 0 {
                break;
            }
            let count = available.min(limit - filled);
            buf[filled..filled + count].copy_from_slice(&sector_buf[intra..intra + count]);
            filled += count;
        }
        self.position += filled as u64;
        Ok(filled)
    }
}

impl<R: Read + Seek> Seek for StreamOptimizedImage<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size();
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            SeekFrom::End(offset) => size.checked_add_signed(offset),
        };
        match target {
            Some(offset) if offset <= size => {
                self.position = offset;
                Ok(offset)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset is out of bounds",
            )),
        }
    }
}

/// Reads the authoritative header copy at `file_size - 1024`.
fn read_trailing_header<R: Read + Seek>(source: &mut R) -> Result<SparseExtentHeader> {
    let file_size = source.seek(SeekFrom::End(0))?;
    if file_size < 2 * SECTOR_SIZE {
        return Err(Error::NotVmdk);
    }
    sector::seek_to(source, file_size - 2 * SECTOR_SIZE)?;
    let data = sector::read_sector(source)?;
    SparseExtentHeader::parse(&data)
}

/// Reads a marker-framed entry table: one metadata marker of the expected
/// type, then `marker.value` sectors of 32-bit little-endian entries.
fn read_table_sectors<R: Read + Seek>(
    source: &mut R,
    table_offset: u64,
    expected_marker: u32,
) -> Result<Vec<u32>> {
    sector::seek_to(source, (table_offset - 1) * SECTOR_SIZE)?;
    let marker = Marker::read_from(source)?;
    if marker.kind != expected_marker {
        return Err(Error::InvalidMarker {
            actual: marker.kind,
            expected: expected_marker,
        });
    }
    let mut buf = vec![0u8; (marker.value * SECTOR_SIZE) as usize];
    sector::read_full(source, &mut buf)?;
    Ok(buf
        .chunks_exact(4)
        .map(|chunk| sector::le_u32(chunk))
        .collect())
}

/// Loads the grain directory appended behind the `GD` marker.
fn read_grain_directory<R: Read + Seek>(
    source: &mut R,
    header: &SparseExtentHeader,
) -> Result<Vec<u32>> {
    let mut entries = read_table_sectors(source, header.gd_offset, MARKER_GD)?;
    let expected = header.grain_directory_len() as usize;
    if entries.len() < expected {
        return Err(Error::ShortRead {
            actual: entries.len() * 4,
            expected: expected * 4,
        });
    }
    entries.truncate(expected);
    Ok(entries)
}

/// Loads one grain table behind its `GT` marker.
fn read_grain_table<R: Read + Seek>(
    source: &mut R,
    header: &SparseExtentHeader,
    gde: u64,
) -> Result<Vec<u32>> {
    let mut entries = read_table_sectors(source, gde, MARKER_GT)?;
    let expected = header.num_gtes_per_gt as usize;
    if entries.len() < expected {
        return Err(Error::ShortRead {
            actual: entries.len() * 4,
            expected: expected * 4,
        });
    }
    entries.truncate(expected);
    Ok(entries)
}

/// Reads the complete compressed payload of the grain whose marker sits at
/// `grain_sector`: the 500 bytes embedded in the marker plus the
/// continuation that follows it.
fn read_compressed_grain<R: Read + Seek>(
    source: &mut R,
    grain_sector: u64,
    logical_sector: u64,
) -> Result<Vec<u8>> {
    sector::seek_to(source, grain_sector * SECTOR_SIZE)?;
    let marker = Marker::read_from(source)?;
    if marker.kind != MARKER_GRAIN {
        return Err(Error::InvalidMarker {
            actual: marker.kind,
            expected: MARKER_GRAIN,
        });
    }
    if marker.value != logical_sector {
        return Err(Error::InvalidGrain(format!(
            "grain at sector {} claims logical sector {}, expected {}",
            grain_sector, marker.value, logical_sector
        )));
    }
    let total = marker.size as usize;
    let mut compressed = marker.data;
    if total <= compressed.len() {
        compressed.truncate(total);
        return Ok(compressed);
    }
    let mut rest = vec![0u8; total - MARKER_EMBEDDED_DATA_LEN];
    sector::read_full(source, &mut rest)?;
    compressed.extend_from_slice(&rest);
    Ok(compressed)
}

/// Sequential walker over the marker stream.
///
/// For whole-image extraction it is cheaper to follow the stream than to
/// jump through the index: grains arrive in write order and metadata spans
/// are skipped as their markers announce them. Random access never uses
/// this path.
pub struct GrainScanner<R: Read> {
    source: R,
    grain_byte_len: u64,
    halted: bool,
}

impl<R: Read> GrainScanner<R> {
    /// Creates a scanner over `source`, which must be positioned at the
    /// first marker (i.e. just past the `overhead` sectors).
    pub fn new(source: R, grain_size: u64) -> GrainScanner<R> {
        GrainScanner {
            source,
            grain_byte_len: grain_size * SECTOR_SIZE,
            halted: false,
        }
    }

    /// Returns the next grain as `(logical_sector, decompressed_data)`,
    /// or `None` once the footer marker (or end of stream) is reached.
    pub fn next_grain(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        while !self.halted {
            let mut raw = [0u8; SECTOR_SIZE as usize];
            match sector::read_full(&mut self.source, &mut raw) {
                Ok(()) => {}
                Err(Error::ShortRead { actual: 0, .. }) => {
                    self.halted = true;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
            let marker = Marker::parse(&raw)?;
            if marker.size > 0 {
                let data = self.read_grain_payload(marker)?;
                return Ok(Some(data));
            }
            match marker.kind {
                MARKER_EOS => {}
                MARKER_GT | MARKER_GD => self.skip_sectors(marker.value)?,
                MARKER_FOOTER => {
                    self.skip_sectors(marker.value)?;
                    self.halted = true;
                }
                other => return Err(Error::InvalidMarkerType(other)),
            }
        }
        Ok(None)
    }

    /// Reads the grain continuation sector-aligned, inflates and checks it.
    fn read_grain_payload(&mut self, marker: Marker) -> Result<(u64, Vec<u8>)> {
        let total = marker.size as usize;
        let mut compressed = marker.data;
        if total <= compressed.len() {
            compressed.truncate(total);
        } else {
            // Consume whole sectors to stay marker-aligned, then discard
            // the padding beyond the announced size.
            let trailing = total - MARKER_EMBEDDED_DATA_LEN;
            let sectors = (trailing as u64).div_ceil(SECTOR_SIZE);
            let mut rest = vec![0u8; (sectors * SECTOR_SIZE) as usize];
            sector::read_full(&mut self.source, &mut rest)?;
            rest.truncate(trailing);
            compressed.extend_from_slice(&rest);
        }

        let mut data = Vec::with_capacity(self.grain_byte_len as usize);
        let mut decoder = ZlibDecoder::new(compressed.as_slice());
        decoder
            .read_to_end(&mut data)
            .map_err(Error::Decompression)?;
        if data.len() as u64 != self.grain_byte_len {
            return Err(Error::InvalidGrain(format!(
                "decompressed {} bytes, expected {}",
                data.len(),
                self.grain_byte_len
            )));
        }
        Ok((marker.value, data))
    }

    fn skip_sectors(&mut self, count: u64) -> Result<()> {
        let mut raw = [0u8; SECTOR_SIZE as usize];
        for _ in 0..count {
            sector::read_full(&mut self.source, &mut raw)?;
        }
        Ok(())
    }
}

/// Validates that the descriptor region announced by a header stays within
/// the metadata overhead.
pub(crate) fn check_descriptor_bounds(header: &SparseExtentHeader) -> Result<()> {
    if header.descriptor_offset == 0 || header.descriptor_size == 0 {
        return Err(Error::InvalidDescriptor(
            "no embedded descriptor".to_string(),
        ));
    }
    if header.descriptor_offset + header.descriptor_size > header.overhead {
        warn!(
            "descriptor region {}+{} exceeds overhead {}",
            header.descriptor_offset, header.descriptor_size, header.overhead
        );
        return Err(Error::InvalidDescriptor(
            "descriptor region exceeds metadata overhead".to_string(),
        ));
    }
    Ok(())
}
