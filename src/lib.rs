//! This crate provides random-access reading of VMware VMDK disk images in
//! the stream-optimized sparse format, plus partition-table discovery on
//! the decoded virtual block device.
//!
//! [`Vmdk::open`] takes any seekable byte source holding a single-extent
//! stream-optimized image and returns a reader bounded to the virtual disk
//! capacity. Reads are served by translating logical offsets through the
//! grain directory / grain table index appended at the tail of the file,
//! inflating DEFLATE-compressed grains on demand and caching them. Sparse
//! regions read as zeros.
//!
//! [`Vmdk::partition_table`] inspects the first sectors of the virtual
//! device and enumerates partitions from either a legacy MBR or a GPT.
//!
//! # Known Limitations
//!
//! Only the `streamOptimized` create type is supported; other subformats
//! (`monolithicSparse`, flat and 2GB-split variants, ESXi COWD) and
//! multi-extent descriptors are rejected at open time. Snapshots and disks
//! referring to a parent are out of scope.

pub mod descriptor;
pub mod disk;
pub mod error;
pub mod sector;
pub mod sparse;

#[cfg(test)]
pub(crate) mod test_support;

use std::io::{self, Read, Seek, SeekFrom};

use log::{debug, warn};

pub use descriptor::{DiskDescriptor, ExtentDescription, CREATE_TYPE_STREAM_OPTIMIZED};
pub use disk::{Partition, PartitionReader, PartitionTable, PartitionType};
pub use error::{Error, Result};
pub use sector::{Marker, SECTOR_SIZE};
pub use sparse::{
    GrainCache, GrainScanner, LruGrainCache, NoGrainCache, SparseExtentHeader,
    StreamOptimizedImage, SPARSE_MAGIC_NUMBER,
};

/// Probes whether `source` begins with the `KDMV` sparse extent signature.
///
/// This is a cheap identity check; it does not validate the rest of the
/// file. The source is left positioned after the signature bytes.
pub fn check<R: Read + Seek>(source: &mut R) -> Result<bool> {
    sector::seek_to(source, 0)?;
    let mut magic = [0u8; 4];
    match sector::read_full(source, &mut magic) {
        Ok(()) => Ok(u32::from_le_bytes(magic) == SPARSE_MAGIC_NUMBER),
        Err(Error::ShortRead { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// An opened stream-optimized VMDK: parsed descriptor plus the bounded
/// random-access image reader.
///
/// The reader owns its byte source exclusively; concurrent reads against
/// one instance are not supported. Callers needing parallelism open
/// independent instances over independent handles.
pub struct Vmdk<R: Read + Seek> {
    descriptor: DiskDescriptor,
    image: StreamOptimizedImage<R>,
}

impl<R: Read + Seek> std::fmt::Debug for Vmdk<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vmdk")
            .field("descriptor", &self.descriptor)
            .field("image", &self.image)
            .finish()
    }
}

impl<R: Read + Seek> Vmdk<R> {
    /// Opens a stream-optimized VMDK with the default LRU grain cache.
    pub fn open(source: R) -> Result<Vmdk<R>> {
        Vmdk::open_with_cache(source, Box::<LruGrainCache>::default())
    }

    /// Opens a stream-optimized VMDK with a caller-provided grain cache.
    ///
    /// The leading header supplies the embedded descriptor location; the
    /// grain index offsets come from the authoritative trailing header
    /// copy, which stream-optimized writers populate after all grains are
    /// written out.
    ///
    /// # Errors
    ///
    /// [`Error::NotVmdk`] if either header copy lacks the signature,
    /// [`Error::UnsupportedDividedImage`] for multi-extent descriptors,
    /// [`Error::UnsupportedCreateType`] for any create type other than
    /// `streamOptimized`, and [`Error::UnsupportedCompression`] when the
    /// trailing header names an algorithm other than DEFLATE.
    pub fn open_with_cache(mut source: R, cache: Box<dyn GrainCache>) -> Result<Vmdk<R>> {
        sector::seek_to(&mut source, 0)?;
        let leading = match sector::read_sector(&mut source) {
            Ok(data) => data,
            Err(Error::ShortRead { .. }) => return Err(Error::NotVmdk),
            Err(e) => return Err(e),
        };
        let header = SparseExtentHeader::parse(&leading)?;
        debug!("leading sparse extent header: {:?}", header);

        let descriptor = read_embedded_descriptor(&mut source, &header)?;
        debug!("parsed descriptor: {:?}", descriptor);
        if descriptor.extents.len() != 1 {
            return Err(Error::UnsupportedDividedImage(descriptor.extents.len()));
        }
        if descriptor.create_type != CREATE_TYPE_STREAM_OPTIMIZED {
            return Err(Error::UnsupportedCreateType(descriptor.create_type));
        }

        let image = StreamOptimizedImage::with_cache(source, cache)?;
        let extent_sectors: i64 = descriptor.extents.iter().map(|extent| extent.size).sum();
        if extent_sectors < 0 || extent_sectors as u64 != image.header().capacity {
            warn!(
                "descriptor extent size ({} sectors) disagrees with header capacity ({} sectors)",
                extent_sectors,
                image.header().capacity
            );
        }

        Ok(Vmdk { descriptor, image })
    }

    /// The parsed embedded descriptor.
    pub fn descriptor(&self) -> &DiskDescriptor {
        &self.descriptor
    }

    /// The authoritative (trailing) sparse extent header.
    pub fn header(&self) -> &SparseExtentHeader {
        self.image.header()
    }

    /// Virtual disk size in bytes.
    pub fn size(&self) -> u64 {
        self.image.size()
    }

    /// Reads one sector at `offset`; see
    /// [`StreamOptimizedImage::read_at`].
    pub fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.image.read_at(buf, offset)
    }

    /// Discovers the partition table on the virtual device.
    pub fn partition_table(&mut self) -> Result<PartitionTable> {
        PartitionTable::parse(self)
    }

    /// A bounded reader over one partition's byte range.
    pub fn partition_reader(&mut self, partition: &Partition) -> PartitionReader<'_, Vmdk<R>> {
        PartitionReader::new(self, partition)
    }
}

impl<R: Read + Seek> Read for Vmdk<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.image.read(buf)
    }
}

impl<R: Read + Seek> Seek for Vmdk<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.image.seek(pos)
    }
}

/// Reads exactly `descriptor_size` sectors of descriptor text, tolerating
/// the trailing NUL padding stream-optimized writers emit.
fn read_embedded_descriptor<R: Read + Seek>(
    source: &mut R,
    header: &SparseExtentHeader,
) -> Result<DiskDescriptor> {
    sparse::check_descriptor_bounds(header)?;
    sector::seek_to(source, header.descriptor_offset * SECTOR_SIZE)?;
    let mut buf = vec![0u8; (header.descriptor_size * SECTOR_SIZE) as usize];
    sector::read_full(source, &mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).parse()
}
