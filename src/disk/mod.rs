//! Partition discovery on a decoded virtual block device.
//!
//! The driver always parses the Master Boot Record at LBA 0 first and
//! upgrades to GPT when the protective signals are present. Both table
//! kinds answer the same question, a sorted list of [`Partition`]
//! descriptors, so they live behind one sum type.

pub mod gpt;
pub mod mbr;

use std::io::{self, Read, Seek, SeekFrom};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sector::{self, SECTOR_SIZE};

pub use gpt::{Guid, GuidPartitionTable};
pub use mbr::MasterBootRecord;

/// One discovered partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Partition {
    /// GPT label (with the `/` → `ROOT` and empty → index rules applied),
    /// or the decimal starting LBA for MBR entries.
    pub name: String,
    pub start_sector: u64,
    pub sector_count: u64,
    pub bootable: bool,
    pub type_code: PartitionType,
    /// Slot in the on-disk table the entry came from.
    pub index: usize,
}

/// Partition type identifier, per table flavour.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum PartitionType {
    /// MBR type byte.
    Mbr(u8),
    /// GPT partition type GUID.
    Gpt(Guid),
}

/// The partition table found on a device.
#[derive(Clone, Debug)]
pub enum PartitionTable {
    Mbr(MasterBootRecord),
    Gpt(GuidPartitionTable),
}

impl PartitionTable {
    /// Reads the partition table from the start of `source`.
    ///
    /// The MBR at LBA 0 is parsed first. The driver upgrades to GPT when
    /// an entry carries the protective `0xEE` type byte, or when the
    /// unique disk signature is zero and LBA 1 carries the `EFI PART`
    /// signature. The upgrade decision is made here once and is not
    /// revisited.
    pub fn parse<R: Read + Seek>(source: &mut R) -> Result<PartitionTable> {
        sector::seek_to(source, 0)?;
        let sector0 = sector::read_sector(source)?;
        let mbr = MasterBootRecord::parse(&sector0)?;

        let upgrade = mbr.has_protective_entry()
            || (mbr.unique_disk_signature == [0u8; 4] && has_efi_signature(source)?);
        if upgrade {
            debug!("protective MBR detected, reading GUID partition table");
            return Ok(PartitionTable::Gpt(GuidPartitionTable::parse(source)?));
        }
        Ok(PartitionTable::Mbr(mbr))
    }

    /// Partitions in ascending start-sector order.
    pub fn partitions(&self) -> Vec<Partition> {
        match self {
            PartitionTable::Mbr(mbr) => mbr.partitions(),
            PartitionTable::Gpt(gpt) => gpt.partitions(),
        }
    }
}

/// Checks whether LBA 1 begins with `EFI PART`. A device too short to
/// hold a second sector simply has no GPT.
fn has_efi_signature<R: Read + Seek>(source: &mut R) -> Result<bool> {
    sector::seek_to(source, SECTOR_SIZE)?;
    let mut signature = [0u8; 8];
    match sector::read_full(source, &mut signature) {
        Ok(()) => Ok(&signature == gpt::SIGNATURE),
        Err(Error::ShortRead { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Bounded `Read + Seek` view over one partition of an underlying device.
///
/// The view borrows the device mutably for its lifetime and re-seeks it on
/// every read, so the device's own cursor state never leaks through.
pub struct PartitionReader<'a, R: Read + Seek> {
    source: &'a mut R,
    start: u64,
    length: u64,
    position: u64,
}

impl<'a, R: Read + Seek> PartitionReader<'a, R> {
    pub fn new(source: &'a mut R, partition: &Partition) -> PartitionReader<'a, R> {
        PartitionReader {
            source,
            start: partition.start_sector * SECTOR_SIZE,
            length: partition.sector_count * SECTOR_SIZE,
            position: 0,
        }
    }

    /// Length of the view in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl<R: Read + Seek> Read for PartitionReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.length {
            return Ok(0);
        }
        let remaining = (self.length - self.position) as usize;
        let limit = buf.len().min(remaining);
        self.source
            .seek(SeekFrom::Start(self.start + self.position))?;
        let n = self.source.read(&mut buf[..limit])?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for PartitionReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
            SeekFrom::End(offset) => self.length.checked_add_signed(offset),
        };
        match target {
            Some(offset) if offset <= self.length => {
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
