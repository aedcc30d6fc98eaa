//! GUID Partition Table parsing.
//!
//! The GPT header lives at LBA 1 behind a protective MBR. Partition
//! entries are 128 bytes each and start at the header's
//! `partition_entry_lba`. GUIDs are stored mixed-endian: the first three
//! fields little-endian, the last two big-endian; the canonical string
//! form reverses the first three on the way out.

use std::fmt;
use std::io::{Read, Seek};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::disk::{Partition, PartitionType};
use crate::error::{Error, Result};
use crate::sector::{self, SECTOR_SIZE};

/// ASCII header signature at LBA 1.
pub const SIGNATURE: &[u8; 8] = b"EFI PART";

/// The partition type GUID of unused entry slots.
pub const UNUSED: &str = "00000000-0000-0000-0000-000000000000";
/// MBR partition scheme.
pub const MBR_SCHEME: &str = "024DEE41-33E7-11D3-9D69-0008C781F39F";
/// EFI system partition.
pub const EFI_SYSTEM: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// GRUB BIOS boot partition ("Hah!IdontNeedEFI").
pub const GRUB_BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";

const ENTRY_LEN: u32 = 128;
const RESERVED_PADDING_LEN: u32 = 420;
// Caps the entry array read; a header asking for more is corrupt.
const MAX_ENTRY_ARRAY_BYTES: u64 = 16 * 1024 * 1024;

/// A 16-byte GUID in on-disk (mixed-endian) byte order.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d1 = sector::le_u32(&self.0[0..4]);
        let d2 = sector::le_u16(&self.0[4..6]);
        let d3 = sector::le_u16(&self.0[6..8]);
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            d1,
            d2,
            d3,
            self.0[8],
            self.0[9],
            self.0[10],
            self.0[11],
            self.0[12],
            self.0[13],
            self.0[14],
            self.0[15],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Decoded GPT header (LBA 1).
#[derive(Clone, Debug)]
pub struct GptHeader {
    pub revision: [u8; 4],
    pub header_size: u32,
    pub header_crc32: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Guid,
    pub partition_entry_lba: u64,
    pub number_of_partition_entries: u32,
    pub size_of_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

impl GptHeader {
    /// Decodes and validates a header sector.
    pub fn parse(data: &[u8]) -> Result<GptHeader> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(Error::ShortRead {
                actual: data.len(),
                expected: SECTOR_SIZE as usize,
            });
        }
        if &data[0..8] != SIGNATURE {
            return Err(Error::InvalidPartitionTable(format!(
                "invalid GPT signature: {:02x?}",
                &data[0..8]
            )));
        }
        let header = GptHeader {
            revision: [data[8], data[9], data[10], data[11]],
            header_size: sector::le_u32(&data[12..16]),
            header_crc32: sector::le_u32(&data[16..20]),
            my_lba: sector::le_u64(&data[24..32]),
            alternate_lba: sector::le_u64(&data[32..40]),
            first_usable_lba: sector::le_u64(&data[40..48]),
            last_usable_lba: sector::le_u64(&data[48..56]),
            disk_guid: Guid(<[u8; 16]>::try_from(&data[56..72]).unwrap()),
            partition_entry_lba: sector::le_u64(&data[72..80]),
            number_of_partition_entries: sector::le_u32(&data[80..84]),
            size_of_partition_entry: sector::le_u32(&data[84..88]),
            partition_entry_array_crc32: sector::le_u32(&data[88..92]),
        };
        if header.size_of_partition_entry != ENTRY_LEN {
            return Err(Error::InvalidPartitionTable(format!(
                "partition entries must be {} bytes, got {}",
                ENTRY_LEN, header.size_of_partition_entry
            )));
        }
        if header.header_size != SECTOR_SIZE as u32 - RESERVED_PADDING_LEN {
            return Err(Error::InvalidPartitionTable(format!(
                "invalid header size: {}",
                header.header_size
            )));
        }
        Ok(header)
    }
}

/// One 128-byte partition entry.
#[derive(Clone, Debug)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub unique_guid: Guid,
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    /// Raw UTF-16LE name field, null-padded.
    pub partition_name: [u8; 72],
    /// Position in the on-disk entry array.
    pub index: usize,
}

impl PartitionEntry {
    fn parse(data: &[u8], index: usize) -> PartitionEntry {
        PartitionEntry {
            type_guid: Guid(<[u8; 16]>::try_from(&data[0..16]).unwrap()),
            unique_guid: Guid(<[u8; 16]>::try_from(&data[16..32]).unwrap()),
            starting_lba: sector::le_u64(&data[32..40]),
            ending_lba: sector::le_u64(&data[40..48]),
            attributes: sector::le_u64(&data[48..56]),
            partition_name: <[u8; 72]>::try_from(&data[56..128]).unwrap(),
            index,
        }
    }

    pub fn is_used(&self) -> bool {
        !self.type_guid.is_zero()
    }

    /// Inclusive LBA range length.
    pub fn sectors(&self) -> u64 {
        self.ending_lba - self.starting_lba + 1
    }

    /// A partition is considered bootable when its type GUID names one of
    /// the boot schemes.
    pub fn bootable(&self) -> bool {
        let guid = self.type_guid.to_string();
        guid == MBR_SCHEME || guid == EFI_SYSTEM || guid == GRUB_BIOS_BOOT
    }

    /// Human-readable partition name.
    ///
    /// The UTF-16LE name field is decoded with NULs stripped; an empty
    /// name falls back to the entry index, and the special name `/` is
    /// reported as `ROOT`.
    pub fn name(&self) -> String {
        let units: Vec<u16> = self
            .partition_name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .filter(|&unit| unit != 0)
            .collect();
        let name = String::from_utf16_lossy(&units);
        match name.as_str() {
            "/" => "ROOT".to_string(),
            "" => self.index.to_string(),
            _ => name,
        }
    }
}

/// Decoded GUID partition table: header plus used entries.
#[derive(Clone, Debug)]
pub struct GuidPartitionTable {
    pub header: GptHeader,
    pub entries: Vec<PartitionEntry>,
}

impl GuidPartitionTable {
    /// Reads the table from a device: header at LBA 1, then the entry
    /// array at `partition_entry_lba`. Unused entries (zero type GUID)
    /// are discarded and the rest kept in ascending start order.
    pub fn parse<R: Read + Seek>(source: &mut R) -> Result<GuidPartitionTable> {
        sector::seek_to(source, SECTOR_SIZE)?;
        let data = sector::read_sector(source)?;
        let header = GptHeader::parse(&data)?;

        let array_len =
            u64::from(header.number_of_partition_entries) * u64::from(ENTRY_LEN);
        if array_len > MAX_ENTRY_ARRAY_BYTES {
            return Err(Error::InvalidPartitionTable(format!(
                "partition entry array of {} bytes exceeds the {} byte cap",
                array_len, MAX_ENTRY_ARRAY_BYTES
            )));
        }
        sector::seek_to(source, header.partition_entry_lba * SECTOR_SIZE)?;
        let mut array = vec![0u8; array_len as usize];
        sector::read_full(source, &mut array)?;

        let mut entries = Vec::new();
        for (index, raw) in array.chunks_exact(ENTRY_LEN as usize).enumerate() {
            let entry = PartitionEntry::parse(raw, index);
            if !entry.is_used() {
                continue;
            }
            if entry.ending_lba < entry.starting_lba {
                return Err(Error::InvalidPartitionTable(format!(
                    "entry {} ends before it starts ({} < {})",
                    index, entry.ending_lba, entry.starting_lba
                )));
            }
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.starting_lba);
        for pair in entries.windows(2) {
            if pair[1].starting_lba <= pair[0].ending_lba {
                warn!(
                    "GPT entries {} and {} overlap",
                    pair[0].index, pair[1].index
                );
            }
        }

        Ok(GuidPartitionTable { header, entries })
    }

    /// Used partitions in ascending start-sector order.
    pub fn partitions(&self) -> Vec<Partition> {
        self.entries
            .iter()
            .map(|entry| Partition {
                name: entry.name(),
                start_sector: entry.starting_lba,
                sector_count: entry.sectors(),
                bootable: entry.bootable(),
                type_code: PartitionType::Gpt(entry.type_guid),
                index: entry.index,
            })
            .collect()
    }
}
