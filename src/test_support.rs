//! Shared test fixtures: synthetic stream-optimized images and GPT devices
//! assembled in memory, small enough to reason about byte by byte.

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::disk::Guid;
use crate::sector::{MARKER_FOOTER, MARKER_GD, MARKER_GT, SECTOR_SIZE};

const SECTOR: usize = SECTOR_SIZE as usize;

/// DEFLATE-compresses `data` with zlib wrapping.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Converts a canonical GUID string into its on-disk mixed-endian bytes.
pub fn guid_from_str(s: &str) -> Guid {
    let groups: Vec<&str> = s.split('-').collect();
    assert_eq!(groups.len(), 5, "malformed GUID: {s}");
    let mut bytes = [0u8; 16];
    let d1 = u32::from_str_radix(groups[0], 16).unwrap();
    let d2 = u16::from_str_radix(groups[1], 16).unwrap();
    let d3 = u16::from_str_radix(groups[2], 16).unwrap();
    bytes[0..4].copy_from_slice(&d1.to_le_bytes());
    bytes[4..6].copy_from_slice(&d2.to_le_bytes());
    bytes[6..8].copy_from_slice(&d3.to_le_bytes());
    let d4 = u16::from_str_radix(groups[3], 16).unwrap();
    bytes[8..10].copy_from_slice(&d4.to_be_bytes());
    for (i, chunk) in groups[4].as_bytes().chunks_exact(2).enumerate() {
        bytes[10 + i] = u8::from_str_radix(std::str::from_utf8(chunk).unwrap(), 16).unwrap();
    }
    Guid(bytes)
}

fn pad_to_sector(buf: &mut Vec<u8>) {
    let rem = buf.len() % SECTOR;
    if rem != 0 {
        buf.resize(buf.len() + SECTOR - rem, 0);
    }
}

fn metadata_marker(value: u64, kind: u32) -> [u8; SECTOR] {
    let mut marker = [0u8; SECTOR];
    marker[0..8].copy_from_slice(&value.to_le_bytes());
    marker[12..16].copy_from_slice(&kind.to_le_bytes());
    marker
}

/// Builds a single-extent stream-optimized image: leading header,
/// embedded descriptor, grains, grain tables, grain directory, footer and
/// end-of-stream marker, with the authoritative header in the trailing
/// 1024 bytes.
pub struct SparseImageBuilder {
    capacity: u64,
    grain_size: u64,
    num_gtes_per_gt: u32,
    compress_algorithm: u16,
    /// `(logical_sector, compressed_payload)` in stream order.
    grains: Vec<(u64, Vec<u8>)>,
    descriptor: Option<String>,
    pub corrupt_gt_entry: bool,
}

impl SparseImageBuilder {
    pub fn new(capacity: u64) -> SparseImageBuilder {
        SparseImageBuilder {
            capacity,
            grain_size: 128,
            num_gtes_per_gt: 512,
            compress_algorithm: 1,
            grains: Vec::new(),
            descriptor: None,
            corrupt_gt_entry: false,
        }
    }

    /// Adds a stored grain; `data` must be exactly one grain long.
    pub fn grain(mut self, logical_sector: u64, data: &[u8]) -> SparseImageBuilder {
        assert_eq!(data.len() as u64, self.grain_size * SECTOR_SIZE);
        self.grains.push((logical_sector, compress(data)));
        self
    }

    /// Adds a grain whose decompressed length is taken as-is, for
    /// exercising the length validation.
    pub fn raw_grain(mut self, logical_sector: u64, data: &[u8]) -> SparseImageBuilder {
        self.grains.push((logical_sector, compress(data)));
        self
    }

    pub fn compress_algorithm(mut self, algorithm: u16) -> SparseImageBuilder {
        self.compress_algorithm = algorithm;
        self
    }

    pub fn descriptor_text(mut self, text: &str) -> SparseImageBuilder {
        self.descriptor = Some(text.to_string());
        self
    }

    pub fn create_type(self, create_type: &str) -> SparseImageBuilder {
        let capacity = self.capacity;
        self.descriptor_text(&format!(
            "# Disk DescriptorFile\nversion=1\nCID=fffffffe\nparentCID=ffffffff\n\
             createType=\"{create_type}\"\n\n# Extent description\n\
             RW {capacity} SPARSE \"test.img\"\n\n# The Disk Data Base\n\
             ddb.virtualHWVersion = \"4\"\n"
        ))
    }

    fn header_sector(&self, gd_offset: u64) -> [u8; SECTOR] {
        let mut header = [0u8; SECTOR];
        header[0..4].copy_from_slice(b"KDMV");
        header[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
        header[8..12].copy_from_slice(&0x0003_0001u32.to_le_bytes()); // flags
        header[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        header[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        header[28..36].copy_from_slice(&1u64.to_le_bytes()); // descriptor offset
        header[36..44].copy_from_slice(&1u64.to_le_bytes()); // descriptor size
        header[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        header[56..64].copy_from_slice(&gd_offset.to_le_bytes());
        header[64..72].copy_from_slice(&2u64.to_le_bytes()); // overhead
        header[73] = b'\n';
        header[74] = b' ';
        header[75] = b'\r';
        header[76] = b'\n';
        header[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        header
    }

    pub fn build(self) -> Vec<u8> {
        let descriptor = self.descriptor.clone().unwrap_or_else(|| {
            format!(
                "# Disk DescriptorFile\nversion=1\nCID=fffffffe\nparentCID=ffffffff\n\
                 createType=\"streamOptimized\"\n\n# Extent description\n\
                 RW {} SPARSE \"test.img\"\n\n# The Disk Data Base\n\
                 ddb.virtualHWVersion = \"4\"\n",
                self.capacity
            )
        });
        assert!(descriptor.len() <= SECTOR);

        // Grains, each a marker sector plus sector-padded continuation.
        let mut body = Vec::new();
        let mut next_sector = 2u64;
        let mut grain_sectors = Vec::new();
        for (logical_sector, compressed) in &self.grains {
            grain_sectors.push((*logical_sector, next_sector));
            let mut marker = [0u8; SECTOR];
            marker[0..8].copy_from_slice(&logical_sector.to_le_bytes());
            marker[8..12].copy_from_slice(&(compressed.len() as u32).to_le_bytes());
            let embedded = compressed.len().min(500);
            marker[12..12 + embedded].copy_from_slice(&compressed[..embedded]);
            body.extend_from_slice(&marker);
            next_sector += 1;
            if compressed.len() > 500 {
                let mut trailing = compressed[500..].to_vec();
                pad_to_sector(&mut trailing);
                next_sector += (trailing.len() / SECTOR) as u64;
                body.extend_from_slice(&trailing);
            }
        }

        // Grain tables, one per covered span.
        let span = self.grain_size * u64::from(self.num_gtes_per_gt);
        let num_gts = self.capacity.div_ceil(span);
        let gt_data_sectors = (u64::from(self.num_gtes_per_gt) * 4).div_ceil(SECTOR_SIZE);
        let mut gd_entries = Vec::new();
        for gt_index in 0..num_gts {
            body.extend_from_slice(&metadata_marker(gt_data_sectors, MARKER_GT));
            let gt_marker_sector = next_sector;
            next_sector += 1;
            gd_entries.push(next_sector as u32);

            let mut entries = vec![0u32; self.num_gtes_per_gt as usize];
            for (logical_sector, marker_sector) in &grain_sectors {
                if logical_sector / span == gt_index {
                    entries[((logical_sector % span) / self.grain_size) as usize] =
                        *marker_sector as u32;
                }
            }
            if self.corrupt_gt_entry && gt_index == 0 {
                entries[0] = gt_marker_sector as u32;
            }
            let mut raw = Vec::with_capacity(entries.len() * 4);
            for entry in entries {
                raw.extend_from_slice(&entry.to_le_bytes());
            }
            pad_to_sector(&mut raw);
            next_sector += (raw.len() / SECTOR) as u64;
            body.extend_from_slice(&raw);
        }

        // Grain directory.
        let gd_data_sectors = (num_gts * 4).div_ceil(SECTOR_SIZE).max(1);
        body.extend_from_slice(&metadata_marker(gd_data_sectors, MARKER_GD));
        next_sector += 1;
        let gd_data_sector = next_sector;
        let mut raw = Vec::with_capacity(gd_entries.len() * 4);
        for entry in &gd_entries {
            raw.extend_from_slice(&entry.to_le_bytes());
        }
        raw.resize((gd_data_sectors * SECTOR_SIZE) as usize, 0);
        body.extend_from_slice(&raw);

        // Footer marker, footer header copy, end-of-stream marker.
        body.extend_from_slice(&metadata_marker(1, MARKER_FOOTER));
        body.extend_from_slice(&self.header_sector(gd_data_sector));
        body.extend_from_slice(&[0u8; SECTOR]);

        let mut image = Vec::new();
        image.extend_from_slice(&self.header_sector(u64::MAX));
        let mut descriptor_sector = descriptor.into_bytes();
        descriptor_sector.resize(SECTOR, 0);
        image.extend_from_slice(&descriptor_sector);
        image.extend_from_slice(&body);
        image
    }
}

/// Builds a GPT device: protective (or blank) MBR, header at LBA 1 and a
/// standard 128-slot entry array at LBA 2.
pub struct GptImageBuilder {
    /// `(type_guid, starting_lba, ending_lba, name)` per slot.
    entries: Vec<(String, u64, u64, String)>,
    entry_size: u32,
    protective: bool,
}

impl GptImageBuilder {
    pub fn new() -> GptImageBuilder {
        GptImageBuilder {
            entries: Vec::new(),
            entry_size: 128,
            protective: false,
        }
    }

    pub fn entry(
        mut self,
        type_guid: &str,
        starting_lba: u64,
        ending_lba: u64,
        name: &str,
    ) -> GptImageBuilder {
        self.entries
            .push((type_guid.to_string(), starting_lba, ending_lba, name.to_string()));
        self
    }

    pub fn entry_size(mut self, entry_size: u32) -> GptImageBuilder {
        self.entry_size = entry_size;
        self
    }

    pub fn protective_mbr(mut self) -> GptImageBuilder {
        self.protective = true;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let total_sectors = 2 + 32 + 6;
        let mut image = vec![0u8; total_sectors * SECTOR];

        // LBA 0: MBR with a zero unique disk signature.
        if self.protective {
            image[446 + 4] = 0xEE;
            image[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
            image[446 + 12..446 + 16]
                .copy_from_slice(&((total_sectors as u32) - 1).to_le_bytes());
        }
        image[510] = 0x55;
        image[511] = 0xaa;

        // LBA 1: header.
        let header = &mut image[SECTOR..2 * SECTOR];
        header[0..8].copy_from_slice(b"EFI PART");
        header[8..12].copy_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        header[12..16].copy_from_slice(&92u32.to_le_bytes());
        header[24..32].copy_from_slice(&1u64.to_le_bytes()); // my LBA
        header[32..40].copy_from_slice(&(total_sectors as u64 - 1).to_le_bytes());
        header[40..48].copy_from_slice(&34u64.to_le_bytes()); // first usable
        header[48..56].copy_from_slice(&(total_sectors as u64 - 2).to_le_bytes());
        header[56..72].copy_from_slice(&guid_from_str("11111111-2222-3333-4455-666677778888").0);
        header[72..80].copy_from_slice(&2u64.to_le_bytes()); // entry array LBA
        header[80..84].copy_from_slice(&128u32.to_le_bytes());
        header[84..88].copy_from_slice(&self.entry_size.to_le_bytes());

        // LBA 2..34: entry array.
        for (slot, (type_guid, starting_lba, ending_lba, name)) in
            self.entries.iter().enumerate()
        {
            let base = 2 * SECTOR + slot * 128;
            let entry = &mut image[base..base + 128];
            entry[0..16].copy_from_slice(&guid_from_str(type_guid).0);
            entry[16..32]
                .copy_from_slice(&guid_from_str("AAAAAAAA-BBBB-CCCC-DDDD-EEEEFFFF0000").0);
            entry[32..40].copy_from_slice(&starting_lba.to_le_bytes());
            entry[40..48].copy_from_slice(&ending_lba.to_le_bytes());
            for (i, unit) in name.encode_utf16().take(36).enumerate() {
                entry[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
            }
        }

        image
    }
}
