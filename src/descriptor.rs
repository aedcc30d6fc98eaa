//! Embedded VMDK descriptor parsing.
//!
//! Every sparse extent file embeds a small ASCII descriptor split into
//! sections announced by comment lines (`# Disk DescriptorFile`,
//! `# Extent description`, `# The Disk Data Base`). The header section
//! carries `key=value` pairs, the extent section one whitespace-separated
//! record per extent, and the disk data base is not interpreted.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// The only create type the stream-optimized reader accepts.
pub const CREATE_TYPE_STREAM_OPTIMIZED: &str = "streamOptimized";

const SECTION_DISK_DESCRIPTOR_FILE: &str = "disk descriptorfile";
const SECTION_EXTENT_DESCRIPTION: &str = "extent description";
const SECTION_DISK_DATA_BASE: &str = "the disk data base";
const SECTION_DDB: &str = "ddb";

/// Parsed form of the embedded descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    /// Descriptor format version, in practice always 1.
    pub version: i64,
    /// Content identifier, an 8-hex-digit string randomised on write.
    pub cid: String,
    /// Parent content identifier; `ffffffff` means no parent.
    pub parent_cid: String,
    /// The disk create type, e.g. `streamOptimized` or `monolithicSparse`.
    pub create_type: String,
    /// Extent records in declaration order.
    pub extents: Vec<ExtentDescription>,
}

/// One line of the extent description section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtentDescription {
    /// Access mode for the extent.
    pub mode: ExtentAccessMode,
    /// Number of sectors covered by the extent.
    pub size: i64,
    /// The extent data format.
    pub extent_type: ExtentType,
    /// File name of the extent, quotes stripped.
    pub name: String,
}

/// Access mode token of an extent line.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtentAccessMode {
    NoAccess,
    RdOnly,
    Rw,
}

/// Extent data format token.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExtentType {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    Header,
    Extent,
    DiskDataBase,
}

/// Maps a section divider comment onto its section, if it is one.
fn descriptor_section(line: &str) -> Option<Section> {
    let stripped = line.strip_prefix('#')?;
    match stripped.trim().to_lowercase().as_str() {
        SECTION_DISK_DESCRIPTOR_FILE => Some(Section::Header),
        SECTION_EXTENT_DESCRIPTION => Some(Section::Extent),
        SECTION_DISK_DATA_BASE | SECTION_DDB => Some(Section::DiskDataBase),
        _ => None,
    }
}

/// Parses a `key = "value"` pair, tolerating unquoted values.
fn parse_key_value_pair(line: &str) -> Option<(&str, &str)> {
    // LazyLock so the regex compiles once; required for a static.
    static KEY_VALUE_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^([\w\.]+)\s*=\s*"?([^"]*)"?$"#).unwrap());
    let captures = KEY_VALUE_REGEX.captures(line)?;
    Some((
        captures.get(1).unwrap().as_str(),
        captures.get(2).unwrap().as_str(),
    ))
}

/// Deserialises an extent token (`RW`, `SPARSE`, ...) into its enum.
fn parse_token<T: DeserializeOwned>(token: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(token.to_string())).ok()
}

/// Parses an integer with auto-detected base, accepting `0x`/`0o`/`0b`
/// prefixes and a leading sign.
fn parse_prefixed_i64(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, digits) = if let Some(hex) = digits.strip_prefix("0x").or(digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if let Some(oct) = digits.strip_prefix("0o").or(digits.strip_prefix("0O")) {
        (8, oct)
    } else if let Some(bin) = digits.strip_prefix("0b").or(digits.strip_prefix("0B")) {
        (2, bin)
    } else {
        (10, digits)
    };
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

impl FromStr for ExtentDescription {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Error::InvalidDescriptor(s.to_string()));
        }
        Ok(ExtentDescription {
            mode: parse_token(fields[0]).ok_or_else(|| Error::InvalidDescriptor(s.to_string()))?,
            size: parse_prefixed_i64(fields[1])
                .ok_or_else(|| Error::InvalidDescriptor(s.to_string()))?,
            extent_type: parse_token(fields[2])
                .ok_or_else(|| Error::InvalidDescriptor(s.to_string()))?,
            name: fields[3..].join(" ").trim_matches('"').to_string(),
        })
    }
}

impl DiskDescriptor {
    fn parse_header_line(&mut self, line: &str) -> Result<()> {
        let Some((key, value)) = parse_key_value_pair(line) else {
            // Header lines that are not key/value pairs are tolerated.
            return Ok(());
        };
        match key {
            "version" => {
                self.version = value
                    .parse()
                    .map_err(|_| Error::InvalidDescriptor(line.to_string()))?;
            }
            "CID" => self.cid = value.to_string(),
            "parentCID" => self.parent_cid = value.to_string(),
            "createType" => self.create_type = value.to_string(),
            // Unknown keys (encoding, isNativeSnapshot, ...) are ignored.
            _ => {}
        }
        Ok(())
    }
}

impl FromStr for DiskDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut descriptor = DiskDescriptor::default();
        let mut section = Section::None;
        for raw_line in s.lines() {
            let line = raw_line.trim_matches('\0').trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('#') {
                if let Some(next) = descriptor_section(line) {
                    section = next;
                }
                // Other comment lines are skipped.
                continue;
            }
            match section {
                Section::None => return Err(Error::InvalidDescriptor(line.to_string())),
                Section::Header => descriptor.parse_header_line(line)?,
                Section::Extent => descriptor.extents.push(line.parse()?),
                // Not interpreted.
                Section::DiskDataBase => {}
            }
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_optimized_descriptor() {
        // Shape produced by:
        // qemu-img create -f vmdk X.img -o subformat=streamOptimized 65536
        let descriptor_data = r#"# Disk DescriptorFile
version=1
CID=8bc8c866
parentCID=ffffffff
createType="streamOptimized"

# Extent description
RW 128 SPARSE "vmdk-streamoptimized.img"

# The Disk Data Base
#DDB

ddb.virtualHWVersion = "4"
ddb.geometry.cylinders = "16383"
ddb.adapterType = "ide"
"#;

        let descriptor: DiskDescriptor = descriptor_data.parse().unwrap();
        assert_eq!(descriptor.version, 1);
        assert_eq!(descriptor.cid, "8bc8c866");
        assert_eq!(descriptor.parent_cid, "ffffffff");
        assert_eq!(descriptor.create_type, "streamOptimized");
        assert_eq!(
            descriptor.extents,
            vec![ExtentDescription {
                mode: ExtentAccessMode::Rw,
                size: 128,
                extent_type: ExtentType::Sparse,
                name: "vmdk-streamoptimized.img".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_monolithic_descriptor() {
        let descriptor_data = r#"# Disk DescriptorFile
version=1
CID=ba26f75f
parentCID=ffffffff
createType="monolithicSparse"

# Extent description
RW 128 SPARSE "vmdk-monolith.img"
"#;
        let descriptor: DiskDescriptor = descriptor_data.parse().unwrap();
        assert_eq!(descriptor.create_type, "monolithicSparse");
        assert_eq!(descriptor.extents.len(), 1);
    }

    #[test]
    fn test_payload_before_section_is_invalid() {
        let err = "version=1\n".parse::<DiskDescriptor>().unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
        assert_eq!(err.to_string(), "invalid descriptor");
    }

    #[test]
    fn test_section_names_case_insensitive_and_ddb_alias() {
        let descriptor_data = "# disk descriptorfile\nversion=1\n# DDB\nddb.uuid = \"x\"\n";
        let descriptor: DiskDescriptor = descriptor_data.parse().unwrap();
        assert_eq!(descriptor.version, 1);
    }

    #[test]
    fn test_extent_line_hex_size_and_spaced_name() {
        let extent: ExtentDescription = "RW 0x80 SPARSE \"disk image.img\"".parse().unwrap();
        assert_eq!(extent.size, 128);
        assert_eq!(extent.name, "disk image.img");
    }

    #[test]
    fn test_malformed_extent_line() {
        let err = "RW 128 SPARSE".parse::<ExtentDescription>().unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
        let err = "RW lots SPARSE \"x.img\""
            .parse::<ExtentDescription>()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
    }

    #[test]
    fn test_comment_lines_inside_sections_are_skipped() {
        let descriptor_data = "# Disk DescriptorFile\n# a comment\nversion=1\n\
                               # Extent description\n# another\nRW 128 SPARSE \"x.img\"\n";
        let descriptor: DiskDescriptor = descriptor_data.parse().unwrap();
        assert_eq!(descriptor.extents.len(), 1);
    }

    #[test]
    fn test_parse_key_value_pair() {
        assert_eq!(parse_key_value_pair("CID=8bc8c866"), Some(("CID", "8bc8c866")));
        assert_eq!(
            parse_key_value_pair("createType=\"streamOptimized\""),
            Some(("createType", "streamOptimized"))
        );
        assert_eq!(
            parse_key_value_pair("ddb.geometry.heads = \"16\""),
            Some(("ddb.geometry.heads", "16"))
        );
        assert_eq!(parse_key_value_pair("not a pair"), None);
    }
}
