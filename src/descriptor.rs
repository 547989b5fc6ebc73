//! Embedded disk descriptor: the text block written inside the extent
//! header region, and a parser for inspecting it.
//!
//! The emitter produces the fixed stream-optimized template; the parser
//! understands enough of the descriptor grammar (sectioned key-value lines
//! plus extent lines) to report disk metadata for files produced by other
//! tools as well.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DiskError, Result};

const DESCRIPTOR_SIGNATURE: &str = "# Disk DescriptorFile";
const EXTENT_SECTION_SIGNATURE: &str = "# Extent description";
const DISK_DATABASE_SECTION_SIGNATURE: &str = "# The Disk Data Base";

/// Draws a content identifier. `0xFFFFFFFF` and `0xFFFFFFFE` are rejected
/// because some software interprets them as "no parent" or "disk full of
/// zeroes".
pub fn generate_cid() -> u32 {
    loop {
        let cid = rand::random::<u32>();
        if cid != 0xFFFF_FFFF && cid != 0xFFFF_FFFE {
            return cid;
        }
    }
}

/// Renders the embedded descriptor for a stream-optimized extent.
///
/// `capacity` is in sectors; `file_name` is the extent's own name (the
/// monolithic descriptor references the file it lives in). The geometry
/// lines use 255 heads and 63 sectors per track, which suits any disk
/// over 4 GB, with the cylinder count capped at 65535.
pub fn emit(file_name: &str, capacity: u64, cid: u32, tools_version: &str) -> String {
    let cylinders = if capacity > 65535 * 255 * 63 {
        65535
    } else {
        crate::sector::ceiling(capacity, 255 * 63)
    };
    let content_id: u32 = rand::random();
    let content_id2: u32 = rand::random();
    let content_id3: u32 = rand::random();
    format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         encoding=\"UTF-8\"\n\
         CID={cid:08x}\n\
         parentCID=ffffffff\n\
         createType=\"streamOptimized\"\n\
         \n\
         # Extent description\n\
         RW {capacity} SPARSE \"{file_name}\"\n\
         \n\
         # The Disk Data Base\n\
         #DDB\n\
         \n\
         ddb.longContentID = \"{content_id:08x}{content_id2:08x}{content_id3:08x}{cid:08x}\"\n\
         ddb.virtualHWVersion = \"4\"\n\
         ddb.geometry.cylinders = \"{cylinders}\"\n\
         ddb.geometry.heads = \"255\"\n\
         ddb.geometry.sectors = \"63\"\n\
         ddb.adapterType = \"lsilogic\"\n\
         ddb.toolsInstallType = \"4\"\n\
         ddb.toolsVersion = \"{tools_version}\""
    )
}

/// Disk types a descriptor can declare. Only the monolithic kinds can
/// show up in an embedded descriptor, but foreign descriptor files name
/// the split kinds too.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub enum DiskType {
    #[serde(rename = "2GbMaxExtentFlat", alias = "twoGbMaxExtentFlat")]
    TwoGbMaxExtentFlat,
    #[serde(rename = "2GbMaxExtentSparse", alias = "twoGbMaxExtentSparse")]
    TwoGbMaxExtentSparse,
    Custom,
    MonolithicFlat,
    MonolithicSparse,
    StreamOptimized,
    Vmfs,
}

/// Access mode of one extent line.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccessMode {
    NoAccess,
    RdOnly,
    Rw,
}

/// One `RW <sectors> SPARSE "<file>"` extent line.
#[derive(Debug, Clone, Serialize)]
pub struct ExtentLine {
    pub access: AccessMode,
    pub sectors: u64,
    pub extent_type: String,
    pub file_name: Option<String>,
}

impl FromStr for ExtentLine {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        static EXTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r#"^(\w+)\s+(\d+)\s+(\w+)(?:\s+"([^"]*)")?(?:\s+(\d+))?$"#).unwrap()
        });
        let captures = EXTENT_REGEX
            .captures(s)
            .ok_or_else(|| DiskError::Format(format!("invalid extent line: {s}")))?;
        let access_str = serde_json::Value::String(captures.get(1).unwrap().as_str().to_string());
        Ok(ExtentLine {
            access: serde_json::from_value(access_str).map_err(|_| {
                DiskError::Format(format!(
                    "invalid extent access mode: {}",
                    captures.get(1).unwrap().as_str()
                ))
            })?,
            sectors: captures
                .get(2)
                .unwrap()
                .as_str()
                .parse()
                .map_err(|_| DiskError::Format(format!("invalid extent size in: {s}")))?,
            extent_type: captures.get(3).unwrap().as_str().to_string(),
            file_name: captures.get(4).map(|m| m.as_str().to_string()),
        })
    }
}

/// Parsed descriptor content, trimmed to the fields this tool reports.
#[derive(Debug, Clone, Serialize)]
pub struct DescriptorInfo {
    pub version: u32,
    pub cid: u32,
    pub parent_cid: u32,
    pub create_type: DiskType,
    pub extents: Vec<ExtentLine>,
    pub tools_version: Option<String>,
    pub long_content_id: Option<String>,
    pub adapter_type: Option<String>,
}

impl DescriptorInfo {
    /// Total capacity declared by the extent lines, in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.sectors).sum()
    }
}

fn descriptor_section(line: &str) -> Option<&'static str> {
    match line {
        DESCRIPTOR_SIGNATURE => Some("header"),
        EXTENT_SECTION_SIGNATURE => Some("extent"),
        DISK_DATABASE_SECTION_SIGNATURE => Some("ddb"),
        _ => None,
    }
}

fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    static KEY_VALUE_REGEX: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r#"^([\w\.]+)\s*=\s*"?([^"]*)"?$"#).unwrap());
    KEY_VALUE_REGEX.captures(line).map(|captures| {
        (
            captures.get(1).unwrap().as_str(),
            captures.get(2).unwrap().as_str(),
        )
    })
}

impl FromStr for DescriptorInfo {
    type Err = DiskError;

    fn from_str(s: &str) -> Result<Self> {
        let mut section = "";
        let mut header = HashMap::new();
        let mut ddb = HashMap::new();
        let mut extents = Vec::new();
        for line in s.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                section = descriptor_section(line).unwrap_or(section);
            } else if line.is_empty() {
                continue;
            } else {
                match section {
                    "header" => {
                        if let Some((key, value)) = parse_key_value(line) {
                            header.insert(key.to_string(), value.to_string());
                        }
                    }
                    "extent" => {
                        if let Ok(extent) = line.parse() {
                            extents.push(extent);
                        }
                    }
                    "ddb" => {
                        if let Some((key, value)) = parse_key_value(line) {
                            ddb.insert(key.to_string(), value.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        let version = header
            .get("version")
            .ok_or_else(|| DiskError::Format("descriptor has no version".into()))?
            .parse()
            .map_err(|_| DiskError::Format("invalid descriptor version".into()))?;
        let cid = u32::from_str_radix(
            header
                .get("CID")
                .ok_or_else(|| DiskError::Format("descriptor has no CID".into()))?,
            16,
        )
        .map_err(|_| DiskError::Format("invalid descriptor CID".into()))?;
        let parent_cid = u32::from_str_radix(
            header
                .get("parentCID")
                .ok_or_else(|| DiskError::Format("descriptor has no parentCID".into()))?,
            16,
        )
        .map_err(|_| DiskError::Format("invalid descriptor parentCID".into()))?;
        let create_type_str = serde_json::Value::String(
            header
                .get("createType")
                .ok_or_else(|| DiskError::Format("descriptor has no createType".into()))?
                .to_string(),
        );
        let create_type = serde_json::from_value(create_type_str)
            .map_err(|_| DiskError::Format("unknown descriptor createType".into()))?;

        Ok(DescriptorInfo {
            version,
            cid,
            parent_cid,
            create_type,
            extents,
            tools_version: ddb.get("ddb.toolsVersion").cloned(),
            long_content_id: ddb.get("ddb.longContentID").cloned(),
            adapter_type: ddb.get("ddb.adapterType").cloned(),
        })
    }
}
