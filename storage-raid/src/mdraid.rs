// SPDX-License-Identifier: GPL-3.0-only

//! md (Linux software RAID) metadata rules.

use storage_units::Size;
use uuid::Uuid;

use crate::level::RaidError;

/// Space mdadm reserves per member for 0.9/1.0 metadata.
pub const MD_SUPERBLOCK_SIZE: Size = Size::mib(2);

/// Default chunk size for new arrays.
pub const MD_CHUNK_SIZE: Size = Size::kib(512);

/// Superblock reservation for a member of an array of the given size.
///
/// Metadata 0.9 and 1.0 reserve a fixed 2 MiB. The default 1.1/1.2 formats
/// additionally leave headroom for reshape operations: the largest power of
/// two no bigger than 128 MiB for which `headroom * 1024 <= size`, bounded
/// below at 1 MiB.
pub fn md_superblock_size(size: Size, metadata_version: Option<&str>) -> Size {
    match metadata_version {
        None | Some("default") | Some("1.1") | Some("1.2") => {
            let mut headroom = Size::mib(128);
            while headroom * 1024 > size && headroom > Size::mib(1) {
                headroom = headroom / 2;
            }
            headroom
        }
        _ => MD_SUPERBLOCK_SIZE,
    }
}

fn strip_and_check_hex(uuid: &str) -> Result<String, RaidError> {
    let stripped: String = uuid.chars().filter(|c| *c != '-' && *c != ':').collect();
    if stripped.len() != 32 {
        return Err(RaidError::InvalidUuid(format!(
            "UUID {uuid:?} does not contain 32 hex digits"
        )));
    }
    if !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RaidError::InvalidUuid(format!(
            "UUID {uuid:?} contains non-hex characters"
        )));
    }
    Ok(stripped.to_ascii_lowercase())
}

/// Convert a canonical RFC-4122 UUID to mdadm's colon-grouped form.
///
/// `"3386ff85-f501-2621-4a43-5f061eb47236"` becomes
/// `"3386ff85:f5012621:4a435f06:1eb47236"`.
pub fn mduuid_from_canonical(uuid: &str) -> Result<String, RaidError> {
    let hex = strip_and_check_hex(uuid)?;
    let groups: Vec<&str> = (0..4).map(|i| &hex[i * 8..(i + 1) * 8]).collect();
    Ok(groups.join(":"))
}

/// Convert an mdadm UUID (or an already-canonical/bare 32-digit hex string)
/// to canonical form. Canonicalizing a canonical UUID is the identity.
pub fn canonical_from_mduuid(uuid: &str) -> Result<String, RaidError> {
    let hex = strip_and_check_hex(uuid)?;
    let dashed = format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    );
    // normalize through the uuid crate so the output is always a valid
    // canonical rendition
    let parsed = Uuid::parse_str(&dashed)
        .map_err(|e| RaidError::InvalidUuid(format!("UUID {uuid:?}: {e}")))?;
    Ok(parsed.hyphenated().to_string())
}
