// SPDX-License-Identifier: GPL-3.0-only

//! Per-kind device name validation.

use once_cell::sync::Lazy;
use regex::Regex;

static LVM_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_+.-]+$").expect("static regex")
});

/// Prefixes lvm reserves for its own volumes.
const LVM_RESERVED_PREFIXES: [&str; 2] = ["pvmove", "snapshot"];

/// Substrings lvm reserves for internal LV names.
const LVM_RESERVED_SUBSTRINGS: [&str; 10] = [
    "_cdata", "_cmeta", "_mimage", "_mlog", "_pmspare", "_rimage", "_rmeta", "_tdata", "_tmeta",
    "_vorigin",
];

/// Whether `name` is acceptable for an LVM VG or (non-internal) LV.
pub fn is_lvm_name_valid(name: &str) -> bool {
    if !LVM_NAME.is_match(name) {
        return false;
    }
    if LVM_RESERVED_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        return false;
    }
    !LVM_RESERVED_SUBSTRINGS
        .iter()
        .any(|substring| name.contains(substring))
}

/// btrfs accepts almost anything as a volume or subvolume name.
pub fn is_btrfs_name_valid(name: &str) -> bool {
    !name.is_empty() && !name.contains('\0') && name != "." && name != ".."
}

/// Generic device-node name: a single path component.
pub fn is_device_name_valid(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('\0')
        && !name.contains('/')
        && name != "."
        && name != ".."
}

/// File-backed devices are named by absolute paths.
pub fn is_path_name_valid(name: &str) -> bool {
    if !name.starts_with('/') || name.contains('\0') {
        return false;
    }
    name.split('/')
        .all(|component| component != "." && component != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_lvm_names() {
        for name in ["vg0", "data", "a-b", "a.b", "x_y+z", "0"] {
            assert!(is_lvm_name_valid(name), "{name}");
        }
    }

    #[test]
    fn rejects_reserved_lvm_names() {
        for name in [
            "pvmove0",
            "snapshot1",
            "data_cdata",
            "x_cmeta",
            "lv_mimage_0",
            "lv_mlog",
            "lv_pmspare",
            "lv_rimage_1",
            "lv_rmeta_1",
            "lv_tdata",
            "lv_tmeta",
            "lv_vorigin",
        ] {
            assert!(!is_lvm_name_valid(name), "{name}");
        }
    }

    #[test]
    fn rejects_lvm_names_with_bad_characters() {
        for name in ["", "a b", "a/b", "a:b", "naïve"] {
            assert!(!is_lvm_name_valid(name), "{name:?}");
        }
    }

    #[test]
    fn btrfs_names_are_permissive() {
        assert!(is_btrfs_name_valid("a volume with spaces"));
        assert!(is_btrfs_name_valid("näme"));
        assert!(!is_btrfs_name_valid(""));
        assert!(!is_btrfs_name_valid("."));
        assert!(!is_btrfs_name_valid(".."));
    }

    #[test]
    fn path_names_must_be_absolute_and_clean() {
        assert!(is_path_name_valid("/var/lib/swapfile"));
        assert!(!is_path_name_valid("swapfile"));
        assert!(!is_path_name_valid("/var/../swap"));
        assert!(!is_path_name_valid("/var/./swap"));
    }

    #[test]
    fn device_names_are_single_components() {
        assert!(is_device_name_valid("sda"));
        assert!(is_device_name_valid("md127"));
        assert!(!is_device_name_valid("dev/sda"));
        assert!(!is_device_name_valid(""));
        assert!(!is_device_name_valid("."));
    }
}
