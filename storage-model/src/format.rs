// SPDX-License-Identifier: GPL-3.0-only

//! Formatting records attached to devices.
//!
//! Every device carries exactly one [`Format`]; "no formatting" is the
//! [`FormatKind::None`] variant rather than an absent record. The kind
//! payload holds the attributes that bind a member to its aggregate
//! (lvm-pv, md-member, btrfs-member UUID cross-references) or describe a
//! filesystem.

use serde::{Deserialize, Serialize};
use storage_units::Size;

/// Partition-table flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisklabelType {
    Gpt,
    Msdos,
    Dasd,
    Mac,
}

/// The kind tag and kind-specific attributes of a format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatKind {
    None,
    PartitionTable {
        label: DisklabelType,
    },
    LvmPv {
        /// Offset of the first physical extent.
        pe_start: Size,
        vg_name: Option<String>,
        vg_uuid: Option<String>,
        /// Free space accountant, maintained by the owning VG.
        free: Option<Size>,
    },
    MdMember {
        md_uuid: Option<String>,
    },
    BtrfsMember {
        vol_uuid: Option<String>,
    },
    /// The filesystem of a btrfs volume itself.
    Btrfs,
    Luks {
        cipher: String,
        key_size: u32,
        version: u8,
    },
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Swap,
    BiosBoot,
    PrepBoot,
    Efi,
}

/// Default offset of the first physical extent on a PV.
pub const LVM_PE_START: Size = Size::mib(1);

/// Space the LUKS header occupies at the front of the device.
pub const LUKS_METADATA_SIZE: Size = Size::mib(2);

impl FormatKind {
    /// Short name of the kind, e.g. "ext4" or "mdmember".
    pub fn name(&self) -> &'static str {
        match self {
            FormatKind::None => "none",
            FormatKind::PartitionTable { .. } => "disklabel",
            FormatKind::LvmPv { .. } => "lvmpv",
            FormatKind::MdMember { .. } => "mdmember",
            FormatKind::BtrfsMember { .. } => "btrfsmember",
            FormatKind::Btrfs => "btrfs",
            FormatKind::Luks { .. } => "luks",
            FormatKind::Ext2 => "ext2",
            FormatKind::Ext3 => "ext3",
            FormatKind::Ext4 => "ext4",
            FormatKind::Xfs => "xfs",
            FormatKind::Swap => "swap",
            FormatKind::BiosBoot => "biosboot",
            FormatKind::PrepBoot => "prepboot",
            FormatKind::Efi => "efi",
        }
    }

    /// Whether this kind holds a mountable filesystem.
    pub fn mountable(&self) -> bool {
        matches!(
            self,
            FormatKind::Btrfs
                | FormatKind::Ext2
                | FormatKind::Ext3
                | FormatKind::Ext4
                | FormatKind::Xfs
                | FormatKind::Efi
        )
    }

    /// Construct a plain lvm-pv member format with the default extent start.
    pub fn lvm_pv() -> FormatKind {
        FormatKind::LvmPv {
            pe_start: LVM_PE_START,
            vg_name: None,
            vg_uuid: None,
            free: None,
        }
    }

    pub fn md_member() -> FormatKind {
        FormatKind::MdMember { md_uuid: None }
    }

    pub fn btrfs_member() -> FormatKind {
        FormatKind::BtrfsMember { vol_uuid: None }
    }

    pub fn luks() -> FormatKind {
        FormatKind::Luks {
            cipher: "aes-xts-plain64".to_string(),
            key_size: 512,
            version: 2,
        }
    }

    /// Advisory (min, max) device-size bounds for a new format of this
    /// kind; `Size::ZERO` means unbounded.
    fn default_bounds(&self) -> (Size, Size) {
        match self {
            FormatKind::Ext2 | FormatKind::Ext3 | FormatKind::Ext4 => {
                (Size::mib(8), Size::tib(16))
            }
            FormatKind::Xfs => (Size::mib(16), Size::from_bytes(1 << 60)),
            FormatKind::Swap => (Size::kib(40), Size::tib(16)),
            FormatKind::Efi => (Size::mib(32), Size::ZERO),
            FormatKind::BiosBoot => (Size::kib(512), Size::mib(2)),
            FormatKind::PrepBoot => (Size::from_bytes(4096), Size::mib(10)),
            FormatKind::Luks { .. } => (LUKS_METADATA_SIZE, Size::ZERO),
            FormatKind::Btrfs => (Size::mib(256), Size::ZERO),
            _ => (Size::ZERO, Size::ZERO),
        }
    }

    /// Whether the format can be resized in place once it exists.
    fn default_resizable(&self) -> bool {
        matches!(
            self,
            FormatKind::Ext2
                | FormatKind::Ext3
                | FormatKind::Ext4
                | FormatKind::Xfs
                | FormatKind::Btrfs
                | FormatKind::Luks { .. }
        )
    }
}

/// A formatting record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub kind: FormatKind,
    /// Does this formatting exist on disk?
    pub exists: bool,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub mountpoint: Option<String>,
    /// Effective mount options, including automatically managed ones.
    pub options: Vec<String>,
    /// The options the caller asked for, verbatim.
    pub user_options: Vec<String>,
    pub resizable: bool,
    /// An immutable format cannot be replaced while it exists on disk.
    pub immutable: bool,
    pub min_size: Size,
    pub max_size: Size,
}

impl Format {
    pub fn new(kind: FormatKind) -> Format {
        let (min_size, max_size) = kind.default_bounds();
        let resizable = kind.default_resizable();
        Format {
            kind,
            exists: false,
            uuid: None,
            label: None,
            mountpoint: None,
            options: Vec::new(),
            user_options: Vec::new(),
            resizable,
            immutable: false,
            min_size,
            max_size,
        }
    }

    pub fn none() -> Format {
        Format::new(FormatKind::None)
    }

    pub fn existing(kind: FormatKind) -> Format {
        let mut format = Format::new(kind);
        format.exists = true;
        format
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<String>) -> Format {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Format {
        self.label = Some(label.into());
        self
    }

    /// Set the caller-requested mount options from a comma-joined string.
    pub fn with_options(mut self, options: &str) -> Format {
        let parsed: Vec<String> = options
            .split(',')
            .filter(|option| !option.is_empty())
            .map(str::to_string)
            .collect();
        self.user_options = parsed.clone();
        self.options = parsed;
        self
    }

    /// The effective mount options, comma-joined.
    pub fn options_string(&self) -> String {
        self.options.join(",")
    }

    pub fn is_none(&self) -> bool {
        matches!(self.kind, FormatKind::None)
    }

    /// The UUID the member format binds to its aggregate, if any.
    pub fn container_uuid(&self) -> Option<&str> {
        match &self.kind {
            FormatKind::LvmPv { vg_uuid, .. } => vg_uuid.as_deref(),
            FormatKind::MdMember { md_uuid } => md_uuid.as_deref(),
            FormatKind::BtrfsMember { vol_uuid } => vol_uuid.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn set_container_uuid(&mut self, uuid: Option<String>) {
        match &mut self.kind {
            FormatKind::LvmPv { vg_uuid, .. } => *vg_uuid = uuid,
            FormatKind::MdMember { md_uuid } => *md_uuid = uuid,
            FormatKind::BtrfsMember { vol_uuid } => *vol_uuid = uuid,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_formats_get_kind_defaults() {
        let ext4 = Format::new(FormatKind::Ext4);
        assert!(ext4.resizable);
        assert!(!ext4.immutable);
        assert_eq!(ext4.min_size, Size::mib(8));
        assert_eq!(ext4.max_size, Size::tib(16));

        let pv = Format::new(FormatKind::lvm_pv());
        assert!(!pv.resizable);

        let swap = Format::new(FormatKind::Swap);
        assert!(!swap.resizable);
    }

    #[test]
    fn options_round_trip_through_comma_join() {
        let format = Format::new(FormatKind::Ext4).with_options("noatime,discard");
        assert_eq!(format.options_string(), "noatime,discard");
        assert_eq!(format.user_options, vec!["noatime", "discard"]);
    }

    #[test]
    fn container_uuid_reaches_member_kinds() {
        let mut format = Format::new(FormatKind::md_member());
        assert_eq!(format.container_uuid(), None);
        format.set_container_uuid(Some("abcd".into()));
        assert_eq!(format.container_uuid(), Some("abcd"));

        let mut plain = Format::new(FormatKind::Ext4);
        plain.set_container_uuid(Some("abcd".into()));
        assert_eq!(plain.container_uuid(), None);
    }
}
