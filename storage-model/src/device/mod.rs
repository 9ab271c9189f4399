// SPDX-License-Identifier: GPL-3.0-only

//! Device entities.
//!
//! A [`Device`] is common bookkeeping ([`DeviceCommon`]) plus a
//! [`DeviceKind`] payload. Devices reference each other only by
//! [`DeviceId`]; the edges themselves are owned by the
//! [`crate::tree::DeviceTree`].

pub mod kind;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use storage_units::Size;

use crate::format::Format;

pub use kind::{
    BTRFS_MAIN_VOLUME_ID, BTRFS_MIN_MEMBER_SIZE, BtrfsSubvolumeData, BtrfsVolumeData, CacheType,
    DeviceKind, DiskData, FileData, InternalLv, InternalLvKind, LVM_PE_SIZE, LvData, LvPvSpec,
    LvSegment, LvmCache, LvmCacheRequest, MdArrayData, PartType, PartitionData, ThPoolReserve,
    VgData,
};

/// Stable identity of a device within a tree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Planned,
    Created,
    Active,
    Inactive,
    Destroyed,
}

/// Tags that describe classes of device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tag {
    Local,
    Nvdimm,
    Remote,
    Removable,
    Ssd,
    Usb,
}

/// State shared by every device kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommon {
    pub id: DeviceId,
    pub name: String,
    /// Devices this one is built atop; ordered, no duplicates.
    pub(crate) parents: Vec<DeviceId>,
    /// Devices built atop this one.
    pub(crate) children: Vec<DeviceId>,
    pub tags: BTreeSet<Tag>,
    /// Does this device exist on disk?
    pub exists: bool,
    pub state: DeviceState,
    pub sysfs_path: Option<String>,
    pub size: Size,
    pub uuid: Option<String>,
    pub format: Format,
    /// Snapshot of the formatting found on disk, restorable on revocation.
    pub original_format: Format,
}

/// A storage entity: common bookkeeping plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub common: DeviceCommon,
    pub kind: DeviceKind,
}

impl Device {
    pub(crate) fn new(id: DeviceId, name: String, size: Size, exists: bool, kind: DeviceKind) -> Device {
        let state = if exists {
            DeviceState::Created
        } else {
            DeviceState::Planned
        };
        Device {
            common: DeviceCommon {
                id,
                name,
                parents: Vec::new(),
                children: Vec::new(),
                tags: BTreeSet::new(),
                exists,
                state,
                sysfs_path: None,
                size,
                uuid: None,
                format: Format::none(),
                original_format: Format::none(),
            },
            kind,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.common.id
    }

    pub fn name(&self) -> &str {
        &self.common.name
    }

    pub fn parents(&self) -> &[DeviceId] {
        &self.common.parents
    }

    pub fn children(&self) -> &[DeviceId] {
        &self.common.children
    }

    pub fn is_leaf(&self) -> bool {
        self.common.children.is_empty()
    }

    /// Is the device active (open and ready for use)?
    pub fn status(&self) -> bool {
        self.common.state == DeviceState::Active
    }

    pub fn exists(&self) -> bool {
        self.common.exists
    }

    pub fn size(&self) -> Size {
        self.common.size
    }

    pub fn format(&self) -> &Format {
        &self.common.format
    }

    /// Path of the device node this device would appear as.
    pub fn path(&self) -> String {
        match &self.kind {
            DeviceKind::File(data) => data.path.clone(),
            DeviceKind::Directory => self.common.name.clone(),
            DeviceKind::NoDevice => self.common.name.clone(),
            DeviceKind::MdArray(_) => format!("/dev/md/{}", self.common.name),
            DeviceKind::LvmVolumeGroup(_) => format!("/dev/{}", map_name(&self.common.name)),
            DeviceKind::LvmLogicalVolume(_) => format!("/dev/mapper/{}", self.common.name),
            DeviceKind::Luks | DeviceKind::DmLinear | DeviceKind::DmCrypt => {
                format!("/dev/mapper/{}", self.common.name)
            }
            _ => format!("/dev/{}", self.common.name),
        }
    }

    /// Kind tag for display, e.g. "partition" or "lvmvg".
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn is_disk(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk(_))
    }

    /// Whether a partition table can live on this device.
    pub fn partitionable(&self) -> bool {
        matches!(self.kind, DeviceKind::Disk(_) | DeviceKind::DmLinear)
            || matches!(&self.kind, DeviceKind::MdArray(data) if data.level == storage_raid::RaidLevel::Container)
    }

    /// The logical sector size presented by this device.
    pub fn sector_size(&self) -> u64 {
        match &self.kind {
            DeviceKind::Disk(data) => data.sector_size,
            _ => 512,
        }
    }
}

/// device-mapper escapes dashes in map names.
pub(crate) fn map_name(name: &str) -> String {
    name.replace('-', "--")
}
