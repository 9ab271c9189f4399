// SPDX-License-Identifier: GPL-3.0-only

//! Kind-specific device payloads.

use serde::{Deserialize, Serialize};
use storage_raid::{MD_CHUNK_SIZE, RaidLevel};
use storage_units::Size;

use super::DeviceId;

/// The closed set of device variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceKind {
    Disk(DiskData),
    Partition(PartitionData),
    MdArray(MdArrayData),
    LvmVolumeGroup(VgData),
    LvmLogicalVolume(LvData),
    BtrfsVolume(BtrfsVolumeData),
    BtrfsSubvolume(BtrfsSubvolumeData),
    Luks,
    DmLinear,
    DmCrypt,
    File(FileData),
    Directory,
    NoDevice,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Disk(_) => "disk",
            DeviceKind::Partition(_) => "partition",
            DeviceKind::MdArray(data) if data.level == RaidLevel::Container => "mdcontainer",
            DeviceKind::MdArray(_) => "mdarray",
            DeviceKind::LvmVolumeGroup(_) => "lvmvg",
            DeviceKind::LvmLogicalVolume(data) => data.kind_name(),
            DeviceKind::BtrfsVolume(_) => "btrfs volume",
            DeviceKind::BtrfsSubvolume(_) => "btrfs subvolume",
            DeviceKind::Luks => "luks/dm-crypt",
            DeviceKind::DmLinear => "dm-linear",
            DeviceKind::DmCrypt => "dm-crypt",
            DeviceKind::File(_) => "file",
            DeviceKind::Directory => "directory",
            DeviceKind::NoDevice => "nodev",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskData {
    /// Logical sector size in bytes.
    pub sector_size: u64,
}

/// Partition type bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartType {
    Primary,
    Logical,
    Extended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionData {
    pub part_type: PartType,
    pub bootable: bool,
    /// Grow to fill available space, up to `req_max_size` if set.
    pub req_grow: bool,
    pub req_max_size: Size,
    /// Parted geometry, when known: (first sector, last sector).
    pub geometry: Option<(u64, u64)>,
}

impl PartitionData {
    pub fn new(part_type: PartType) -> PartitionData {
        PartitionData {
            part_type,
            bootable: false,
            req_grow: false,
            req_max_size: Size::ZERO,
            geometry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdArrayData {
    pub level: RaidLevel,
    /// Active (non-spare) member count.
    pub member_devices: usize,
    /// Total member count including spares.
    pub total_devices: usize,
    pub chunk_size: Size,
    pub metadata_version: Option<String>,
}

impl MdArrayData {
    pub fn new(level: RaidLevel) -> MdArrayData {
        MdArrayData {
            level,
            member_devices: 0,
            total_devices: 0,
            chunk_size: if level == RaidLevel::Raid1 {
                Size::ZERO
            } else {
                MD_CHUNK_SIZE
            },
            metadata_version: Some("default".to_string()),
        }
    }

    pub fn spares(&self) -> usize {
        self.total_devices.saturating_sub(self.member_devices)
    }
}

/// Space reserved in a VG for thin pools to grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThPoolReserve {
    pub percent: u32,
    pub min: Size,
    pub max: Size,
}

impl ThPoolReserve {
    pub const DEFAULT: ThPoolReserve = ThPoolReserve {
        percent: 20,
        min: Size::gib(1),
        max: Size::gib(100),
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VgData {
    /// Physical extent size.
    pub pe_size: Size,
    /// The PV count the VG is known to have on disk, for existing VGs.
    pub pv_count: Option<usize>,
    /// Have all of this VG's PVs been found?
    pub complete: bool,
    pub reserved_percent: u32,
    pub reserved_space: Size,
    pub thpool_reserve: Option<ThPoolReserve>,
    /// LVs carved from this VG, in creation order.
    pub lvs: Vec<DeviceId>,
    pub exported: bool,
}

/// Default physical extent size.
pub const LVM_PE_SIZE: Size = Size::mib(4);

impl VgData {
    pub fn new(pe_size: Option<Size>) -> VgData {
        VgData {
            pe_size: pe_size.unwrap_or(LVM_PE_SIZE),
            pv_count: None,
            complete: false,
            reserved_percent: 0,
            reserved_space: Size::ZERO,
            thpool_reserve: None,
            lvs: Vec::new(),
            exported: false,
        }
    }
}

/// LVM logical volume segment types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LvSegment {
    Linear,
    Raid(RaidLevel),
    /// Legacy mirrored segments; sizing follows raid1.
    Mirror,
    ThinPool {
        chunk_size: Size,
        /// Thin LVs carved from this pool.
        lvs: Vec<DeviceId>,
        /// Set when the pool was converted from existing (data, metadata) LVs.
        from_lvs: Option<(DeviceId, DeviceId)>,
    },
    Thin,
    Cache,
    CachePool,
    WriteCache,
    VdoPool {
        lvs: Vec<DeviceId>,
    },
    Vdo,
}

impl LvSegment {
    pub fn name(&self) -> &'static str {
        match self {
            LvSegment::Linear => "linear",
            LvSegment::Raid(RaidLevel::Raid0) => "raid0",
            LvSegment::Raid(RaidLevel::Raid1) => "raid1",
            LvSegment::Raid(RaidLevel::Raid4) => "raid4",
            LvSegment::Raid(RaidLevel::Raid5) => "raid5",
            LvSegment::Raid(RaidLevel::Raid6) => "raid6",
            LvSegment::Raid(_) => "raid10",
            LvSegment::Mirror => "mirror",
            LvSegment::ThinPool { .. } => "thin-pool",
            LvSegment::Thin => "thin",
            LvSegment::Cache => "cache",
            LvSegment::CachePool => "cache-pool",
            LvSegment::WriteCache => "writecache",
            LvSegment::VdoPool { .. } => "vdo-pool",
            LvSegment::Vdo => "vdo",
        }
    }

    /// The RAID level the segment stripes across PVs with, if any.
    pub fn raid_level(&self) -> Option<RaidLevel> {
        match self {
            LvSegment::Raid(level) => Some(*level),
            LvSegment::Mirror => Some(RaidLevel::Raid1),
            _ => None,
        }
    }
}

/// Roles of LVs internal to another LV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalLvKind {
    Data,
    Meta,
    Log,
    Image,
    Origin,
    CachePool,
}

impl InternalLvKind {
    /// Internal kinds whose space is not already covered by the parent LV.
    pub fn takes_extra_space(self) -> bool {
        matches!(
            self,
            InternalLvKind::Meta | InternalLvKind::Log | InternalLvKind::CachePool
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalLv {
    pub parent_lv: DeviceId,
    pub kind: InternalLvKind,
}

/// How much of an LV should be allocated from a particular PV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvPvSpec {
    pub pv: DeviceId,
    pub size: Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Cache,
    WriteCache,
}

/// Parameters of a cache requested for a new LV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvmCacheRequest {
    pub size: Size,
    pub fast_pvs: Vec<DeviceId>,
    pub mode: Option<String>,
    pub cache_type: CacheType,
}

impl LvmCacheRequest {
    pub fn new(size: Size, fast_pvs: Vec<DeviceId>) -> LvmCacheRequest {
        LvmCacheRequest {
            size,
            fast_pvs,
            mode: None,
            cache_type: CacheType::Cache,
        }
    }
}

/// Cache attached to an LV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvmCache {
    pub cache_type: CacheType,
    /// Size of the cache data area.
    pub size: Size,
    /// Size of the cache metadata; zero for writecache.
    pub md_size: Size,
    pub mode: String,
    pub fast_pvs: Vec<LvPvSpec>,
    pub exists: bool,
}

impl LvmCache {
    pub fn vg_space_used(&self) -> Size {
        self.size + self.md_size
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LvData {
    pub segment: LvSegment,
    /// Snapshot origin, when this LV is a snapshot.
    pub origin: Option<DeviceId>,
    /// A vorigin snapshot has no stored origin volume.
    pub vorigin: bool,
    /// Set when this LV lives inside another LV rather than the tree.
    pub internal: Option<InternalLv>,
    pub cache: Option<LvmCache>,
    pub pv_specs: Vec<LvPvSpec>,
    /// Metadata reservation for RAID/thin-pool segments.
    pub metadata_size: Size,
    /// Internal LVs owned by this LV.
    pub internal_lvs: Vec<DeviceId>,
    /// Snapshots taken of this LV.
    pub snapshots: Vec<DeviceId>,
    pub req_grow: bool,
    pub req_max_size: Size,
}

impl LvData {
    pub fn new(segment: LvSegment) -> LvData {
        LvData {
            segment,
            origin: None,
            vorigin: false,
            internal: None,
            cache: None,
            pv_specs: Vec::new(),
            metadata_size: Size::ZERO,
            internal_lvs: Vec::new(),
            snapshots: Vec::new(),
            req_grow: false,
            req_max_size: Size::ZERO,
        }
    }

    pub fn is_thin_pool(&self) -> bool {
        matches!(self.segment, LvSegment::ThinPool { .. })
    }

    pub fn is_thin_lv(&self) -> bool {
        matches!(self.segment, LvSegment::Thin)
    }

    pub fn is_vdo_pool(&self) -> bool {
        matches!(self.segment, LvSegment::VdoPool { .. })
    }

    pub fn is_vdo_lv(&self) -> bool {
        matches!(self.segment, LvSegment::Vdo)
    }

    pub fn is_snapshot(&self) -> bool {
        self.origin.is_some() || self.vorigin
    }

    pub fn is_internal(&self) -> bool {
        self.internal.is_some()
    }

    pub fn is_raid(&self) -> bool {
        self.segment.raid_level().is_some()
    }

    pub fn cached(&self) -> bool {
        self.cache.is_some()
    }

    fn kind_name(&self) -> &'static str {
        if self.is_internal() {
            "lvminternallv"
        } else if self.is_snapshot() {
            if self.is_thin_lv() {
                "lvmthinsnapshot"
            } else {
                "lvmsnapshot"
            }
        } else if self.is_thin_pool() {
            "lvmthinpool"
        } else if self.is_thin_lv() {
            "lvmthinlv"
        } else if self.is_vdo_pool() {
            "lvmvdopool"
        } else if self.is_vdo_lv() {
            "vdolv"
        } else {
            "lvmlv"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BtrfsVolumeData {
    pub data_level: Option<RaidLevel>,
    pub metadata_level: Option<RaidLevel>,
    /// Subvolumes of this volume, unique by name.
    pub subvolumes: Vec<DeviceId>,
    pub default_subvolume_id: u64,
}

/// The id btrfs gives the top-level volume.
pub const BTRFS_MAIN_VOLUME_ID: u64 = 5;

/// Smallest usable btrfs member device.
pub const BTRFS_MIN_MEMBER_SIZE: Size = Size::mib(256);

impl BtrfsVolumeData {
    pub fn new(data_level: Option<RaidLevel>, metadata_level: Option<RaidLevel>) -> BtrfsVolumeData {
        BtrfsVolumeData {
            data_level,
            metadata_level,
            subvolumes: Vec::new(),
            default_subvolume_id: BTRFS_MAIN_VOLUME_ID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BtrfsSubvolumeData {
    /// Source subvolume when this subvolume is a snapshot.
    pub snapshot_source: Option<DeviceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    /// Absolute path of the backing file.
    pub path: String,
    /// Sparse files are created without preallocation.
    pub sparse: bool,
}
