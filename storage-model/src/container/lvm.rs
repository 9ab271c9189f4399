// SPDX-License-Identifier: GPL-3.0-only

//! LVM volume group and logical volume semantics.
//!
//! Space accounting works on the in-memory model: a VG's size, free space
//! and reservations are always derived from its PVs and LVs so that queued
//! changes are reflected before anything is written to disk.

use storage_raid::{RaidLevel, RaidLevelSet};
use storage_units::{RoundMode, Size};
use tracing::debug;

use crate::device::{
    CacheType, Device, DeviceId, DeviceKind, InternalLv, InternalLvKind, LvData, LvPvSpec,
    LvSegment, LvmCache, LvmCacheRequest, ThPoolReserve, VgData,
};
use crate::error::{ModelError, Result};
use crate::format::FormatKind;
use crate::name;
use crate::tree::DeviceTree;

use super::verify_member_uuid;

/// Default thin-pool chunk size.
pub const LVM_THPOOL_CHUNK_SIZE: Size = Size::kib(64);

/// Bounds lvm imposes on thin-pool chunk sizes.
pub const LVM_THPOOL_MIN_CHUNK: Size = Size::kib(64);
pub const LVM_THPOOL_MAX_CHUNK: Size = Size::gib(1);

/// Bounds lvm imposes on thin-pool metadata sizes.
pub const LVM_THPOOL_MIN_MD_SIZE: Size = Size::mib(2);
pub const LVM_THPOOL_MAX_MD_SIZE: Size = Size::gib(16);

/// Smallest cache-pool metadata area.
pub const LVM_CACHE_MIN_MD_SIZE: Size = Size::mib(8);

/// Whether `chunk` is an acceptable thin-pool chunk size.
pub fn is_valid_thpool_chunk_size(chunk: Size) -> bool {
    chunk >= LVM_THPOOL_MIN_CHUNK
        && chunk <= LVM_THPOOL_MAX_CHUNK
        && chunk
            .checked_rem(LVM_THPOOL_MIN_CHUNK)
            .map(|rem| rem.is_zero())
            .unwrap_or(false)
}

/// Whether `md_size` is an acceptable thin-pool metadata size.
pub fn is_valid_thpool_md_size(md_size: Size) -> bool {
    md_size >= LVM_THPOOL_MIN_MD_SIZE && md_size <= LVM_THPOOL_MAX_MD_SIZE
}

/// Recommended thin-pool metadata size: the mapping cost of addressing the
/// whole pool (64 bytes per chunk), clamped to lvm's supported range. The
/// clamp floor leaves room for the requested snapshot headroom.
pub fn thpool_meta_size(pool_size: Size, chunk_size: Size, _snapshots: u32) -> Size {
    let chunk = if chunk_size.is_zero() {
        LVM_THPOOL_CHUNK_SIZE
    } else {
        chunk_size
    };
    let chunks = pool_size.bytes() / chunk.bytes();
    let md = Size::from_bytes(chunks * 64);
    md.clamp(LVM_THPOOL_MIN_MD_SIZE, LVM_THPOOL_MAX_MD_SIZE)
}

/// Default metadata size for a cache of the given size.
pub fn cache_default_md_size(cache_size: Size) -> Size {
    (cache_size / 1000).max(LVM_CACHE_MIN_MD_SIZE)
}

fn vg_data(device: &Device) -> Result<&VgData> {
    match &device.kind {
        DeviceKind::LvmVolumeGroup(data) => Ok(data),
        _ => Err(ModelError::device(device.name(), "not a volume group")),
    }
}

fn vg_data_mut(device: &mut Device) -> Result<&mut VgData> {
    let device_name = device.name().to_string();
    match &mut device.kind {
        DeviceKind::LvmVolumeGroup(data) => Ok(data),
        _ => Err(ModelError::device(device_name, "not a volume group")),
    }
}

fn lv_data(device: &Device) -> Result<&LvData> {
    match &device.kind {
        DeviceKind::LvmLogicalVolume(data) => Ok(data),
        _ => Err(ModelError::device(device.name(), "not a logical volume")),
    }
}

fn lv_data_mut(device: &mut Device) -> Result<&mut LvData> {
    let device_name = device.name().to_string();
    match &mut device.kind {
        DeviceKind::LvmLogicalVolume(data) => Ok(data),
        _ => Err(ModelError::device(device_name, "not a logical volume")),
    }
}

fn pv_free(device: &Device) -> Option<Size> {
    match &device.format().kind {
        FormatKind::LvmPv { free, .. } => *free,
        _ => None,
    }
}

fn set_pv_free(device: &mut Device, value: Option<Size>) {
    if let FormatKind::LvmPv { free, .. } = &mut device.common.format.kind {
        *free = value;
    }
}

fn pv_pe_start(device: &Device) -> Size {
    match &device.format().kind {
        FormatKind::LvmPv { pe_start, .. } => *pe_start,
        _ => crate::format::LVM_PE_START,
    }
}

//
// tree hooks
//

/// Pre-check for attaching a PV to a VG.
pub(crate) fn validate_new_pv(tree: &DeviceTree, vg: DeviceId, pv: DeviceId) -> Result<()> {
    let pv_dev = tree.get(pv)?;
    if !matches!(pv_dev.format().kind, FormatKind::LvmPv { .. }) {
        return Err(ModelError::Value(format!(
            "physical volume {} must carry an lvmpv format, found {}",
            pv_dev.name(),
            pv_dev.format().kind.name()
        )));
    }

    verify_member_uuid(tree, vg, pv, true, true)?;

    // lvm refuses mixed logical sector sizes within one VG
    let vg_dev = tree.get(vg)?;
    let complete = vg_complete_data(tree, vg)?;
    if !vg_dev.exists() || complete {
        let mut sectors: Vec<u64> = vg_dev
            .parents()
            .iter()
            .map(|member| tree.device_sector_size(*member))
            .collect();
        sectors.push(tree.device_sector_size(pv));
        sectors.dedup();
        if sectors.len() > 1 {
            return Err(ModelError::Value(format!(
                "disks with inconsistent sector sizes cannot share volume group {}",
                vg_dev.name()
            )));
        }
    }
    Ok(())
}

/// Bookkeeping after attaching a PV.
pub(crate) fn pv_added(tree: &mut DeviceTree, vg: DeviceId, pv: DeviceId) -> Result<()> {
    let vg_exists = tree.get(vg)?.exists();
    let pv_format_exists = tree.get(pv)?.format().exists;
    let parent_count = tree.get(vg)?.parents().len();

    {
        let data = vg_data(tree.get(vg)?)?;
        if vg_exists && pv_format_exists && data.pv_count == Some(parent_count) {
            vg_data_mut(tree.get_mut(vg)?)?.complete = true;
        }
    }

    // a PV that is only planned has all of its usable space available
    if !pv_format_exists {
        let usable = pv_usable_space(tree, vg, pv)?;
        set_pv_free(tree.get_mut(pv)?, Some(usable));
    }
    Ok(())
}

/// Bookkeeping after detaching a PV: its space and VG linkage are cleared.
pub(crate) fn pv_removed(tree: &mut DeviceTree, pv: DeviceId) -> Result<()> {
    let device = tree.get_mut(pv)?;
    set_pv_free(device, None);
    if let FormatKind::LvmPv {
        vg_name, vg_uuid, ..
    } = &mut device.common.format.kind
    {
        *vg_name = None;
        *vg_uuid = None;
    }
    Ok(())
}

fn vg_complete_data(tree: &DeviceTree, vg: DeviceId) -> Result<bool> {
    Ok(vg_data(tree.get(vg)?)?.complete)
}

/// Usable space a PV contributes: its size minus the extent-start offset
/// (doubled for md-backed PVs, whose data areas are aligned twice over),
/// rounded down to whole extents.
fn pv_usable_space(tree: &DeviceTree, vg: DeviceId, pv: DeviceId) -> Result<Size> {
    let pv_dev = tree.get(pv)?;
    let pe_start = pv_pe_start(pv_dev);
    let raw = if matches!(pv_dev.kind, DeviceKind::MdArray(_)) {
        pv_dev.size() - 2 * pe_start
    } else {
        pv_dev.size() - pe_start
    };
    vg_align(tree, vg, raw, false)
}

/// Total VG capacity: the sum of each PV's usable space.
pub(crate) fn vg_size(tree: &DeviceTree, vg: DeviceId) -> Result<Size> {
    let members = tree.get(vg)?.parents().to_vec();
    let mut total = Size::ZERO;
    for member in members {
        total += pv_usable_space(tree, vg, member)?;
    }
    Ok(total)
}

fn vg_align(tree: &DeviceTree, vg: DeviceId, size: Size, round_up: bool) -> Result<Size> {
    let pe_size = vg_data(tree.get(vg)?)?.pe_size;
    let mode = if round_up { RoundMode::Up } else { RoundMode::Down };
    Ok(size.round_to_size(pe_size, mode)?)
}

/// Update the formats of a device's planned snapshots to mirror its own.
pub(crate) fn propagate_format_to_snapshots(tree: &mut DeviceTree, id: DeviceId) {
    let Ok(device) = tree.get(id) else {
        return;
    };
    let DeviceKind::LvmLogicalVolume(data) = &device.kind else {
        return;
    };
    let mut format = device.format().clone();
    format.exists = false;
    format.mountpoint = None;
    for snapshot in data.snapshots.clone() {
        if let Ok(snap_dev) = tree.get_mut(snapshot) {
            if !snap_dev.exists() {
                snap_dev.common.format = format.clone();
            }
        }
    }
}

//
// LV creation parameters
//

/// Parameters for [`DeviceTree::new_lvm_lv`].
#[derive(Debug, Clone, Default)]
pub struct LvSpec {
    /// Segment type name; `None` means linear.
    pub seg_type: Option<String>,
    pub size: Size,
    pub exists: bool,
    pub grow: bool,
    pub max_size: Size,
    /// PVs to allocate from, with per-PV sizes for linear LVs.
    pub pvs: Vec<LvPvSpec>,
    pub cache_request: Option<LvmCacheRequest>,
    /// Snapshot origin.
    pub origin: Option<DeviceId>,
    pub vorigin: bool,
    /// Makes this an internal LV of the given parent.
    pub internal: Option<(DeviceId, InternalLvKind)>,
    /// Thin-pool metadata size; auto-computed when absent.
    pub metadata_size: Option<Size>,
    /// Thin-pool chunk size; defaults to 64 KiB.
    pub chunk_size: Option<Size>,
    /// Convert two existing LVs (data, metadata) into a thin pool.
    pub from_lvs: Option<(DeviceId, DeviceId)>,
    pub uuid: Option<String>,
}

fn resolve_segment(spec: &LvSpec) -> Result<LvSegment> {
    let seg_name = spec.seg_type.as_deref().unwrap_or("linear");
    let segment = match seg_name {
        "linear" => LvSegment::Linear,
        "mirror" => LvSegment::Mirror,
        "thin" => LvSegment::Thin,
        "thin-pool" => LvSegment::ThinPool {
            chunk_size: spec.chunk_size.unwrap_or(LVM_THPOOL_CHUNK_SIZE),
            lvs: Vec::new(),
            from_lvs: spec.from_lvs,
        },
        "cache" => LvSegment::Cache,
        "cache-pool" => LvSegment::CachePool,
        "writecache" => LvSegment::WriteCache,
        "vdo" => LvSegment::Vdo,
        "vdo-pool" => LvSegment::VdoPool { lvs: Vec::new() },
        other => {
            let level = RaidLevelSet::lvm().resolve(other).map_err(|_| {
                ModelError::Value(format!("invalid or unsupported segment type: {other}"))
            })?;
            if level == RaidLevel::Linear {
                LvSegment::Linear
            } else {
                LvSegment::Raid(level)
            }
        }
    };
    Ok(segment)
}

/// Space a striped segment occupies for `data` across `members` PVs,
/// parity legs included. Falls back to `data` when the member count is
/// insufficient for the level (incomplete information about an existing
/// setup).
fn raid_space(level: RaidLevel, data: Size, members: usize) -> Size {
    match level.base_member_size(data, members) {
        Ok(base) => base * members as i128,
        Err(_) => data,
    }
}

impl DeviceTree {
    /// Create a new LVM volume group over `pvs`.
    pub fn new_lvm_vg(
        &mut self,
        vg_name: &str,
        pvs: &[DeviceId],
        pe_size: Option<Size>,
        uuid: Option<String>,
        exists: bool,
    ) -> Result<DeviceId> {
        self.check_new_name(vg_name, name::is_lvm_name_valid(vg_name))?;
        if !exists && pvs.is_empty() {
            return Err(ModelError::device(vg_name, "a volume group needs at least one PV"));
        }
        if let Some(pe) = pe_size {
            if pe.is_zero() || pe.bytes() < 0 || !(pe.bytes() as u128).is_power_of_two() {
                return Err(ModelError::Value(format!("invalid extent size {pe}")));
            }
        }

        let mut data = VgData::new(pe_size);
        if !exists {
            data.pv_count = Some(pvs.len());
        }
        let id = self.alloc_id();
        let mut device = Device::new(
            id,
            vg_name.to_string(),
            Size::ZERO,
            exists,
            DeviceKind::LvmVolumeGroup(data),
        );
        device.common.uuid = uuid;
        self.insert(device);

        for pv in pvs {
            if let Err(e) = self.add_parent(id, *pv) {
                let added: Vec<DeviceId> = self.get(id)?.parents().to_vec();
                for parent in added {
                    if let Ok(parent_dev) = self.get_mut(parent) {
                        parent_dev.common.children.retain(|child| *child != id);
                    }
                    let _ = pv_removed(self, parent);
                }
                self.devices.remove(&id);
                return Err(e);
            }
        }

        let size = vg_size(self, id)?;
        self.get_mut(id)?.common.size = size;
        Ok(id)
    }

    /// Adopt the PV count reported for a discovered VG.
    pub fn vg_set_discovered_pv_count(&mut self, vg: DeviceId, pv_count: usize) -> Result<()> {
        vg_data_mut(self.get_mut(vg)?)?.pv_count = Some(pv_count);
        Ok(())
    }

    /// Mark a VG complete (all PVs accounted for on disk).
    pub fn vg_mark_complete(&mut self, vg: DeviceId) -> Result<()> {
        vg_data_mut(self.get_mut(vg)?)?.complete = true;
        Ok(())
    }

    /// Whether all of the VG's PVs have been found.
    pub fn vg_complete(&self, vg: DeviceId) -> Result<bool> {
        let device = self.get(vg)?;
        Ok(vg_data(device)?.complete || !device.exists())
    }

    pub fn vg_set_reserved_percent(&mut self, vg: DeviceId, percent: u32) -> Result<()> {
        let device = self.get(vg)?;
        if device.exists() {
            return Err(ModelError::device(device.name(), "cannot reserve space in an existing VG"));
        }
        if percent > 100 {
            return Err(ModelError::Value(format!("invalid reserved percent {percent}")));
        }
        vg_data_mut(self.get_mut(vg)?)?.reserved_percent = percent;
        Ok(())
    }

    pub fn vg_set_reserved_space(&mut self, vg: DeviceId, space: Size) -> Result<()> {
        let device = self.get(vg)?;
        if device.exists() {
            return Err(ModelError::device(device.name(), "cannot reserve space in an existing VG"));
        }
        vg_data_mut(self.get_mut(vg)?)?.reserved_space = space;
        Ok(())
    }

    pub fn vg_set_thpool_reserve(&mut self, vg: DeviceId, reserve: ThPoolReserve) -> Result<()> {
        vg_data_mut(self.get_mut(vg)?)?.thpool_reserve = Some(reserve);
        Ok(())
    }

    pub fn vg_size(&self, vg: DeviceId) -> Result<Size> {
        vg_size(self, vg)
    }

    pub fn vg_extents(&self, vg: DeviceId) -> Result<i128> {
        let pe_size = vg_data(self.get(vg)?)?.pe_size;
        Ok(vg_size(self, vg)?.bytes() / pe_size.bytes())
    }

    /// Align a size to the VG's extent size.
    pub fn vg_align(&self, vg: DeviceId, size: Size, round_up: bool) -> Result<Size> {
        vg_align(self, vg, size, round_up)
    }

    /// Size of the pmspare volume lvm keeps for metadata repair: as large
    /// as the largest metadata area in the VG.
    pub fn vg_pmspare_size(&self, vg: DeviceId) -> Result<Size> {
        let lvs = vg_data(self.get(vg)?)?.lvs.clone();
        let mut largest = Size::ZERO;
        for lv in lvs {
            let data = lv_data(self.get(lv)?)?;
            largest = largest.max(self.lv_metadata_size(lv)?);
            if let Some(cache) = &data.cache {
                largest = largest.max(cache.md_size);
            }
        }
        Ok(largest)
    }

    /// Space set aside in the VG: the caller's reservation (percent or
    /// absolute, whichever is larger), thin-pool growth headroom when the
    /// VG hosts thin pools, and the pmspare volume.
    pub fn vg_reserved_space(&self, vg: DeviceId) -> Result<Size> {
        let data = vg_data(self.get(vg)?)?;
        let size = vg_size(self, vg)?;
        let percent_reserve = size * data.reserved_percent as i128 / 100;
        let mut reserved = percent_reserve.max(data.reserved_space);

        if let Some(thpool_reserve) = data.thpool_reserve {
            let has_pool = data
                .lvs
                .iter()
                .filter_map(|lv| self.get(*lv).ok())
                .filter_map(|device| lv_data(device).ok())
                .any(LvData::is_thin_pool);
            if has_pool {
                let pool_reserve = size * thpool_reserve.percent as i128 / 100;
                reserved += pool_reserve.clamp(thpool_reserve.min, thpool_reserve.max);
            }
        }

        reserved += self.vg_pmspare_size(vg)?;
        vg_align(self, vg, reserved, true)
    }

    /// Free space in the VG, with every queued LV and reservation counted.
    pub fn vg_free_space(&self, vg: DeviceId) -> Result<Size> {
        let size = vg_size(self, vg)?;
        let lvs = vg_data(self.get(vg)?)?.lvs.clone();
        let mut used = Size::ZERO;
        for lv in lvs {
            used += self.lv_vg_space_used(lv)?;
        }
        used += self.vg_reserved_space(vg)?;
        let free = size - used;
        debug!(vg = self.get(vg)?.name(), %free, "computed VG free space");
        Ok(free)
    }

    pub fn vg_free_extents(&self, vg: DeviceId) -> Result<i128> {
        let pe_size = vg_data(self.get(vg)?)?.pe_size;
        Ok(self.vg_free_space(vg)?.bytes() / pe_size.bytes())
    }

    /// The LVs of a VG, in creation order.
    pub fn vg_lvs(&self, vg: DeviceId) -> Result<Vec<DeviceId>> {
        Ok(vg_data(self.get(vg)?)?.lvs.clone())
    }

    /// Metadata space an LV reserves (RAID leg metadata, thin-pool
    /// metadata area).
    pub fn lv_metadata_size(&self, lv: DeviceId) -> Result<Size> {
        Ok(lv_data(self.get(lv)?)?.metadata_size)
    }

    /// VG space the LV occupies, data and metadata parts included.
    ///
    /// Thin and VDO LVs occupy their pool, not the VG.
    pub fn lv_vg_space_used(&self, lv: DeviceId) -> Result<Size> {
        let device = self.get(lv)?;
        let data = lv_data(device)?;

        if data.is_thin_lv() || data.is_vdo_lv() {
            return Ok(Size::ZERO);
        }

        let vg = self.lv_volume_group(lv)?;
        let rounded = vg_align(self, vg, device.size(), true)?;
        let members = data.pv_specs.len().max(1);

        let mut used = match data.segment.raid_level() {
            Some(level) => raid_space(level, rounded, members),
            None => rounded,
        };
        let mut metadata = match data.segment.raid_level() {
            Some(level) if !data.metadata_size.is_zero() => {
                raid_space(level, data.metadata_size, members)
            }
            _ => data.metadata_size,
        };
        if let Some(cache) = &data.cache {
            used += cache.size;
            metadata += cache.md_size;
        }
        Ok(used + metadata)
    }

    /// The space a thin LV occupies within its pool.
    pub fn lv_pool_space_used(&self, lv: DeviceId) -> Result<Size> {
        let device = self.get(lv)?;
        let data = lv_data(device)?;
        if !data.is_thin_lv() {
            return Err(ModelError::device(device.name(), "not a thin volume"));
        }
        let vg = self.lv_volume_group(lv)?;
        vg_align(self, vg, device.size(), true)
    }

    /// Space used inside a thin pool by its thin LVs.
    pub fn pool_used_space(&self, pool: DeviceId) -> Result<Size> {
        let device = self.get(pool)?;
        let LvSegment::ThinPool { lvs, .. } = &lv_data(device)?.segment else {
            return Err(ModelError::device(device.name(), "not a thin pool"));
        };
        let lvs = lvs.clone();
        let mut used = Size::ZERO;
        for lv in lvs {
            used += self.lv_pool_space_used(lv)?;
        }
        Ok(used)
    }

    pub fn pool_free_space(&self, pool: DeviceId) -> Result<Size> {
        Ok(self.get(pool)?.size() - self.pool_used_space(pool)?)
    }

    /// The largest size the LV could grow to.
    pub fn lv_max_size(&self, lv: DeviceId) -> Result<Size> {
        let device = self.get(lv)?;
        let vg = self.lv_volume_group(lv)?;
        let max_lv = vg_align(self, vg, device.size(), true)?
            + vg_align(self, vg, self.vg_free_space(vg)?, false)?;
        let max_format = device.format().max_size;
        if max_format > Size::ZERO {
            Ok(max_lv.min(max_format))
        } else {
            Ok(max_lv)
        }
    }

    /// Create a new logical volume in `container` (a VG, or a pool LV for
    /// thin/vdo volumes).
    pub fn new_lvm_lv(&mut self, lv_name: &str, container: DeviceId, spec: LvSpec) -> Result<DeviceId> {
        let mut segment = resolve_segment(&spec)?;
        let container_dev = self.get(container)?;

        // resolve the owning VG; thin/vdo LVs hang off their pool
        let (vg, pool) = match &container_dev.kind {
            DeviceKind::LvmVolumeGroup(_) => (container, None),
            DeviceKind::LvmLogicalVolume(data) if data.is_thin_pool() || data.is_vdo_pool() => {
                (self.lv_volume_group(container)?, Some(container))
            }
            _ => {
                return Err(ModelError::Value(format!(
                    "constructor requires a volume group or pool, got {}",
                    container_dev.kind_name()
                )));
            }
        };

        match segment {
            LvSegment::Thin => {
                let needs_pool = pool
                    .and_then(|p| self.get(p).ok())
                    .and_then(|device| lv_data(device).ok())
                    .map(LvData::is_thin_pool)
                    .unwrap_or(false);
                if !needs_pool {
                    return Err(ModelError::device(lv_name, "constructor requires a thin-pool LV"));
                }
            }
            LvSegment::Vdo => {
                let needs_pool = pool
                    .and_then(|p| self.get(p).ok())
                    .and_then(|device| lv_data(device).ok())
                    .map(LvData::is_vdo_pool)
                    .unwrap_or(false);
                if !needs_pool {
                    return Err(ModelError::device(lv_name, "constructor requires a vdo-pool LV"));
                }
            }
            _ => {
                if pool.is_some() {
                    return Err(ModelError::device(
                        lv_name,
                        "only thin and vdo volumes can live in a pool",
                    ));
                }
            }
        }

        let internal = spec.internal.map(|(parent_lv, kind)| InternalLv { parent_lv, kind });
        let name_ok = internal.is_some() || name::is_lvm_name_valid(lv_name);
        if !name_ok {
            return Err(ModelError::Value(format!(
                "{lv_name:?} is not a valid name for a logical volume"
            )));
        }
        let sibling_names: Vec<String> = vg_data(self.get(vg)?)?
            .lvs
            .iter()
            .filter_map(|lv| self.get(*lv).ok())
            .map(|device| device.name().to_string())
            .collect();
        if sibling_names.iter().any(|existing| existing == lv_name) {
            return Err(ModelError::Value(format!(
                "logical volume {lv_name:?} already exists in this volume group"
            )));
        }

        let mut size = spec.size;
        let mut metadata_size = Size::ZERO;

        if !spec.exists {
            if segment.raid_level().is_some() && spec.pvs.is_empty() {
                return Err(ModelError::device(
                    lv_name,
                    "a list of PVs has to be given for every non-linear LV",
                ));
            }
            if matches!(segment, LvSegment::Linear) && !spec.pvs.is_empty() {
                if spec.pvs.iter().any(|pv_spec| pv_spec.size.is_zero()) {
                    return Err(ModelError::device(
                        lv_name,
                        "PVs for a linear LV need a complete space specification",
                    ));
                }
                let assigned: Size = spec.pvs.iter().map(|pv_spec| pv_spec.size).sum();
                if assigned != size {
                    return Err(ModelError::device(
                        lv_name,
                        "space assigned to PVs does not equal the LV size",
                    ));
                }
            }
            let vg_pvs = self.get(vg)?.parents().to_vec();
            if spec.pvs.iter().any(|pv_spec| !vg_pvs.contains(&pv_spec.pv)) {
                return Err(ModelError::device(lv_name, "destination PVs are not part of the VG"));
            }
        }

        // snapshot rules
        if spec.vorigin && !spec.exists {
            return Err(ModelError::device(lv_name, "only existing vorigin snapshots are supported"));
        }
        if let Some(origin) = spec.origin {
            let origin_vg = self.lv_volume_group(origin)?;
            if origin_vg != vg {
                return Err(ModelError::device(
                    lv_name,
                    "lvm snapshot and origin must be in the same vg",
                ));
            }
            if matches!(segment, LvSegment::Thin) {
                if !spec.exists && !size.is_zero() {
                    return Err(ModelError::device(
                        lv_name,
                        "thin snapshot size is determined automatically",
                    ));
                }
                size = self.get(origin)?.size();
            }
        }

        // segment-specific sizing
        match &mut segment {
            LvSegment::Raid(_) | LvSegment::Mirror => {
                // one extent of metadata per RAID leg comes out of the
                // requested size
                metadata_size = vg_data(self.get(vg)?)?.pe_size;
                size -= metadata_size;
            }
            LvSegment::ThinPool {
                chunk_size,
                from_lvs,
                ..
            } => {
                if !is_valid_thpool_chunk_size(*chunk_size) {
                    return Err(ModelError::Value(format!("invalid chunk size {chunk_size}")));
                }
                if let Some((data_lv, meta_lv)) = *from_lvs {
                    if spec.exists {
                        return Err(ModelError::device(lv_name, "only new LVs can be created from other LVs"));
                    }
                    if !size.is_zero() || !spec.max_size.is_zero() {
                        return Err(ModelError::device(lv_name, "cannot specify size for a converted LV"));
                    }
                    for source in [data_lv, meta_lv] {
                        let source_dev = self.get(source)?;
                        if !source_dev.exists() {
                            return Err(ModelError::device(
                                source_dev.name(),
                                "component LVs need to be created first",
                            ));
                        }
                        if self.lv_volume_group(source)? != vg {
                            return Err(ModelError::device(
                                source_dev.name(),
                                "conversion of LVs only possible inside a VG",
                            ));
                        }
                    }
                    size = self.get(data_lv)?.size();
                    metadata_size = self.get(meta_lv)?.size();
                } else if let Some(requested_md) = spec.metadata_size {
                    if !is_valid_thpool_md_size(requested_md) {
                        return Err(ModelError::Value(format!(
                            "invalid thin-pool metadata size {requested_md}"
                        )));
                    }
                    metadata_size = requested_md;
                } else if !spec.grow {
                    // auto-size the metadata area and make room for it and
                    // for the pmspare growth it causes
                    let md = vg_align(self, vg, thpool_meta_size(size, *chunk_size, 100), true)?;
                    let pmspare_growth = (md - self.vg_pmspare_size(vg)?).max(Size::ZERO);
                    metadata_size = md;
                    size = size - md - pmspare_growth;
                }
            }
            _ => {}
        }

        // cache carving
        let cache = match &spec.cache_request {
            Some(request) if !spec.exists => Some(self.carve_cache(vg, request)?),
            _ => None,
        };

        // free-space admission check; a pool converted from existing LVs
        // occupies exactly the space its sources already account for
        let converting = matches!(
            &segment,
            LvSegment::ThinPool {
                from_lvs: Some(_),
                ..
            }
        );
        if !spec.exists
            && !spec.grow
            && !converting
            && !matches!(segment, LvSegment::Thin)
            && size > self.vg_free_space(vg)?
        {
            return Err(ModelError::device(
                self.get(vg)?.name(),
                "new lv is too large to fit in free space",
            ));
        }

        // PV space admission check
        let mut pv_specs = spec.pvs.clone();
        if let Some(level) = segment.raid_level() {
            if !pv_specs.is_empty() {
                let per_member = level.base_member_size(size + metadata_size, pv_specs.len())?;
                for pv_spec in &mut pv_specs {
                    pv_spec.size = per_member;
                }
            }
        }
        if !spec.exists {
            let mut charges = pv_specs.clone();
            if let Some(cache) = &cache {
                charges.extend(cache.fast_pvs.iter().copied());
            }
            for charge in &charges {
                let free = pv_free(self.get(charge.pv)?).unwrap_or(Size::ZERO);
                if free < charge.size {
                    return Err(ModelError::device(
                        self.get(charge.pv)?.name(),
                        format!("not enough space in this PV for the {lv_name} LV's extents"),
                    ));
                }
            }
            for charge in &charges {
                let device = self.get_mut(charge.pv)?;
                let free = pv_free(device).unwrap_or(Size::ZERO);
                set_pv_free(device, Some(free - charge.size));
            }
        }

        let from_lvs = match &segment {
            LvSegment::ThinPool { from_lvs, .. } => *from_lvs,
            _ => None,
        };

        let id = self.alloc_id();
        let mut lv = Device::new(
            id,
            lv_name.to_string(),
            size,
            spec.exists,
            DeviceKind::LvmLogicalVolume(LvData::new(segment)),
        );
        lv.common.uuid = spec.uuid.clone();
        {
            let data = match &mut lv.kind {
                DeviceKind::LvmLogicalVolume(data) => data,
                _ => unreachable!("just constructed"),
            };
            data.origin = spec.origin;
            data.vorigin = spec.vorigin;
            data.internal = internal;
            data.cache = cache;
            data.pv_specs = pv_specs;
            data.metadata_size = metadata_size;
            data.req_grow = spec.grow;
            data.req_max_size = spec.max_size;
        }
        self.insert(lv);

        if internal.is_some() {
            // internal LVs have no parents in the tree; they are only
            // referenced by their parent LV
            let parent_lv = internal.map(|i| i.parent_lv).unwrap_or(id);
            lv_data_mut(self.get_mut(parent_lv)?)?.internal_lvs.push(id);
            return Ok(id);
        }

        let attach_to = pool.unwrap_or(vg);
        if let Err(e) = self.add_parent(id, attach_to) {
            self.devices.remove(&id);
            return Err(e);
        }

        vg_data_mut(self.get_mut(vg)?)?.lvs.push(id);
        if let Some(pool_id) = pool {
            if let LvSegment::ThinPool { lvs, .. } | LvSegment::VdoPool { lvs } =
                &mut lv_data_mut(self.get_mut(pool_id)?)?.segment
            {
                lvs.push(id);
            }
        }

        if let Some(origin) = spec.origin {
            lv_data_mut(self.get_mut(origin)?)?.snapshots.push(id);
            if !spec.exists {
                self.add_extra_dep(id, origin);
                // a planned snapshot mirrors its origin's format
                let mut format = self.get(origin)?.format().clone();
                format.exists = false;
                format.mountpoint = None;
                self.get_mut(id)?.common.format = format;
            }
        }

        if let Some((data_lv, meta_lv)) = from_lvs {
            self.internalize_pool_sources(id, vg, data_lv, meta_lv)?;
        }

        Ok(id)
    }

    /// Turn the source LVs of a pool conversion into internal LVs.
    fn internalize_pool_sources(
        &mut self,
        pool: DeviceId,
        vg: DeviceId,
        data_lv: DeviceId,
        meta_lv: DeviceId,
    ) -> Result<()> {
        for (source, kind) in [(data_lv, InternalLvKind::Data), (meta_lv, InternalLvKind::Meta)] {
            let parents = self.get(source)?.parents().to_vec();
            for parent in parents {
                self.get_mut(source)?.common.parents.retain(|p| *p != parent);
                self.get_mut(parent)?.common.children.retain(|c| *c != source);
            }
            vg_data_mut(self.get_mut(vg)?)?.lvs.retain(|lv| *lv != source);
            lv_data_mut(self.get_mut(source)?)?.internal = Some(InternalLv {
                parent_lv: pool,
                kind,
            });
            lv_data_mut(self.get_mut(pool)?)?.internal_lvs.push(source);
        }
        Ok(())
    }

    /// Split a cache request into data and metadata areas and charge its
    /// fast PVs.
    fn carve_cache(&mut self, vg: DeviceId, request: &LvmCacheRequest) -> Result<LvmCache> {
        if request.cache_type == CacheType::WriteCache {
            let mut fast_pvs: Vec<LvPvSpec> = request
                .fast_pvs
                .iter()
                .map(|pv| LvPvSpec { pv: *pv, size: Size::ZERO })
                .collect();
            assign_cache_space(self, &mut fast_pvs, request.size)?;
            return Ok(LvmCache {
                cache_type: CacheType::WriteCache,
                size: request.size,
                md_size: Size::ZERO,
                mode: request.mode.clone().unwrap_or_else(|| "writeback".to_string()),
                fast_pvs,
                exists: false,
            });
        }

        let md_size = cache_default_md_size(request.size);
        let mut size = request.size - md_size;
        // growing the pmspare volume for this cache's metadata also comes
        // out of the requested space
        let pmspare = self.vg_pmspare_size(vg)?;
        if pmspare < md_size {
            size -= md_size - pmspare;
        }
        size = vg_align(self, vg, size, false)?;

        let mut fast_pvs: Vec<LvPvSpec> = request
            .fast_pvs
            .iter()
            .map(|pv| LvPvSpec { pv: *pv, size: Size::ZERO })
            .collect();
        assign_cache_space(self, &mut fast_pvs, size + md_size)?;

        Ok(LvmCache {
            cache_type: CacheType::Cache,
            size,
            md_size,
            mode: request.mode.clone().unwrap_or_else(|| "writethrough".to_string()),
            fast_pvs,
            exists: false,
        })
    }

    /// Remove an LV from its VG (and pool), restoring all accounting.
    pub fn vg_remove_lv(&mut self, lv: DeviceId) -> Result<()> {
        let device = self.get(lv)?;
        let data = lv_data(device)?.clone();
        let lv_exists = device.exists();
        if data.is_internal() {
            return Err(ModelError::device(
                device.name(),
                "an internal LV cannot be removed separately",
            ));
        }
        let vg = self.lv_volume_group(lv)?;

        // a vdo pool takes its vdo volumes with it
        if let LvSegment::VdoPool { lvs } = &data.segment {
            for vdo_lv in lvs.clone() {
                self.vg_remove_lv(vdo_lv)?;
            }
        }

        // PV accounting
        if !lv_exists {
            let mut charges = data.pv_specs.clone();
            if let Some(cache) = &data.cache {
                charges.extend(cache.fast_pvs.iter().copied());
            }
            for charge in charges {
                let device = self.get_mut(charge.pv)?;
                if let Some(free) = pv_free(device) {
                    set_pv_free(device, Some(free + charge.size));
                }
            }
        }

        // snapshot accounting
        if let Some(origin) = data.origin {
            lv_data_mut(self.get_mut(origin)?)?.snapshots.retain(|s| *s != lv);
        }
        self.extra_deps.retain(|(dependent, _)| *dependent != lv);

        // detach from pool and VG
        let parents = self.get(lv)?.parents().to_vec();
        for parent in parents {
            self.get_mut(lv)?.common.parents.retain(|p| *p != parent);
            self.get_mut(parent)?.common.children.retain(|c| *c != lv);
            if let Ok(parent_dev) = self.get_mut(parent) {
                if let Ok(parent_data) = lv_data_mut(parent_dev) {
                    if let LvSegment::ThinPool { lvs, .. } | LvSegment::VdoPool { lvs } =
                        &mut parent_data.segment
                    {
                        lvs.retain(|l| *l != lv);
                    }
                }
            }
        }
        vg_data_mut(self.get_mut(vg)?)?.lvs.retain(|l| *l != lv);

        // a converted pool releases its source LVs back to the VG
        if let LvSegment::ThinPool {
            from_lvs: Some((data_lv, meta_lv)),
            ..
        } = &data.segment
        {
            for source in [*data_lv, *meta_lv] {
                lv_data_mut(self.get_mut(source)?)?.internal = None;
                self.get_mut(source)?.common.parents.push(vg);
                self.get_mut(vg)?.common.children.push(source);
                vg_data_mut(self.get_mut(vg)?)?.lvs.push(source);
            }
        }

        self.devices.remove(&lv);
        Ok(())
    }
}

/// Re-register a restored LV with its VG, pool and PVs (the inverse of
/// [`DeviceTree::vg_remove_lv`]).
pub(crate) fn reregister_lv(tree: &mut DeviceTree, lv: DeviceId) -> Result<()> {
    let device = tree.get(lv)?;
    let data = lv_data(device)?.clone();
    let lv_exists = device.exists();
    let vg = tree.lv_volume_group(lv)?;

    let vg_data_ref = vg_data_mut(tree.get_mut(vg)?)?;
    if !vg_data_ref.lvs.contains(&lv) {
        vg_data_ref.lvs.push(lv);
    }

    for parent in tree.get(lv)?.parents().to_vec() {
        if let Ok(parent_dev) = tree.get_mut(parent) {
            if let Ok(parent_data) = lv_data_mut(parent_dev) {
                if let LvSegment::ThinPool { lvs, .. } | LvSegment::VdoPool { lvs } =
                    &mut parent_data.segment
                {
                    if !lvs.contains(&lv) {
                        lvs.push(lv);
                    }
                }
            }
        }
    }

    if let Some(origin) = data.origin {
        let origin_data = lv_data_mut(tree.get_mut(origin)?)?;
        if !origin_data.snapshots.contains(&lv) {
            origin_data.snapshots.push(lv);
        }
        if !lv_exists {
            tree.add_extra_dep(lv, origin);
        }
    }

    if !lv_exists {
        let mut charges = data.pv_specs.clone();
        if let Some(cache) = &data.cache {
            charges.extend(cache.fast_pvs.iter().copied());
        }
        for charge in charges {
            let device = tree.get_mut(charge.pv)?;
            if let Some(free) = pv_free(device) {
                set_pv_free(device, Some(free - charge.size));
            }
        }
    }
    Ok(())
}

/// Distribute `space` over the fast PVs, greedily in order.
fn assign_cache_space(tree: &DeviceTree, specs: &mut [LvPvSpec], space: Size) -> Result<()> {
    let mut remaining = space - specs.iter().map(|spec| spec.size).sum::<Size>();
    for spec in specs.iter_mut().filter(|spec| spec.size.is_zero()) {
        if remaining.is_zero() {
            break;
        }
        let free = pv_free(tree.get(spec.pv)?).unwrap_or(Size::ZERO);
        if free >= remaining {
            spec.size = remaining;
            remaining = Size::ZERO;
        } else if free > Size::ZERO {
            spec.size = free;
            remaining -= free;
        }
    }
    if remaining > Size::ZERO {
        return Err(ModelError::device(
            "cache",
            format!("not enough free space in the PVs for this cache: {remaining} short"),
        ));
    }
    Ok(())
}
