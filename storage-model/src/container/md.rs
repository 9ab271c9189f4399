// SPDX-License-Identifier: GPL-3.0-only

//! md (Linux software RAID) array semantics.

use storage_raid::{MD_CHUNK_SIZE, RaidLevel, RaidLevelSet, md_superblock_size, mduuid_from_canonical};
use storage_units::Size;
use tracing::warn;

use crate::device::{Device, DeviceId, DeviceKind, MdArrayData};
use crate::error::{ModelError, Result};
use crate::format::FormatKind;
use crate::tree::DeviceTree;

use super::verify_member_uuid;

fn array_data(device: &Device) -> Result<&MdArrayData> {
    match &device.kind {
        DeviceKind::MdArray(data) => Ok(data),
        _ => Err(ModelError::device(device.name(), "not an md array")),
    }
}

fn array_data_mut(device: &mut Device) -> Result<&mut MdArrayData> {
    let name = device.name().to_string();
    match &mut device.kind {
        DeviceKind::MdArray(data) => Ok(data),
        _ => Err(ModelError::device(name, "not an md array")),
    }
}

/// Pre-check for attaching `member` to `array`.
pub(crate) fn validate_member(
    tree: &DeviceTree,
    array: DeviceId,
    member: DeviceId,
) -> Result<()> {
    let member_dev = tree.get(member)?;

    // arrays inside a BIOS RAID container are bound by the container itself
    if matches!(&member_dev.kind, DeviceKind::MdArray(data) if data.level == RaidLevel::Container) {
        return Ok(());
    }

    if !matches!(member_dev.format().kind, FormatKind::MdMember { .. }) {
        return Err(ModelError::Value(format!(
            "md member {} must carry an mdmember format, found {}",
            member_dev.name(),
            member_dev.format().kind.name()
        )));
    }

    verify_member_uuid(tree, array, member, true, true)
}

/// Bookkeeping after attaching `member` to `array`.
pub(crate) fn member_added(tree: &mut DeviceTree, array: DeviceId, member: DeviceId) -> Result<()> {
    // members whose format already exists were discovered, not added; the
    // device counts came from the array metadata in that case
    let member_format_exists = tree.get(member)?.format().exists;
    if !member_format_exists {
        let data = array_data_mut(tree.get_mut(array)?)?;
        data.total_devices += 1;
        data.member_devices += 1;
    }
    Ok(())
}

/// Pre-check for removing `member` from `array`.
///
/// Removing a member is allowed when the level is redundant, or the array
/// does not exist on disk yet, or the member's format does not. Containers
/// have no redundancy of their own and are exempt.
pub(crate) fn validate_member_removal(
    tree: &DeviceTree,
    array: DeviceId,
    member: DeviceId,
) -> Result<()> {
    let array_dev = tree.get(array)?;
    let data = array_data(array_dev)?;
    let member_dev = tree.get(member)?;

    if data.level != RaidLevel::Container
        && !data.level.has_redundancy()
        && array_dev.exists()
        && member_dev.format().exists
    {
        return Err(ModelError::device(
            array_dev.name(),
            format!("cannot remove members from existing {} array", data.level),
        ));
    }

    if !array_dev.exists() && array_dev.parents().len() <= data.level.min_members() {
        return Err(ModelError::device(
            array_dev.name(),
            format!(
                "{} requires at least {} members",
                data.level,
                data.level.min_members()
            ),
        ));
    }
    Ok(())
}

pub(crate) fn member_removed(tree: &mut DeviceTree, array: DeviceId) -> Result<()> {
    let data = array_data_mut(tree.get_mut(array)?)?;
    data.member_devices = data.member_devices.saturating_sub(1);
    Ok(())
}

/// Estimated size of a non-existing array from its member sizes.
///
/// Sizing failures are non-fatal; they yield zero so callers can retry
/// once more information is available.
pub(crate) fn array_size(tree: &DeviceTree, array: DeviceId) -> Result<Size> {
    let device = tree.get(array)?;
    let data = array_data(device)?;
    let member_sizes: Vec<Size> = device
        .parents()
        .iter()
        .filter_map(|member| tree.get(*member).ok())
        .map(|member| member.size())
        .collect();

    let chunk = if data.chunk_size.is_zero() {
        MD_CHUNK_SIZE
    } else {
        data.chunk_size
    };
    let version = data.metadata_version.clone();
    let superblock = move |member: Size| md_superblock_size(member, version.as_deref());

    match data
        .level
        .size(&member_sizes, Some(data.member_devices), chunk, &superblock)
    {
        Ok(size) => Ok(size),
        Err(e) => {
            warn!(array = device.name(), error = %e, "could not calculate array size");
            Ok(Size::ZERO)
        }
    }
}

impl DeviceTree {
    /// Create a new md array over `members`.
    ///
    /// Every member must already carry an mdmember format. `spares` of the
    /// members are held in reserve; the rest are active.
    pub fn new_md_array(
        &mut self,
        array_name: &str,
        level_descriptor: &str,
        members: &[DeviceId],
        spares: usize,
        metadata_version: Option<&str>,
        chunk_size: Option<Size>,
        uuid: Option<String>,
        exists: bool,
    ) -> Result<DeviceId> {
        let level = RaidLevelSet::md().resolve(level_descriptor)?;
        self.check_new_name(array_name, crate::name::is_device_name_valid(array_name))?;

        if !exists && members.len() < level.min_members() {
            return Err(ModelError::device(
                array_name,
                format!(
                    "a {level} set requires at least {} members",
                    level.min_members()
                ),
            ));
        }
        if spares > level.max_spares(members.len().max(level.min_members()))? {
            return Err(ModelError::Value(format!(
                "{spares} spares is more than {level} allows for {} members",
                members.len()
            )));
        }

        let mut data = MdArrayData::new(level);
        data.metadata_version = metadata_version.map(str::to_string);
        if let Some(chunk) = chunk_size {
            validate_chunk_size(level, chunk)?;
            data.chunk_size = chunk;
        }

        let id = self.alloc_id();
        let mut device = Device::new(
            id,
            array_name.to_string(),
            Size::ZERO,
            exists,
            DeviceKind::MdArray(data),
        );
        device.common.uuid = uuid;
        self.insert(device);

        for member in members {
            if let Err(e) = self.add_parent(id, *member) {
                // release the members added so far and drop the device,
                // bypassing removal validation for the half-built array
                let added: Vec<DeviceId> = self.get(id)?.parents().to_vec();
                for parent in added {
                    if let Ok(device) = self.get_mut(parent) {
                        device.common.children.retain(|child| *child != id);
                    }
                }
                self.devices.remove(&id);
                return Err(e);
            }
        }

        // the attach hooks counted the planned members; the requested
        // member/spare split is authoritative
        {
            let data = array_data_mut(self.get_mut(id)?)?;
            data.total_devices = members.len();
            data.member_devices = members.len() - spares;
        }

        let size = array_size(self, id)?;
        self.get_mut(id)?.common.size = size;
        Ok(id)
    }

    /// Adopt the device counts reported by the array's own metadata
    /// during discovery.
    pub fn md_set_discovered_counts(
        &mut self,
        array: DeviceId,
        member_devices: usize,
        total_devices: usize,
    ) -> Result<()> {
        let data = array_data_mut(self.get_mut(array)?)?;
        data.member_devices = member_devices;
        data.total_devices = total_devices;
        Ok(())
    }

    /// Number of spare devices in the array.
    pub fn md_spares(&self, array: DeviceId) -> Result<usize> {
        Ok(array_data(self.get(array)?)?.spares())
    }

    /// Reconfigure the number of spares for a planned array.
    pub fn md_set_spares(&mut self, array: DeviceId, spares: usize) -> Result<()> {
        let device = self.get(array)?;
        let data = array_data(device)?;
        let max = data.level.max_spares(device.parents().len())?;
        if spares > max {
            return Err(ModelError::device(
                device.name(),
                format!("new spares value {spares} is too large (max {max})"),
            ));
        }
        let data = array_data_mut(self.get_mut(array)?)?;
        if data.total_devices > spares {
            data.member_devices = data.total_devices - spares;
        }
        Ok(())
    }

    /// Set the chunk size of a planned array.
    pub fn md_set_chunk_size(&mut self, array: DeviceId, chunk: Size) -> Result<()> {
        let device = self.get(array)?;
        if device.exists() {
            return Err(ModelError::device(
                device.name(),
                "cannot set chunk size for an existing device",
            ));
        }
        let data = array_data(device)?;
        validate_chunk_size(data.level, chunk)?;
        array_data_mut(self.get_mut(array)?)?.chunk_size = chunk;
        Ok(())
    }

    /// An array is complete when it has at least as many members attached
    /// as its active-device count.
    pub fn md_complete(&self, array: DeviceId) -> Result<bool> {
        let device = self.get(array)?;
        let data = array_data(device)?;
        Ok(data.member_devices <= device.parents().len() || !device.exists())
    }

    /// The array's mdadm.conf line.
    pub fn mdadm_conf_entry(&self, array: DeviceId) -> Result<String> {
        let device = self.get(array)?;
        let data = array_data(device)?;
        let uuid = device.common.uuid.as_deref().ok_or_else(|| {
            ModelError::device(device.name(), "array is not fully defined")
        })?;
        let mdadm_uuid = mduuid_from_canonical(uuid)?;
        if data.level == RaidLevel::Container {
            return Ok(format!("ARRAY {} UUID={}\n", device.path(), mdadm_uuid));
        }
        Ok(format!(
            "ARRAY {} level={} num-devices={} UUID={}\n",
            device.path(),
            data.level,
            data.member_devices,
            mdadm_uuid
        ))
    }

    /// Extra mkfs arguments for formats living on this array.
    pub fn md_format_args(&self, array: DeviceId) -> Result<Vec<String>> {
        let device = self.get(array)?;
        let data = array_data(device)?;
        if matches!(
            device.format().kind,
            FormatKind::Ext2 | FormatKind::Ext3 | FormatKind::Ext4
        ) {
            if let Some(stride) = data.level.recommended_stride(data.member_devices)? {
                return Ok(vec!["-R".to_string(), format!("stride={stride}")]);
            }
        }
        Ok(Vec::new())
    }

    /// The array's UUID in mdadm's colon-grouped form, if available.
    pub fn md_mdadm_uuid(&self, array: DeviceId) -> Result<Option<String>> {
        let device = self.get(array)?;
        match device.common.uuid.as_deref() {
            Some(uuid) => Ok(mduuid_from_canonical(uuid).ok()),
            None => Ok(None),
        }
    }
}

fn validate_chunk_size(level: RaidLevel, chunk: Size) -> Result<()> {
    if level == RaidLevel::Raid1 {
        if !chunk.is_zero() {
            return Err(ModelError::Value(
                "chunk size is meaningless for raid1".to_string(),
            ));
        }
        return Ok(());
    }
    if chunk.is_zero() || !chunk.checked_rem(Size::kib(4))?.is_zero() {
        return Err(ModelError::Value(
            "chunk size must be a multiple of 4 KiB".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn member_disk(tree: &mut DeviceTree, disk_name: &str, size: Size) -> DeviceId {
        let disk = tree.new_disk(disk_name, size, 512, true).unwrap();
        tree.set_format(disk, Format::new(FormatKind::md_member())).unwrap();
        disk
    }

    fn three_member_raid0(tree: &mut DeviceTree) -> DeviceId {
        let members: Vec<DeviceId> = (0..3)
            .map(|i| member_disk(tree, &format!("sd{i}"), Size::mib(100)))
            .collect();
        tree.new_md_array("md0", "raid0", &members, 0, None, None, None, false)
            .unwrap()
    }

    #[test]
    fn new_arrays_need_member_formats() {
        let mut tree = DeviceTree::new();
        let plain = tree.new_disk("sda", Size::mib(100), 512, true).unwrap();
        let formatted = member_disk(&mut tree, "sdb", Size::mib(100));
        let err = tree
            .new_md_array("md0", "raid1", &[plain, formatted], 0, None, None, None, false)
            .unwrap_err();
        assert!(matches!(err, ModelError::Value(_)), "{err}");
        // failed creation must not leak the device or edges
        assert!(tree.resolve("md0").is_err());
        assert!(tree.get(formatted).unwrap().children().is_empty());
    }

    #[test]
    fn new_arrays_enforce_min_members() {
        let mut tree = DeviceTree::new();
        let member = member_disk(&mut tree, "sda", Size::mib(100));
        assert!(matches!(
            tree.new_md_array("md0", "raid5", &[member], 0, None, None, None, false),
            Err(ModelError::Device { .. })
        ));
    }

    #[test]
    fn raid0_size_trims_to_chunk_with_superblock() {
        let mut tree = DeviceTree::new();
        let array = three_member_raid0(&mut tree);
        // 1 MiB superblock per member at default metadata, then 512 KiB trim
        assert_eq!(tree.device_size(array).unwrap(), Size::mib(297));
        assert_eq!(tree.get(array).unwrap().size(), Size::mib(297));
    }

    #[test]
    fn planned_member_add_bumps_device_counts() {
        let mut tree = DeviceTree::new();
        let array = three_member_raid0(&mut tree);
        let data = match &tree.get(array).unwrap().kind {
            DeviceKind::MdArray(data) => data.clone(),
            _ => unreachable!(),
        };
        assert_eq!(data.total_devices, 3);
        assert_eq!(data.member_devices, 3);
        assert_eq!(data.spares(), 0);
    }

    #[test]
    fn removal_from_existing_raid0_with_data_is_refused() {
        let mut tree = DeviceTree::new();
        let array = three_member_raid0(&mut tree);
        let member = tree.get(array).unwrap().parents()[0];

        // flip to "existing with formatted members"
        tree.get_mut(array).unwrap().common.exists = true;
        tree.get_mut(member).unwrap().common.format.exists = true;

        let err = tree.remove_parent(array, member).unwrap_err();
        assert!(matches!(err, ModelError::Device { .. }), "{err}");
    }

    #[test]
    fn removal_from_redundant_array_is_allowed() {
        let mut tree = DeviceTree::new();
        let members: Vec<DeviceId> = (0..3)
            .map(|i| member_disk(&mut tree, &format!("sd{i}"), Size::gib(1)))
            .collect();
        let array = tree
            .new_md_array("md0", "raid1", &members, 1, None, None, None, false)
            .unwrap();
        tree.get_mut(array).unwrap().common.exists = true;
        for member in &members {
            tree.get_mut(*member).unwrap().common.format.exists = true;
        }
        tree.remove_parent(array, members[2]).unwrap();
        assert_eq!(tree.get(array).unwrap().parents().len(), 2);
    }

    #[test]
    fn removal_below_min_members_is_refused_for_planned_arrays() {
        let mut tree = DeviceTree::new();
        let members: Vec<DeviceId> = (0..2)
            .map(|i| member_disk(&mut tree, &format!("sd{i}"), Size::gib(1)))
            .collect();
        let array = tree
            .new_md_array("md0", "raid1", &members, 0, None, None, None, false)
            .unwrap();
        assert!(tree.remove_parent(array, members[0]).is_err());
    }

    #[test]
    fn chunk_size_rules() {
        let mut tree = DeviceTree::new();
        let array = three_member_raid0(&mut tree);
        assert!(tree.md_set_chunk_size(array, Size::kib(64)).is_ok());
        assert!(tree.md_set_chunk_size(array, Size::kib(3)).is_err());

        let members: Vec<DeviceId> = (0..2)
            .map(|i| member_disk(&mut tree, &format!("m{i}"), Size::gib(1)))
            .collect();
        let mirror = tree
            .new_md_array("md1", "raid1", &members, 0, None, None, None, false)
            .unwrap();
        assert!(tree.md_set_chunk_size(mirror, Size::kib(512)).is_err());
        assert!(tree.md_set_chunk_size(mirror, Size::ZERO).is_ok());
    }

    #[test]
    fn spares_respect_level_limits() {
        let mut tree = DeviceTree::new();
        let members: Vec<DeviceId> = (0..4)
            .map(|i| member_disk(&mut tree, &format!("sd{i}"), Size::gib(1)))
            .collect();
        let array = tree
            .new_md_array("md0", "raid1", &members, 0, None, None, None, false)
            .unwrap();
        tree.md_set_spares(array, 2).unwrap();
        assert_eq!(tree.md_spares(array).unwrap(), 2);
        assert!(tree.md_set_spares(array, 3).is_err());
    }

    #[test]
    fn complete_reflects_member_count() {
        let mut tree = DeviceTree::new();
        let array = three_member_raid0(&mut tree);
        assert!(tree.md_complete(array).unwrap());

        tree.get_mut(array).unwrap().common.exists = true;
        assert!(tree.md_complete(array).unwrap());
        let member = tree.get(array).unwrap().parents()[0];
        // losing a member below the active count makes it incomplete
        tree.get_mut(array).unwrap().common.parents.retain(|p| *p != member);
        assert!(!tree.md_complete(array).unwrap());
    }

    #[test]
    fn conf_entries_render_by_type() {
        let mut tree = DeviceTree::new();
        let array = three_member_raid0(&mut tree);
        tree.get_mut(array).unwrap().common.uuid =
            Some("3386ff85-f501-2621-4a43-5f061eb47236".into());
        assert_eq!(
            tree.mdadm_conf_entry(array).unwrap(),
            "ARRAY /dev/md/md0 level=raid0 num-devices=3 UUID=3386ff85:f5012621:4a435f06:1eb47236\n"
        );
    }

    #[test]
    fn discovered_members_do_not_bump_counts() {
        let mut tree = DeviceTree::new();
        let uuid = "3386ff85-f501-2621-4a43-5f061eb47236".to_string();
        let members: Vec<DeviceId> = (0..2)
            .map(|i| {
                let disk = tree
                    .new_disk(&format!("sd{i}"), Size::gib(1), 512, true)
                    .unwrap();
                let mut format = Format::existing(FormatKind::md_member());
                format.set_container_uuid(Some(uuid.clone()));
                tree.set_format(disk, format).unwrap();
                disk
            })
            .collect();
        let array = tree
            .new_md_array(
                "md0",
                "raid1",
                &[],
                0,
                None,
                None,
                Some(uuid.clone()),
                true,
            )
            .unwrap();
        {
            let data = array_data_mut(tree.get_mut(array).unwrap()).unwrap();
            data.member_devices = 2;
            data.total_devices = 2;
        }
        for member in &members {
            tree.add_parent(array, *member).unwrap();
        }
        let data = array_data(tree.get(array).unwrap()).unwrap();
        assert_eq!(data.member_devices, 2);
        assert_eq!(data.total_devices, 2);
        assert!(tree.md_complete(array).unwrap());
    }

    #[test]
    fn mismatched_member_uuid_is_rejected() {
        let mut tree = DeviceTree::new();
        let disk = tree.new_disk("sda", Size::gib(1), 512, true).unwrap();
        let mut format = Format::existing(FormatKind::md_member());
        format.set_container_uuid(Some("0386ff85-f501-2621-4a43-5f061eb47236".into()));
        tree.set_format(disk, format).unwrap();

        let array = tree
            .new_md_array(
                "md0",
                "raid1",
                &[],
                0,
                None,
                None,
                Some("3386ff85-f501-2621-4a43-5f061eb47236".into()),
                true,
            )
            .unwrap();
        assert!(tree.add_parent(array, disk).is_err());
    }
}
