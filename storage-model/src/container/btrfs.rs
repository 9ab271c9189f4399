// SPDX-License-Identifier: GPL-3.0-only

//! btrfs volume and subvolume semantics.

use storage_raid::{RaidLevel, RaidLevelSet};
use storage_units::Size;
use tracing::warn;

use crate::device::{
    BTRFS_MIN_MEMBER_SIZE, BtrfsSubvolumeData, BtrfsVolumeData, Device, DeviceId, DeviceKind,
};
use crate::error::{ModelError, Result};
use crate::format::{Format, FormatKind};
use crate::name;
use crate::tree::DeviceTree;

use super::verify_member_uuid;

fn volume_data(device: &Device) -> Result<&BtrfsVolumeData> {
    match &device.kind {
        DeviceKind::BtrfsVolume(data) => Ok(data),
        _ => Err(ModelError::device(device.name(), "not a btrfs volume")),
    }
}

fn volume_data_mut(device: &mut Device) -> Result<&mut BtrfsVolumeData> {
    let device_name = device.name().to_string();
    match &mut device.kind {
        DeviceKind::BtrfsVolume(data) => Ok(data),
        _ => Err(ModelError::device(device_name, "not a btrfs volume")),
    }
}

/// Pre-check for attaching a member device to a volume.
pub(crate) fn validate_member(tree: &DeviceTree, volume: DeviceId, member: DeviceId) -> Result<()> {
    let member_dev = tree.get(member)?;
    if !matches!(member_dev.format().kind, FormatKind::BtrfsMember { .. }) {
        return Err(ModelError::Value(format!(
            "btrfs member {} must carry a btrfsmember format, found {}",
            member_dev.name(),
            member_dev.format().kind.name()
        )));
    }
    if member_dev.size() < BTRFS_MIN_MEMBER_SIZE {
        return Err(ModelError::device(
            member_dev.name(),
            format!("btrfs member devices must be at least {BTRFS_MIN_MEMBER_SIZE}"),
        ));
    }
    verify_member_uuid(tree, volume, member, true, true)
}

/// Pre-check for removing a member: both the data and metadata levels must
/// stay satisfiable and must not lose data on a redundancy-less volume.
pub(crate) fn validate_member_removal(
    tree: &DeviceTree,
    volume: DeviceId,
    member: DeviceId,
) -> Result<()> {
    let volume_dev = tree.get(volume)?;
    let data = volume_data(volume_dev)?;
    let member_dev = tree.get(member)?;

    for level in [data.data_level, data.metadata_level].into_iter().flatten() {
        if !level.has_redundancy() && volume_dev.exists() && member_dev.format().exists {
            return Err(ModelError::device(
                volume_dev.name(),
                format!("cannot remove a member from existing {level} volume"),
            ));
        }
        if !volume_dev.exists() && volume_dev.parents().len() <= level.min_members() {
            return Err(ModelError::device(
                volume_dev.name(),
                format!("{level} requires at least {} members", level.min_members()),
            ));
        }
    }
    if volume_dev.parents().len() <= 1 {
        return Err(ModelError::device(
            volume_dev.name(),
            "a btrfs volume needs at least one member",
        ));
    }
    Ok(())
}

/// Volume capacity: the data level's net size over the member sizes, with
/// no chunk rounding and no superblock reservation.
pub(crate) fn volume_size(tree: &DeviceTree, volume: DeviceId) -> Result<Size> {
    let device = tree.get(volume)?;
    let data = volume_data(device)?;
    let member_sizes: Vec<Size> = device
        .parents()
        .iter()
        .filter_map(|member| tree.get(*member).ok())
        .map(|member| member.size())
        .collect();
    let level = data.data_level.unwrap_or(RaidLevel::Single);
    match level.size(&member_sizes, None, Size::from_bytes(1), &|_| Size::ZERO) {
        Ok(size) => Ok(size),
        Err(e) => {
            warn!(volume = device.name(), error = %e, "could not calculate volume size");
            Ok(Size::ZERO)
        }
    }
}

impl DeviceTree {
    /// Create a btrfs volume over `members`.
    ///
    /// With no name given the volume is named after its label, falling
    /// back to a generated `btrfs.<id>` name.
    pub fn new_btrfs_volume(
        &mut self,
        volume_name: Option<&str>,
        members: &[DeviceId],
        data_level: Option<&str>,
        metadata_level: Option<&str>,
        uuid: Option<String>,
        exists: bool,
    ) -> Result<DeviceId> {
        if members.is_empty() {
            return Err(ModelError::Value(
                "a btrfs volume must have at least one member".to_string(),
            ));
        }
        let data_level = data_level
            .map(|descriptor| RaidLevelSet::btrfs_data().resolve(descriptor))
            .transpose()?;
        let metadata_level = metadata_level
            .map(|descriptor| RaidLevelSet::btrfs_metadata().resolve(descriptor))
            .transpose()?;

        if !exists {
            for level in [data_level, metadata_level].into_iter().flatten() {
                if members.len() < level.min_members() {
                    return Err(ModelError::device(
                        volume_name.unwrap_or("btrfs"),
                        format!(
                            "raid level {level} requires at least {} members",
                            level.min_members()
                        ),
                    ));
                }
            }
        }

        let id = self.alloc_id();
        let generated = format!("btrfs.{}", id.0);
        let chosen = volume_name.unwrap_or(&generated);
        self.check_new_name(chosen, name::is_btrfs_name_valid(chosen))?;

        let mut device = Device::new(
            id,
            chosen.to_string(),
            Size::ZERO,
            exists,
            DeviceKind::BtrfsVolume(BtrfsVolumeData::new(data_level, metadata_level)),
        );
        device.common.uuid = uuid.clone();
        let mut format = Format::new(FormatKind::Btrfs);
        format.exists = exists;
        // the volume and its filesystem are one and the same
        format.immutable = exists;
        format.uuid = uuid;
        device.common.format = format.clone();
        device.common.original_format = format;
        self.insert(device);

        for member in members {
            if let Err(e) = self.add_parent(id, *member) {
                let added: Vec<DeviceId> = self.get(id)?.parents().to_vec();
                for parent in added {
                    if let Ok(parent_dev) = self.get_mut(parent) {
                        parent_dev.common.children.retain(|child| *child != id);
                    }
                }
                self.devices.remove(&id);
                return Err(e);
            }
        }

        let size = volume_size(self, id)?;
        self.get_mut(id)?.common.size = size;
        Ok(id)
    }

    /// Create a subvolume of `parent` (a volume or another subvolume).
    pub fn new_btrfs_subvolume(
        &mut self,
        parent: DeviceId,
        subvol_name: &str,
        snapshot_source: Option<DeviceId>,
        exists: bool,
    ) -> Result<DeviceId> {
        if !name::is_btrfs_name_valid(subvol_name) {
            return Err(ModelError::Value(format!(
                "{subvol_name:?} is not a valid subvolume name"
            )));
        }
        let volume = self.btrfs_volume_of(parent)?;

        let subvolumes = volume_data(self.get(volume)?)?.subvolumes.clone();
        for existing in &subvolumes {
            if self.get(*existing)?.name() == subvol_name {
                return Err(ModelError::Value(format!(
                    "subvolume {subvol_name} already exists"
                )));
            }
        }

        if let Some(source) = snapshot_source {
            if self.btrfs_volume_of(source)? != volume {
                return Err(ModelError::device(
                    subvol_name,
                    "snapshot source must belong to the same volume",
                ));
            }
        }

        let size = self.get(volume)?.size();
        let id = self.alloc_id();
        let mut device = Device::new(
            id,
            subvol_name.to_string(),
            size,
            exists,
            DeviceKind::BtrfsSubvolume(BtrfsSubvolumeData { snapshot_source }),
        );
        let mut format = Format::new(FormatKind::Btrfs);
        format.exists = exists;
        device.common.format = format.clone();
        device.common.original_format = format;
        self.insert(device);

        if let Err(e) = self.add_parent(id, parent) {
            self.devices.remove(&id);
            return Err(e);
        }
        volume_data_mut(self.get_mut(volume)?)?.subvolumes.push(id);

        if let Some(source) = snapshot_source {
            if !exists {
                self.add_extra_dep(id, source);
            }
        }
        Ok(id)
    }

    /// The first non-subvolume ancestor of a subvolume, which must be a
    /// btrfs volume.
    pub fn btrfs_volume_of(&self, id: DeviceId) -> Result<DeviceId> {
        let mut current = id;
        loop {
            let device = self.get(current)?;
            match &device.kind {
                DeviceKind::BtrfsVolume(_) => return Ok(current),
                DeviceKind::BtrfsSubvolume(_) => {
                    current = device.parents().first().copied().ok_or_else(|| {
                        ModelError::device(device.name(), "subvolume has no parent")
                    })?;
                }
                _ => {
                    return Err(ModelError::device(
                        device.name(),
                        "first non-subvolume ancestor is not a btrfs volume",
                    ));
                }
            }
        }
    }

    /// Remove a subvolume by name; removing an unknown name is an error.
    pub fn btrfs_remove_subvolume(&mut self, volume: DeviceId, subvol_name: &str) -> Result<()> {
        let subvolumes = volume_data(self.get(volume)?)?.subvolumes.clone();
        let target = subvolumes
            .iter()
            .copied()
            .find(|subvol| {
                self.get(*subvol)
                    .map(|device| device.name() == subvol_name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| {
                ModelError::Value(format!("cannot remove non-existent subvolume {subvol_name}"))
            })?;

        let parents = self.get(target)?.parents().to_vec();
        for parent in parents {
            self.get_mut(target)?.common.parents.retain(|p| *p != parent);
            self.get_mut(parent)?.common.children.retain(|c| *c != target);
        }
        volume_data_mut(self.get_mut(volume)?)?
            .subvolumes
            .retain(|subvol| *subvol != target);
        self.extra_deps.retain(|(dependent, _)| *dependent != target);
        self.devices.remove(&target);
        Ok(())
    }

    /// The default subvolume id of a volume.
    pub fn btrfs_default_subvolume(&self, volume: DeviceId) -> Result<u64> {
        Ok(volume_data(self.get(volume)?)?.default_subvolume_id)
    }

    pub fn btrfs_set_default_subvolume(&mut self, volume: DeviceId, subvol_id: u64) -> Result<()> {
        volume_data_mut(self.get_mut(volume)?)?.default_subvolume_id = subvol_id;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(tree: &mut DeviceTree, disk_name: &str, size: Size) -> DeviceId {
        let disk = tree.new_disk(disk_name, size, 512, true).unwrap();
        tree.set_format(disk, Format::new(FormatKind::btrfs_member()))
            .unwrap();
        disk
    }

    #[test]
    fn single_volume_sums_member_sizes() {
        let mut tree = DeviceTree::new();
        let members = [
            member(&mut tree, "sda", Size::gib(1)),
            member(&mut tree, "sdb", Size::gib(2)),
        ];
        let volume = tree
            .new_btrfs_volume(Some("pool"), &members, Some("single"), None, None, false)
            .unwrap();
        assert_eq!(tree.device_size(volume).unwrap(), Size::gib(3));
    }

    #[test]
    fn raid1_volume_uses_smallest_member() {
        let mut tree = DeviceTree::new();
        let members = [
            member(&mut tree, "sda", Size::gib(1)),
            member(&mut tree, "sdb", Size::gib(2)),
        ];
        let volume = tree
            .new_btrfs_volume(Some("pool"), &members, Some("raid1"), Some("raid1"), None, false)
            .unwrap();
        assert_eq!(tree.device_size(volume).unwrap(), Size::gib(1));
    }

    #[test]
    fn volume_levels_are_validated() {
        let mut tree = DeviceTree::new();
        let one = [member(&mut tree, "sda", Size::gib(1))];
        assert!(tree
            .new_btrfs_volume(Some("p"), &one, Some("raid1"), None, None, false)
            .is_err());
        // dup is metadata-only
        let two = [
            member(&mut tree, "sdb", Size::gib(1)),
            member(&mut tree, "sdc", Size::gib(1)),
        ];
        assert!(tree
            .new_btrfs_volume(Some("q"), &two, Some("dup"), None, None, false)
            .is_err());
        assert!(tree
            .new_btrfs_volume(Some("r"), &two, Some("raid1"), Some("dup"), None, false)
            .is_ok());
    }

    #[test]
    fn small_members_are_rejected() {
        let mut tree = DeviceTree::new();
        let tiny = member(&mut tree, "sda", Size::mib(100));
        assert!(tree
            .new_btrfs_volume(Some("p"), &[tiny], Some("single"), None, None, false)
            .is_err());
    }

    #[test]
    fn members_need_member_formats() {
        let mut tree = DeviceTree::new();
        let plain = tree.new_disk("sda", Size::gib(1), 512, true).unwrap();
        assert!(matches!(
            tree.new_btrfs_volume(Some("p"), &[plain], None, None, None, false),
            Err(ModelError::Value(_))
        ));
    }

    #[test]
    fn subvolumes_are_unique_by_name() {
        let mut tree = DeviceTree::new();
        let disk = member(&mut tree, "sda", Size::gib(1));
        let volume = tree
            .new_btrfs_volume(Some("pool"), &[disk], None, None, None, false)
            .unwrap();
        let home = tree
            .new_btrfs_subvolume(volume, "home", None, false)
            .unwrap();
        assert!(tree.new_btrfs_subvolume(volume, "home", None, false).is_err());

        // nested subvolumes register on the volume itself
        let nested = tree
            .new_btrfs_subvolume(home, "home/user", None, false)
            .unwrap();
        assert_eq!(tree.btrfs_volume_of(nested).unwrap(), volume);
        assert_eq!(
            volume_data(tree.get(volume).unwrap()).unwrap().subvolumes,
            vec![home, nested]
        );
    }

    #[test]
    fn removing_unknown_subvolume_errors() {
        let mut tree = DeviceTree::new();
        let disk = member(&mut tree, "sda", Size::gib(1));
        let volume = tree
            .new_btrfs_volume(Some("pool"), &[disk], None, None, None, false)
            .unwrap();
        tree.new_btrfs_subvolume(volume, "home", None, false).unwrap();
        assert!(tree.btrfs_remove_subvolume(volume, "root").is_err());
        tree.btrfs_remove_subvolume(volume, "home").unwrap();
        assert!(tree.btrfs_remove_subvolume(volume, "home").is_err());
    }

    #[test]
    fn snapshots_depend_on_their_source_until_created() {
        let mut tree = DeviceTree::new();
        let disk = member(&mut tree, "sda", Size::gib(1));
        let volume = tree
            .new_btrfs_volume(Some("pool"), &[disk], None, None, None, false)
            .unwrap();
        let home = tree.new_btrfs_subvolume(volume, "home", None, false).unwrap();
        let snap = tree
            .new_btrfs_subvolume(volume, "home.snap", Some(home), false)
            .unwrap();
        assert!(tree.depends_on(snap, home));
    }

    #[test]
    fn member_removal_respects_levels() {
        let mut tree = DeviceTree::new();
        let members = [
            member(&mut tree, "sda", Size::gib(1)),
            member(&mut tree, "sdb", Size::gib(1)),
            member(&mut tree, "sdc", Size::gib(1)),
        ];
        let volume = tree
            .new_btrfs_volume(Some("pool"), &members, Some("raid1"), Some("raid1"), None, false)
            .unwrap();
        tree.remove_parent(volume, members[2]).unwrap();
        // dropping below raid1's two members is refused
        assert!(tree.remove_parent(volume, members[1]).is_err());
    }

    #[test]
    fn member_removal_from_existing_raid0_is_refused() {
        let mut tree = DeviceTree::new();
        let members = [
            member(&mut tree, "sda", Size::gib(1)),
            member(&mut tree, "sdb", Size::gib(1)),
            member(&mut tree, "sdc", Size::gib(1)),
        ];
        let volume = tree
            .new_btrfs_volume(Some("pool"), &members, Some("raid0"), None, None, false)
            .unwrap();
        tree.get_mut(volume).unwrap().common.exists = true;
        for m in &members {
            tree.get_mut(*m).unwrap().common.format.exists = true;
        }
        assert!(tree.remove_parent(volume, members[0]).is_err());
    }
}
