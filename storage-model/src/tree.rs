// SPDX-License-Identifier: GPL-3.0-only

//! The device graph.
//!
//! An ID-indexed arena of devices with typed parent/child edges. All
//! mutation happens through `&mut self` methods, which serializes graph
//! manipulation for any caller that owns (or locks) the tree.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use storage_units::Size;
use tracing::debug;

use crate::device::{
    Device, DeviceId, DeviceKind, DeviceState, DiskData, FileData, PartType, PartitionData, Tag,
};
use crate::error::{ModelError, Result};
use crate::format::{Format, FormatKind, LUKS_METADATA_SIZE};
use crate::name;

/// Notification fired when a device's format record changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatEvent {
    Removed { device: DeviceId, kind: String },
    Added { device: DeviceId, kind: String },
}

type FormatObserver = Box<dyn FnMut(&FormatEvent) + Send>;

/// The typed, acyclic graph of storage devices.
pub struct DeviceTree {
    pub(crate) devices: BTreeMap<DeviceId, Device>,
    /// Devices removed from view by [`DeviceTree::hide`], keyed by id.
    hidden: BTreeMap<DeviceId, Device>,
    /// Hidden subtrees by their root, so unhiding restores the whole group.
    hidden_groups: Vec<(DeviceId, Vec<DeviceId>)>,
    /// Dependencies that are not parent edges: `(dependent, dependency)`.
    /// Followed by `depends_on` only while the dependent does not exist.
    pub(crate) extra_deps: Vec<(DeviceId, DeviceId)>,
    observers: Vec<FormatObserver>,
    next_id: u64,
}

impl fmt::Debug for DeviceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTree")
            .field("devices", &self.devices)
            .field("hidden", &self.hidden.keys().collect::<Vec<_>>())
            .field("extra_deps", &self.extra_deps)
            .finish()
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTree {
    pub fn new() -> DeviceTree {
        DeviceTree {
            devices: BTreeMap::new(),
            hidden: BTreeMap::new(),
            hidden_groups: Vec::new(),
            extra_deps: Vec::new(),
            observers: Vec::new(),
            next_id: 1,
        }
    }

    pub(crate) fn alloc_id(&mut self) -> DeviceId {
        let id = DeviceId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: DeviceId) -> Result<&Device> {
        self.devices
            .get(&id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Result<&mut Device> {
        self.devices
            .get_mut(&id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Display name: LVs render as `vg-lv`, everything else as its name.
    pub fn display_name(&self, id: DeviceId) -> Result<String> {
        let device = self.get(id)?;
        if let DeviceKind::LvmLogicalVolume(_) = &device.kind {
            if let Ok(vg) = self.lv_volume_group(id) {
                let vg_name = self.get(vg)?.name().to_string();
                return Ok(format!("{}-{}", vg_name, device.name()));
            }
        }
        Ok(device.name().to_string())
    }

    /// The VG an LV ultimately belongs to, looking through pool parents.
    pub fn lv_volume_group(&self, id: DeviceId) -> Result<DeviceId> {
        let mut current = id;
        for _ in 0..16 {
            let device = self.get(current)?;
            let Some(parent) = device.parents().first().copied() else {
                break;
            };
            if matches!(self.get(parent)?.kind, DeviceKind::LvmVolumeGroup(_)) {
                return Ok(parent);
            }
            current = parent;
        }
        Err(ModelError::device(
            self.get(id)?.name(),
            "logical volume has no volume group ancestor",
        ))
    }

    /// Resolve a device by name, display name, UUID or device node path.
    pub fn resolve(&self, key: &str) -> Result<DeviceId> {
        for device in self.devices.values() {
            let id = device.id();
            if device.name() == key || device.path() == key {
                return Ok(id);
            }
            if device.common.uuid.as_deref() == Some(key) {
                return Ok(id);
            }
            if let Ok(display) = self.display_name(id) {
                if display == key {
                    return Ok(id);
                }
            }
        }
        Err(ModelError::NotFound(key.to_string()))
    }

    pub(crate) fn name_in_use(&self, name: &str) -> bool {
        self.devices
            .values()
            .chain(self.hidden.values())
            .any(|device| device.name() == name)
    }

    pub(crate) fn check_new_name(&self, name: &str, valid: bool) -> Result<()> {
        if !valid {
            return Err(ModelError::Value(format!(
                "{name:?} is not a valid name for this device"
            )));
        }
        if self.name_in_use(name) {
            return Err(ModelError::Value(format!("name {name:?} is already in use")));
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, device: Device) -> DeviceId {
        let id = device.id();
        debug!(device = %device.name(), kind = device.kind_name(), "adding device");
        self.devices.insert(id, device);
        id
    }

    //
    // traversal
    //

    /// Transitive closure over parent edges, including the device itself.
    pub fn ancestors(&self, id: DeviceId) -> Result<Vec<DeviceId>> {
        self.get(id)?;
        let mut seen: HashSet<DeviceId> = HashSet::new();
        let mut queue = VecDeque::from([id]);
        let mut order = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            if let Ok(device) = self.get(current) {
                queue.extend(device.parents().iter().copied());
            }
        }
        Ok(order)
    }

    /// Transitive closure over child edges, including the device itself.
    pub fn descendants(&self, id: DeviceId) -> Result<Vec<DeviceId>> {
        self.get(id)?;
        let mut seen: HashSet<DeviceId> = HashSet::new();
        let mut queue = VecDeque::from([id]);
        let mut order = Vec::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            order.push(current);
            if let Ok(device) = self.get(current) {
                queue.extend(device.children().iter().copied());
            }
        }
        Ok(order)
    }

    /// Whether `device` is built (directly or transitively) atop `other`.
    ///
    /// Non-parent dependencies (a planned snapshot's origin) are honored
    /// while the dependent device does not exist. A device never depends on
    /// itself.
    pub fn depends_on(&self, device: DeviceId, other: DeviceId) -> bool {
        if device == other {
            return false;
        }
        let mut seen: HashSet<DeviceId> = HashSet::new();
        let mut queue = VecDeque::from([device]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if current != device && current == other {
                return true;
            }
            let Ok(node) = self.get(current) else {
                continue;
            };
            queue.extend(node.parents().iter().copied());
            if !node.exists() {
                queue.extend(
                    self.extra_deps
                        .iter()
                        .filter(|(dependent, _)| *dependent == current)
                        .map(|(_, dependency)| *dependency),
                );
            }
        }
        false
    }

    pub fn is_leaf(&self, id: DeviceId) -> Result<bool> {
        Ok(self.get(id)?.is_leaf())
    }

    //
    // edges
    //

    /// Attach `parent` as a new parent of `child`.
    ///
    /// Runs the kind-specific pre-checks on both endpoints, then commits
    /// the edge and the container-side bookkeeping.
    pub fn add_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<()> {
        if child == parent {
            return Err(ModelError::device(
                self.get(child)?.name(),
                "a device cannot be its own parent",
            ));
        }
        let child_name = self.get(child)?.name().to_string();
        self.get(parent)?;

        if self.get(child)?.parents().contains(&parent) {
            return Err(ModelError::device(child_name, "parent is already accounted for"));
        }
        if self.depends_on(parent, child) {
            return Err(ModelError::device(
                child_name,
                "adding this parent would create a cycle",
            ));
        }

        self.pre_add_parent(child, parent)?;

        self.get_mut(child)?.common.parents.push(parent);
        self.get_mut(parent)?.common.children.push(child);

        self.post_add_parent(child, parent)
    }

    /// Detach `parent` from `child`.
    pub fn remove_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<()> {
        let child_name = self.get(child)?.name().to_string();
        if !self.get(child)?.parents().contains(&parent) {
            return Err(ModelError::device(child_name, "parent is not accounted for"));
        }

        self.pre_remove_parent(child, parent)?;

        self.get_mut(child)?.common.parents.retain(|p| *p != parent);
        self.get_mut(parent)?.common.children.retain(|c| *c != child);

        self.post_remove_parent(child, parent)
    }

    fn pre_add_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<()> {
        match &self.get(child)?.kind {
            DeviceKind::MdArray(_) => crate::container::md::validate_member(self, child, parent),
            DeviceKind::LvmVolumeGroup(_) => {
                crate::container::lvm::validate_new_pv(self, child, parent)
            }
            DeviceKind::BtrfsVolume(_) => {
                crate::container::btrfs::validate_member(self, child, parent)
            }
            DeviceKind::Luks => {
                let device = self.get(child)?;
                if !device.parents().is_empty() {
                    return Err(ModelError::device(device.name(), "LUKS takes exactly one parent"));
                }
                let backing = self.get(parent)?;
                if !matches!(backing.format().kind, FormatKind::Luks { .. }) {
                    return Err(ModelError::format(
                        backing.name(),
                        "LUKS device requires a luks-formatted parent",
                    ));
                }
                Ok(())
            }
            DeviceKind::Partition(_) => {
                let backing = self.get(parent)?;
                if !backing.partitionable() {
                    return Err(ModelError::device(
                        backing.name(),
                        "partitions require a partitionable parent",
                    ));
                }
                Ok(())
            }
            DeviceKind::BtrfsSubvolume(_) => {
                let backing = self.get(parent)?;
                if !matches!(
                    backing.kind,
                    DeviceKind::BtrfsVolume(_) | DeviceKind::BtrfsSubvolume(_)
                ) {
                    return Err(ModelError::device(
                        self.get(child)?.name(),
                        "btrfs subvolumes live on btrfs volumes",
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn post_add_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<()> {
        match &self.get(child)?.kind {
            DeviceKind::MdArray(_) => crate::container::md::member_added(self, child, parent),
            DeviceKind::LvmVolumeGroup(_) => crate::container::lvm::pv_added(self, child, parent),
            _ => Ok(()),
        }
    }

    fn pre_remove_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<()> {
        match &self.get(child)?.kind {
            DeviceKind::MdArray(_) => {
                crate::container::md::validate_member_removal(self, child, parent)
            }
            DeviceKind::BtrfsVolume(_) => {
                crate::container::btrfs::validate_member_removal(self, child, parent)
            }
            _ => Ok(()),
        }
    }

    fn post_remove_parent(&mut self, child: DeviceId, parent: DeviceId) -> Result<()> {
        match &self.get(child)?.kind {
            DeviceKind::MdArray(_) => crate::container::md::member_removed(self, child),
            DeviceKind::LvmVolumeGroup(_) => crate::container::lvm::pv_removed(self, parent),
            _ => Ok(()),
        }
    }

    //
    // hiding
    //

    /// Remove a device and everything built atop it from view.
    ///
    /// The subtree is kept aside, with its internal edges intact, so
    /// [`DeviceTree::unhide`] can restore it.
    pub fn hide(&mut self, id: DeviceId) -> Result<()> {
        let group = self.descendants(id)?;
        let group_set: HashSet<DeviceId> = group.iter().copied().collect();

        for member in &group {
            let parents = self.get(*member)?.parents().to_vec();
            for parent in parents {
                if !group_set.contains(&parent) {
                    if let Ok(device) = self.get_mut(parent) {
                        device.common.children.retain(|c| c != member);
                    }
                }
            }
        }

        for member in &group {
            if let Some(device) = self.devices.remove(member) {
                self.hidden.insert(*member, device);
            }
        }
        self.hidden_groups.push((id, group));
        Ok(())
    }

    /// Restore a previously hidden subtree.
    pub fn unhide(&mut self, id: DeviceId) -> Result<()> {
        let position = self
            .hidden_groups
            .iter()
            .position(|(root, _)| *root == id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))?;
        let (_, group) = self.hidden_groups.remove(position);
        let group_set: HashSet<DeviceId> = group.iter().copied().collect();

        for member in &group {
            if let Some(device) = self.hidden.remove(member) {
                self.devices.insert(*member, device);
            }
        }
        for member in &group {
            let parents = self.get(*member)?.parents().to_vec();
            for parent in parents {
                if !group_set.contains(&parent) {
                    let device = self.get_mut(parent)?;
                    if !device.common.children.contains(member) {
                        device.common.children.push(*member);
                    }
                }
            }
        }
        Ok(())
    }

    //
    // formats
    //

    pub fn add_observer(&mut self, observer: impl FnMut(&FormatEvent) + Send + 'static) {
        self.observers.push(Box::new(observer));
    }

    fn notify(&mut self, event: FormatEvent) {
        for observer in &mut self.observers {
            observer(&event);
        }
    }

    /// Replace a device's format record.
    ///
    /// Checks size bounds for formats that do not exist yet, refuses to
    /// replace an immutable on-disk format, keeps the `_netdev` mount
    /// option consistent with the device's ancestry, and fires the
    /// `format_removed`/`format_added` observers.
    pub fn set_format(&mut self, id: DeviceId, format: Format) -> Result<()> {
        let device = self.get(id)?;
        let device_name = device.name().to_string();

        if device.common.format.immutable && device.common.format.exists {
            return Err(ModelError::format(
                &device_name,
                "current format is immutable and cannot be replaced",
            ));
        }

        if !format.exists {
            let size = device.size();
            if format.max_size > Size::ZERO && size > format.max_size {
                return Err(ModelError::format(&device_name, "device is too large for new format"));
            }
            if format.min_size > Size::ZERO && size < format.min_size {
                return Err(ModelError::format(&device_name, "device is too small for new format"));
            }
        }

        let old_kind = device.common.format.kind.name().to_string();
        let new_kind = format.kind.name().to_string();

        self.notify(FormatEvent::Removed {
            device: id,
            kind: old_kind,
        });
        self.get_mut(id)?.common.format = format;
        self.update_netdev_option(id)?;
        self.notify(FormatEvent::Added {
            device: id,
            kind: new_kind,
        });

        // non-existing snapshots mirror their origin's format
        crate::container::lvm::propagate_format_to_snapshots(self, id);
        Ok(())
    }

    /// Restore the format that was discovered on disk.
    pub fn reset_format(&mut self, id: DeviceId) -> Result<()> {
        let original = self.get(id)?.common.original_format.clone();
        self.set_format(id, original)
    }

    /// Whether any ancestor is a network-backed device.
    pub fn is_network_backed(&self, id: DeviceId) -> bool {
        self.ancestors(id)
            .unwrap_or_default()
            .iter()
            .filter_map(|ancestor| self.get(*ancestor).ok())
            .any(|device| device.common.tags.contains(&Tag::Remote))
    }

    /// Keep the `_netdev` mount option consistent with ancestry.
    pub(crate) fn update_netdev_option(&mut self, id: DeviceId) -> Result<()> {
        const NETDEV: &str = "_netdev";
        let is_netdev = self.is_network_backed(id);
        let device = self.get_mut(id)?;
        let format = &mut device.common.format;
        if !format.kind.mountable() {
            return Ok(());
        }
        let has_option = format.options.iter().any(|option| option == NETDEV);
        let user_option = format.user_options.iter().any(|option| option == NETDEV);
        if !is_netdev && has_option && !user_option {
            format.options.retain(|option| option != NETDEV);
        } else if is_netdev && !has_option {
            format.options.push(NETDEV.to_string());
        }
        Ok(())
    }

    //
    // attribute mutation
    //

    /// Rename a device, returning the previous name.
    pub fn rename(&mut self, id: DeviceId, new_name: &str) -> Result<String> {
        let device = self.get(id)?;
        let valid = match &device.kind {
            DeviceKind::LvmVolumeGroup(_) => name::is_lvm_name_valid(new_name),
            DeviceKind::LvmLogicalVolume(data) => {
                data.is_internal() || name::is_lvm_name_valid(new_name)
            }
            DeviceKind::BtrfsVolume(_) | DeviceKind::BtrfsSubvolume(_) => {
                name::is_btrfs_name_valid(new_name)
            }
            DeviceKind::File(_) | DeviceKind::Directory => name::is_path_name_valid(new_name),
            _ => name::is_device_name_valid(new_name),
        };
        self.check_new_name(new_name, valid)?;
        let device = self.get_mut(id)?;
        let old = std::mem::replace(&mut device.common.name, new_name.to_string());
        Ok(old)
    }

    /// Change a device's size, enforcing its format's bounds for planned
    /// devices.
    pub fn set_device_size(&mut self, id: DeviceId, new_size: Size) -> Result<()> {
        let device = self.get(id)?;
        if new_size < Size::ZERO {
            return Err(ModelError::Value("device size cannot be negative".into()));
        }
        if !device.exists() {
            let format = &device.common.format;
            if format.max_size > Size::ZERO && new_size > format.max_size {
                return Err(ModelError::device(device.name(), "device cannot outgrow its format"));
            }
            if format.min_size > Size::ZERO && new_size < format.min_size {
                return Err(ModelError::device(
                    device.name(),
                    "device cannot shrink below its format minimum",
                ));
            }
        }
        self.get_mut(id)?.common.size = new_size;
        Ok(())
    }

    pub fn tag(&mut self, id: DeviceId, tag: Tag) -> Result<()> {
        self.get_mut(id)?.common.tags.insert(tag);
        Ok(())
    }

    pub fn set_sysfs_path(&mut self, id: DeviceId, path: Option<String>) -> Result<()> {
        self.get_mut(id)?.common.sysfs_path = path;
        Ok(())
    }

    pub fn set_format_label(&mut self, id: DeviceId, label: Option<String>) -> Result<()> {
        self.get_mut(id)?.common.format.label = label;
        Ok(())
    }

    pub fn set_format_exists(&mut self, id: DeviceId, exists: bool) -> Result<()> {
        self.get_mut(id)?.common.format.exists = exists;
        Ok(())
    }

    pub fn set_device_uuid(&mut self, id: DeviceId, uuid: Option<String>) -> Result<()> {
        self.get_mut(id)?.common.uuid = uuid;
        Ok(())
    }

    /// Stamp a member format's aggregate cross-reference UUID.
    pub fn set_member_container_uuid(&mut self, id: DeviceId, uuid: Option<String>) -> Result<()> {
        self.get_mut(id)?.common.format.set_container_uuid(uuid);
        Ok(())
    }

    /// Flip a device to existing/active after its creation succeeded.
    pub fn mark_created(&mut self, id: DeviceId) -> Result<()> {
        let device = self.get_mut(id)?;
        device.common.exists = true;
        device.common.state = DeviceState::Active;
        Ok(())
    }

    pub fn set_device_state(&mut self, id: DeviceId, state: DeviceState) -> Result<()> {
        self.get_mut(id)?.common.state = state;
        Ok(())
    }

    //
    // simple factories
    //

    pub fn new_disk(
        &mut self,
        disk_name: &str,
        size: Size,
        sector_size: u64,
        exists: bool,
    ) -> Result<DeviceId> {
        self.check_new_name(disk_name, name::is_device_name_valid(disk_name))?;
        let id = self.alloc_id();
        let mut device = Device::new(
            id,
            disk_name.to_string(),
            size,
            exists,
            DeviceKind::Disk(DiskData { sector_size }),
        );
        if exists {
            device.common.state = DeviceState::Active;
        }
        device.common.tags.insert(Tag::Local);
        Ok(self.insert(device))
    }

    pub fn new_partition(
        &mut self,
        part_name: &str,
        disk: DeviceId,
        size: Size,
        part_type: PartType,
        bootable: bool,
        exists: bool,
    ) -> Result<DeviceId> {
        self.check_new_name(part_name, name::is_device_name_valid(part_name))?;
        let parent = self.get(disk)?;
        if size > parent.size() {
            return Err(ModelError::device(
                part_name,
                "partition cannot be larger than its disk",
            ));
        }
        let id = self.alloc_id();
        let mut data = PartitionData::new(part_type);
        data.bootable = bootable;
        let device = Device::new(
            id,
            part_name.to_string(),
            size,
            exists,
            DeviceKind::Partition(data),
        );
        self.insert(device);
        if let Err(e) = self.add_parent(id, disk) {
            self.devices.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn new_luks(&mut self, dm_name: &str, parent: DeviceId, exists: bool) -> Result<DeviceId> {
        self.check_new_name(dm_name, name::is_device_name_valid(dm_name))?;
        let backing = self.get(parent)?;
        let size = backing.size() - LUKS_METADATA_SIZE;
        let id = self.alloc_id();
        let device = Device::new(id, dm_name.to_string(), size, exists, DeviceKind::Luks);
        self.insert(device);
        if let Err(e) = self.add_parent(id, parent) {
            self.devices.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn new_dm_linear(
        &mut self,
        dm_name: &str,
        parent: DeviceId,
        size: Size,
        exists: bool,
    ) -> Result<DeviceId> {
        self.check_new_name(dm_name, name::is_device_name_valid(dm_name))?;
        self.get(parent)?;
        let id = self.alloc_id();
        let device = Device::new(id, dm_name.to_string(), size, exists, DeviceKind::DmLinear);
        self.insert(device);
        if let Err(e) = self.add_parent(id, parent) {
            self.devices.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn new_dm_crypt(
        &mut self,
        dm_name: &str,
        parent: DeviceId,
        size: Size,
        exists: bool,
    ) -> Result<DeviceId> {
        self.check_new_name(dm_name, name::is_device_name_valid(dm_name))?;
        self.get(parent)?;
        let id = self.alloc_id();
        let device = Device::new(id, dm_name.to_string(), size, exists, DeviceKind::DmCrypt);
        self.insert(device);
        if let Err(e) = self.add_parent(id, parent) {
            self.devices.remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub fn new_file_device(
        &mut self,
        path: &str,
        size: Size,
        sparse: bool,
        exists: bool,
    ) -> Result<DeviceId> {
        self.check_new_name(path, name::is_path_name_valid(path))?;
        let id = self.alloc_id();
        let device = Device::new(
            id,
            path.to_string(),
            size,
            exists,
            DeviceKind::File(FileData {
                path: path.to_string(),
                sparse,
            }),
        );
        Ok(self.insert(device))
    }

    pub fn new_directory_device(&mut self, path: &str, exists: bool) -> Result<DeviceId> {
        self.check_new_name(path, name::is_path_name_valid(path))?;
        let id = self.alloc_id();
        let device = Device::new(id, path.to_string(), Size::ZERO, exists, DeviceKind::Directory);
        Ok(self.insert(device))
    }

    pub fn new_nodev(&mut self, fs_name: &str) -> Result<DeviceId> {
        self.check_new_name(fs_name, name::is_device_name_valid(fs_name))?;
        let id = self.alloc_id();
        let device = Device::new(id, fs_name.to_string(), Size::ZERO, true, DeviceKind::NoDevice);
        Ok(self.insert(device))
    }

    /// The effective size of a device, computing aggregate sizes from the
    /// graph for containers that do not exist yet.
    pub fn device_size(&self, id: DeviceId) -> Result<Size> {
        let device = self.get(id)?;
        match &device.kind {
            DeviceKind::MdArray(_) if !device.exists() => {
                crate::container::md::array_size(self, id)
            }
            DeviceKind::LvmVolumeGroup(_) => crate::container::lvm::vg_size(self, id),
            DeviceKind::BtrfsVolume(_) => crate::container::btrfs::volume_size(self, id),
            _ => Ok(device.size()),
        }
    }

    /// Remove a leaf device from the tree, detaching it from its parents.
    ///
    /// Logical volumes route through [`DeviceTree::vg_remove_lv`] so the
    /// volume-group accounting stays consistent. The removed device is
    /// returned so callers can restore it (action cancellation, destroy
    /// bookkeeping).
    pub fn remove_leaf(&mut self, id: DeviceId) -> Result<Device> {
        let device = self.get(id)?;
        if !device.is_leaf() {
            return Err(ModelError::device(device.name(), "device still has dependents"));
        }
        if let DeviceKind::LvmLogicalVolume(_) = device.kind {
            let snapshot = device.clone();
            self.vg_remove_lv(id)?;
            return Ok(snapshot);
        }
        if let DeviceKind::BtrfsSubvolume(_) = device.kind {
            let snapshot = device.clone();
            let volume = self.btrfs_volume_of(id)?;
            let subvol_name = snapshot.name().to_string();
            self.btrfs_remove_subvolume(volume, &subvol_name)?;
            return Ok(snapshot);
        }

        let parents = device.parents().to_vec();
        for parent in parents {
            self.get_mut(id)?.common.parents.retain(|p| *p != parent);
            self.get_mut(parent)?.common.children.retain(|c| *c != id);
        }
        self.extra_deps
            .retain(|(dependent, dependency)| *dependent != id && *dependency != id);
        self.devices
            .remove(&id)
            .ok_or_else(|| ModelError::NotFound(id.to_string()))
    }

    /// Put a previously removed device back, re-attaching its edges and
    /// re-registering container bookkeeping (VG LV lists, PV space,
    /// subvolume lists).
    pub fn restore(&mut self, device: Device) -> Result<DeviceId> {
        let id = device.id();
        let parents = device.parents().to_vec();
        let kind_is_lv = matches!(device.kind, DeviceKind::LvmLogicalVolume(_));
        let kind_is_subvol = matches!(device.kind, DeviceKind::BtrfsSubvolume(_));
        self.devices.insert(id, device);
        for parent in parents {
            let parent_dev = self.get_mut(parent)?;
            if !parent_dev.common.children.contains(&id) {
                parent_dev.common.children.push(id);
            }
        }
        if kind_is_lv {
            crate::container::lvm::reregister_lv(self, id)?;
        }
        if kind_is_subvol {
            let volume = self.btrfs_volume_of(id)?;
            if let Ok(volume_dev) = self.get_mut(volume) {
                if let DeviceKind::BtrfsVolume(data) = &mut volume_dev.kind {
                    if !data.subvolumes.contains(&id) {
                        data.subvolumes.push(id);
                    }
                }
            }
        }
        Ok(id)
    }

    /// Logical sector size of the disk(s) a device is built on.
    pub fn device_sector_size(&self, id: DeviceId) -> u64 {
        self.ancestors(id)
            .unwrap_or_default()
            .iter()
            .filter_map(|ancestor| self.get(*ancestor).ok())
            .find_map(|device| match &device.kind {
                DeviceKind::Disk(data) => Some(data.sector_size),
                _ => None,
            })
            .unwrap_or(512)
    }

    pub(crate) fn add_extra_dep(&mut self, dependent: DeviceId, dependency: DeviceId) {
        if !self
            .extra_deps
            .iter()
            .any(|(a, b)| *a == dependent && *b == dependency)
        {
            self.extra_deps.push((dependent, dependency));
        }
    }
}
