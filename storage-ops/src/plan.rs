// SPDX-License-Identifier: GPL-3.0-only

//! The action queue: mutate the graph, queue the change, execute later.
//!
//! Queue operations commit their effect to the in-memory graph
//! immediately, so sizing and free-space queries always reflect pending
//! changes. Execution replays the queued actions against the system in
//! scheduled order through a [`Runner`]; a failure stops the pass and
//! leaves earlier actions committed.

use storage_model::{
    Device, DeviceId, DeviceKind, DeviceTree, Format, FormatKind, LvSegment, ModelError,
};
use storage_raid::canonical_from_mduuid;
use storage_units::{Size, Unit};
use tracing::{debug, info, warn};

use crate::action::{Action, ActionId, ActionKind};
use crate::cmds;
use crate::error::{OpsError, Result};
use crate::mdconf::MdadmConf;
use crate::runner::{OpDescriptor, Runner};
use crate::schedule::schedule;

/// Queues actions against a device tree and executes them.
#[derive(Debug, Default)]
pub struct Planner {
    actions: Vec<Action>,
    next_id: ActionId,
    /// When set, discovered and newly created arrays are persisted here.
    pub mdadm_conf: Option<MdadmConf>,
}

impl Planner {
    pub fn new() -> Planner {
        Planner::default()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    fn enqueue(&mut self, tree: &DeviceTree, device: DeviceId, kind: ActionKind) -> ActionId {
        self.next_id += 1;
        let action = Action::new(self.next_id, tree, device, kind);
        debug!(action = %action.describe(tree), "queued");
        self.actions.push(action);
        self.next_id
    }

    //
    // queue operations
    //

    /// Record the creation of a device already added to the graph through
    /// a factory operation.
    pub fn create_device(&mut self, tree: &DeviceTree, device: DeviceId) -> Result<ActionId> {
        let target = tree.get(device)?;
        if target.exists() {
            return Err(ModelError::device(target.name(), "device already exists").into());
        }
        Ok(self.enqueue(tree, device, ActionKind::CreateDevice))
    }

    /// Replace a device's format and queue the formatting work.
    pub fn create_format(
        &mut self,
        tree: &mut DeviceTree,
        device: DeviceId,
        format: Format,
    ) -> Result<ActionId> {
        let previous = tree.get(device)?.format().clone();
        tree.set_format(device, format)?;
        Ok(self.enqueue(tree, device, ActionKind::CreateFormat { previous }))
    }

    /// Attach `member` to a container and queue the on-disk addition.
    pub fn add_member(
        &mut self,
        tree: &mut DeviceTree,
        container: DeviceId,
        member: DeviceId,
    ) -> Result<ActionId> {
        tree.add_parent(container, member)?;
        Ok(self.enqueue(tree, member, ActionKind::AddMember { container }))
    }

    /// Detach `member` from a container and queue the on-disk removal.
    pub fn remove_member(
        &mut self,
        tree: &mut DeviceTree,
        container: DeviceId,
        member: DeviceId,
    ) -> Result<ActionId> {
        tree.remove_parent(container, member)?;
        Ok(self.enqueue(tree, member, ActionKind::RemoveMember { container }))
    }

    pub fn rename_device(
        &mut self,
        tree: &mut DeviceTree,
        device: DeviceId,
        new_name: &str,
    ) -> Result<ActionId> {
        let previous = tree.rename(device, new_name)?;
        Ok(self.enqueue(
            tree,
            device,
            ActionKind::ConfigureDevice {
                attr: "name",
                previous,
                new_value: new_name.to_string(),
            },
        ))
    }

    pub fn set_format_label(
        &mut self,
        tree: &mut DeviceTree,
        device: DeviceId,
        label: &str,
    ) -> Result<ActionId> {
        let previous = tree.get(device)?.format().label.clone().unwrap_or_default();
        tree.set_format_label(device, Some(label.to_string()))?;
        Ok(self.enqueue(
            tree,
            device,
            ActionKind::ConfigureFormat {
                attr: "label",
                previous,
                new_value: label.to_string(),
            },
        ))
    }

    /// Queue a device resize; the model reflects the new size immediately.
    pub fn resize_device(
        &mut self,
        tree: &mut DeviceTree,
        device: DeviceId,
        new_size: Size,
    ) -> Result<ActionId> {
        let target = tree.get(device)?;
        if !target.exists() {
            return Err(ModelError::device(target.name(), "only existing devices can be resized").into());
        }
        let from = target.size();
        tree.set_device_size(device, new_size)?;
        Ok(self.enqueue(tree, device, ActionKind::ResizeDevice { from, to: new_size }))
    }

    /// Queue a filesystem resize.
    pub fn resize_format(
        &mut self,
        tree: &mut DeviceTree,
        device: DeviceId,
        new_size: Size,
    ) -> Result<ActionId> {
        let target = tree.get(device)?;
        if !target.format().resizable {
            return Err(ModelError::format(target.name(), "format is not resizable").into());
        }
        let from = target.size();
        Ok(self.enqueue(tree, device, ActionKind::ResizeFormat { from, to: new_size }))
    }

    /// Strip a device's format and queue the wipe.
    pub fn destroy_format(&mut self, tree: &mut DeviceTree, device: DeviceId) -> Result<ActionId> {
        let previous = tree.get(device)?.format().clone();
        tree.set_format(device, Format::none())?;
        Ok(self.enqueue(tree, device, ActionKind::DestroyFormat { previous }))
    }

    /// Remove a leaf device from the graph and queue its destruction.
    pub fn destroy_device(&mut self, tree: &mut DeviceTree, device: DeviceId) -> Result<ActionId> {
        // capture ordering context before the device leaves the graph
        self.next_id += 1;
        let id = self.next_id;
        let placeholder = Action::new(id, tree, device, ActionKind::CreateDevice);
        let snapshot = tree.remove_leaf(device)?;
        let mut action = placeholder;
        action.kind = ActionKind::DestroyDevice {
            snapshot: Box::new(snapshot),
        };
        debug!(action = %action.describe(tree), "queued");
        self.actions.push(action);
        Ok(id)
    }

    //
    // cancellation
    //

    /// Remove a queued action, reverting its in-memory effect.
    ///
    /// Executed actions are permanent.
    pub fn cancel(&mut self, tree: &mut DeviceTree, action_id: ActionId) -> Result<()> {
        let position = self
            .actions
            .iter()
            .position(|action| action.id == action_id)
            .ok_or_else(|| ModelError::NotFound(format!("action {action_id}")))?;
        if self.actions[position].executed {
            return Err(OpsError::AlreadyExecuted(
                self.actions[position].describe(tree),
            ));
        }
        let action = self.actions.remove(position);

        match action.kind {
            ActionKind::CreateDevice => {
                tree.remove_leaf(action.device)?;
            }
            ActionKind::CreateFormat { previous } | ActionKind::DestroyFormat { previous } => {
                tree.set_format(action.device, previous)?;
            }
            ActionKind::AddMember { container } => {
                tree.remove_parent(container, action.device)?;
            }
            ActionKind::RemoveMember { container } => {
                tree.add_parent(container, action.device)?;
            }
            ActionKind::ConfigureDevice { attr: "name", previous, .. } => {
                tree.rename(action.device, &previous)?;
            }
            ActionKind::ConfigureDevice { .. } => {}
            ActionKind::ConfigureFormat { attr: "label", previous, .. } => {
                let label = if previous.is_empty() { None } else { Some(previous) };
                tree.set_format_label(action.device, label)?;
            }
            ActionKind::ConfigureFormat { .. } => {}
            ActionKind::ResizeDevice { from, .. } => {
                tree.set_device_size(action.device, from)?;
            }
            ActionKind::ResizeFormat { .. } => {}
            ActionKind::DestroyDevice { snapshot } => {
                tree.restore(*snapshot)?;
            }
        }
        Ok(())
    }

    //
    // execution
    //

    /// Execute every queued action in scheduled order.
    pub fn execute(&mut self, tree: &mut DeviceTree, runner: &mut dyn Runner) -> Result<()> {
        let order = schedule(&self.actions);
        for index in order {
            if self.actions[index].executed {
                continue;
            }
            let description = self.actions[index].describe(tree);
            info!(action = %description, "executing");
            if let Err(source) = self.execute_one(tree, runner, index) {
                return Err(OpsError::Action {
                    action: description,
                    source: Box::new(source),
                });
            }
            self.actions[index].executed = true;
        }
        Ok(())
    }

    fn execute_one(
        &mut self,
        tree: &mut DeviceTree,
        runner: &mut dyn Runner,
        index: usize,
    ) -> Result<()> {
        let action = self.actions[index].clone();
        match &action.kind {
            ActionKind::CreateDevice => self.run_create_device(tree, runner, action.device),
            ActionKind::CreateFormat { .. } => run_create_format(tree, runner, action.device),
            ActionKind::AddMember { container } => {
                run_add_member(tree, runner, *container, action.device)
            }
            ActionKind::RemoveMember { container } => {
                run_remove_member(tree, runner, *container, action.device)
            }
            ActionKind::ConfigureDevice { attr: "name", previous, new_value } => {
                run_rename(tree, runner, action.device, previous, new_value)
            }
            ActionKind::ConfigureDevice { .. } => Ok(()),
            ActionKind::ConfigureFormat { attr: "label", new_value, .. } => {
                run_relabel(tree, runner, action.device, new_value)
            }
            ActionKind::ConfigureFormat { .. } => Ok(()),
            ActionKind::ResizeDevice { to, .. } => run_resize_device(tree, runner, action.device, *to),
            ActionKind::ResizeFormat { to, .. } => run_resize_format(tree, runner, action.device, *to),
            ActionKind::DestroyFormat { previous } => {
                run_destroy_format(tree, runner, action.device, previous)
            }
            ActionKind::DestroyDevice { snapshot } => run_destroy_device(tree, runner, snapshot),
        }
    }

    fn run_create_device(
        &mut self,
        tree: &mut DeviceTree,
        runner: &mut dyn Runner,
        device: DeviceId,
    ) -> Result<()> {
        // parents must already be on disk
        let target = tree.get(device)?;
        for parent in target.parents() {
            let parent_dev = tree.get(*parent)?;
            if !parent_dev.exists() {
                return Err(ModelError::device(
                    target.name(),
                    format!("parent {} has not been created", parent_dev.name()),
                )
                .into());
            }
        }

        let ops = build_create_ops(tree, device)?;
        for op in &ops {
            run_checked(runner, op)?;
        }

        tree.mark_created(device)?;

        if matches!(tree.get(device)?.kind, DeviceKind::MdArray(_)) {
            self.post_create_md(tree, runner, device)?;
        }
        if matches!(tree.get(device)?.kind, DeviceKind::LvmVolumeGroup(_)) {
            tree.vg_mark_complete(device)?;
        }
        Ok(())
    }

    /// New arrays report their UUID only through `mdadm --detail`; read it
    /// back, stamp the members, persist the array, and clear any stale LVM
    /// metadata the new array may expose.
    fn post_create_md(
        &mut self,
        tree: &mut DeviceTree,
        runner: &mut dyn Runner,
        device: DeviceId,
    ) -> Result<()> {
        let path = tree.get(device)?.path();
        let detail = run_checked(runner, &cmds::md_detail(&path))?;
        let pairs = cmds::parse_md_detail(&detail.stdout_text());
        let uuid = pairs
            .iter()
            .find(|(label, _)| label == "UUID")
            .and_then(|(_, value)| canonical_from_mduuid(value).ok());

        if let Some(uuid) = uuid {
            tree.set_device_uuid(device, Some(uuid.clone()))?;
            for member in tree.get(device)?.parents().to_vec() {
                tree.set_member_container_uuid(member, Some(uuid.clone()))?;
            }
            if let Some(conf) = &self.mdadm_conf {
                if let Some(mdadm_uuid) = tree.md_mdadm_uuid(device)? {
                    conf.note_array(&path, &mdadm_uuid)?;
                }
            }
        } else {
            warn!(array = %path, "mdadm --detail reported no UUID");
        }

        // a new array can surface stale LVM metadata from its members'
        // previous life
        let pv_query = run_checked(runner, &cmds::pv_info(&path));
        if let Ok(output) = pv_query {
            let text = output.stdout_text();
            let stale_vg = text
                .lines()
                .filter_map(|line| line.trim().split('\t').nth(1))
                .find(|vg_name| !vg_name.is_empty());
            if let Some(vg_name) = stale_vg {
                info!(array = %path, vg = vg_name, "removing stale LVM metadata");
                run_checked(runner, &cmds::vg_remove(vg_name))?;
            }
        }
        Ok(())
    }
}

pub(crate) fn run_checked(
    runner: &mut dyn Runner,
    op: &OpDescriptor,
) -> Result<crate::runner::RunnerOutput> {
    let output = runner.run(op)?;
    if !output.success() {
        return Err(OpsError::Tool {
            op: op.clone(),
            exit_code: output.exit_code,
            stderr: output.stderr_text(),
        });
    }
    Ok(output)
}

fn mib(size: Size) -> i64 {
    size.convert_to(Unit::MiB) as i64
}

/// The staging mountpoint used to manipulate btrfs subvolumes when the
/// volume is not mounted.
const BTRFS_STAGING: &str = "/run/storage/btrfs";

fn btrfs_workspace(tree: &DeviceTree, volume: DeviceId) -> Result<(Vec<OpDescriptor>, String, Vec<OpDescriptor>)> {
    let device = tree.get(volume)?;
    if let Some(mountpoint) = &device.format().mountpoint {
        return Ok((Vec::new(), mountpoint.clone(), Vec::new()));
    }
    let mount = cmds::mount(&device.path(), BTRFS_STAGING, None);
    let umount = cmds::umount(BTRFS_STAGING);
    Ok((vec![mount], BTRFS_STAGING.to_string(), vec![umount]))
}

fn build_create_ops(tree: &DeviceTree, device: DeviceId) -> Result<Vec<OpDescriptor>> {
    let target = tree.get(device)?;
    let parent_paths: Vec<String> = target
        .parents()
        .iter()
        .filter_map(|parent| tree.get(*parent).ok())
        .map(|parent| parent.path())
        .collect();
    let parent_refs: Vec<&str> = parent_paths.iter().map(String::as_str).collect();

    let ops = match &target.kind {
        DeviceKind::Partition(data) => {
            let disk = target.parents().first().copied().ok_or_else(|| {
                ModelError::device(target.name(), "partition has no disk")
            })?;
            let disk_path = tree.get(disk)?.path();
            let (start, end) = match data.geometry {
                Some((start_sector, end_sector)) => (
                    (start_sector * 512 / (1 << 20)) as i64,
                    (end_sector * 512 / (1 << 20)) as i64,
                ),
                None => (1, 1 + mib(target.size())),
            };
            let type_name = match data.part_type {
                storage_model::PartType::Primary => "primary",
                storage_model::PartType::Logical => "logical",
                storage_model::PartType::Extended => "extended",
            };
            vec![
                cmds::parted_mkpart(&disk_path, type_name, start, end),
                cmds::kpartx_update(&disk_path),
            ]
        }
        DeviceKind::MdArray(data) => {
            let bitmap = data.level.has_redundancy()
                && !matches!(target.format().kind, FormatKind::Swap);
            vec![cmds::md_create(
                &target.path(),
                data.level.name(),
                &parent_refs,
                data.spares(),
                data.metadata_version.as_deref(),
                bitmap,
                Some(data.chunk_size),
            )]
        }
        DeviceKind::LvmVolumeGroup(data) => {
            vec![cmds::vg_create(target.name(), &parent_refs, data.pe_size)]
        }
        DeviceKind::LvmLogicalVolume(data) => {
            let vg = tree.lv_volume_group(device)?;
            let vg_name = tree.get(vg)?.name().to_string();
            build_lv_create_ops(tree, &vg_name, target, data)?
        }
        DeviceKind::BtrfsVolume(data) => {
            vec![cmds::mkfs_btrfs(
                &parent_refs,
                data.data_level.map(|level| level.name()),
                data.metadata_level.map(|level| level.name()),
                target.format().label.as_deref(),
            )]
        }
        DeviceKind::BtrfsSubvolume(data) => {
            let volume = tree.btrfs_volume_of(device)?;
            let (mut ops, mountpoint, cleanup) = btrfs_workspace(tree, volume)?;
            match data.snapshot_source {
                Some(source) => {
                    let source_name = tree.get(source)?.name().to_string();
                    ops.push(cmds::btrfs_subvol_snapshot(
                        &mountpoint,
                        &source_name,
                        target.name(),
                    ));
                }
                None => ops.push(cmds::btrfs_subvol_create(&mountpoint, target.name())),
            }
            ops.extend(cleanup);
            ops
        }
        DeviceKind::Luks => {
            let backing = parent_refs.first().copied().unwrap_or_default();
            vec![cmds::luks_open(backing, target.name(), "")]
        }
        DeviceKind::File(file) => {
            if file.sparse {
                vec![cmds::dd_wipe_start(&file.path, 0)]
            } else {
                vec![cmds::dd_wipe_start(&file.path, (target.size().bytes() / 512) as u64)]
            }
        }
        // directories, tmpfs and dm maps need no tool invocation here
        _ => Vec::new(),
    };
    Ok(ops)
}

fn build_lv_create_ops(
    tree: &DeviceTree,
    vg_name: &str,
    target: &Device,
    data: &storage_model::device::LvData,
) -> Result<Vec<OpDescriptor>> {
    let pv_paths: Vec<String> = data
        .pv_specs
        .iter()
        .filter_map(|spec| tree.get(spec.pv).ok())
        .map(|pv| pv.path())
        .collect();
    let pv_refs: Vec<&str> = pv_paths.iter().map(String::as_str).collect();

    if let Some(origin) = data.origin {
        let origin_name = tree.get(origin)?.name().to_string();
        if data.is_thin_lv() {
            return Ok(vec![cmds::thin_snapshot(vg_name, &origin_name, target.name())]);
        }
        return Ok(vec![cmds::lv_snapshot(
            vg_name,
            &origin_name,
            target.name(),
            target.size(),
        )]);
    }

    match &data.segment {
        LvSegment::ThinPool {
            chunk_size,
            from_lvs,
            ..
        } => match from_lvs {
            Some((data_lv, meta_lv)) => {
                let data_name = tree.get(*data_lv)?.name().to_string();
                let meta_name = tree.get(*meta_lv)?.name().to_string();
                Ok(vec![cmds::thpool_convert(vg_name, &data_name, &meta_name)])
            }
            None => Ok(vec![cmds::thpool_create(
                vg_name,
                target.name(),
                target.size(),
                data.metadata_size,
                *chunk_size,
            )]),
        },
        LvSegment::Thin => {
            let pool = target.parents().first().copied().ok_or_else(|| {
                ModelError::device(target.name(), "thin volume has no pool")
            })?;
            let pool_name = tree.get(pool)?.name().to_string();
            Ok(vec![cmds::thin_create(
                vg_name,
                &pool_name,
                target.name(),
                target.size(),
            )])
        }
        _ if data.cached() => {
            let cache = data.cache.as_ref().ok_or_else(|| {
                ModelError::device(target.name(), "cached LV lost its cache request")
            })?;
            let fast_paths: Vec<String> = cache
                .fast_pvs
                .iter()
                .filter_map(|spec| tree.get(spec.pv).ok())
                .map(|pv| pv.path())
                .collect();
            let fast_refs: Vec<&str> = fast_paths.iter().map(String::as_str).collect();
            Ok(cmds::cache_create_cached_lv(
                vg_name,
                target.name(),
                target.size(),
                cache.size,
                cache.md_size,
                &cache.mode,
                &pv_refs,
                &fast_refs,
            ))
        }
        LvSegment::Raid(level) => Ok(vec![cmds::lv_create(
            vg_name,
            target.name(),
            target.size(),
            Some(level.name()),
            &pv_refs,
        )]),
        LvSegment::Mirror => Ok(vec![cmds::lv_create(
            vg_name,
            target.name(),
            target.size(),
            Some("mirror"),
            &pv_refs,
        )]),
        _ => Ok(vec![cmds::lv_create(
            vg_name,
            target.name(),
            target.size(),
            None,
            &pv_refs,
        )]),
    }
}

fn run_create_format(tree: &mut DeviceTree, runner: &mut dyn Runner, device: DeviceId) -> Result<()> {
    let target = tree.get(device)?;
    if !target.exists() {
        return Err(ModelError::format(target.name(), "device has not been created").into());
    }
    let path = target.path();
    let format = target.format().clone();

    let ops: Vec<OpDescriptor> = match &format.kind {
        FormatKind::None => Vec::new(),
        FormatKind::PartitionTable { label } => {
            let label_name = match label {
                storage_model::DisklabelType::Gpt => "gpt",
                storage_model::DisklabelType::Msdos => "msdos",
                storage_model::DisklabelType::Dasd => "dasd",
                storage_model::DisklabelType::Mac => "mac",
            };
            vec![cmds::parted_mklabel(&path, label_name)]
        }
        FormatKind::LvmPv { .. } => vec![cmds::pv_create(&path)],
        // member superblocks are written by the aggregate's own creation
        FormatKind::MdMember { .. } | FormatKind::BtrfsMember { .. } | FormatKind::Btrfs => {
            Vec::new()
        }
        FormatKind::Luks { cipher, key_size, .. } => {
            vec![cmds::luks_format(&path, "", cipher, *key_size)]
        }
        kind => {
            let extra = match &tree.get(device)?.kind {
                DeviceKind::MdArray(_) => tree.md_format_args(device)?,
                _ => Vec::new(),
            };
            vec![cmds::mkfs(kind.name(), &path, format.label.as_deref(), &extra)]
        }
    };

    for op in &ops {
        run_checked(runner, op)?;
    }
    tree.set_format_exists(device, true)?;
    Ok(())
}

fn run_add_member(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    container: DeviceId,
    member: DeviceId,
) -> Result<()> {
    let ops: Vec<OpDescriptor> = {
        let container_dev = tree.get(container)?;
        let member_path = tree.get(member)?.path();
        match &container_dev.kind {
            DeviceKind::MdArray(data) => {
                let raid_devices = if data.level.has_redundancy() {
                    None
                } else {
                    Some(data.member_devices)
                };
                vec![cmds::md_add(&container_dev.path(), &member_path, raid_devices)]
            }
            DeviceKind::LvmVolumeGroup(_) => {
                vec![cmds::vg_extend(container_dev.name(), &member_path)]
            }
            DeviceKind::BtrfsVolume(_) => {
                let (mut ops, mountpoint, cleanup) = btrfs_workspace(tree, container)?;
                ops.push(cmds::btrfs_device_add(&mountpoint, &member_path));
                ops.extend(cleanup);
                ops
            }
            _ => {
                return Err(ModelError::device(
                    container_dev.name(),
                    "not a member-bearing container",
                )
                .into());
            }
        }
    };
    for op in &ops {
        run_checked(runner, op)?;
    }
    let uuid = tree.get(container)?.common.uuid.clone();
    tree.set_member_container_uuid(member, uuid)?;
    Ok(())
}

fn run_remove_member(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    container: DeviceId,
    member: DeviceId,
) -> Result<()> {
    let ops: Vec<OpDescriptor> = {
        let container_dev = tree.get(container)?;
        let member_dev = tree.get(member)?;
        let member_path = member_dev.path();
        match &container_dev.kind {
            DeviceKind::MdArray(_) => {
                // active members must be failed before removal
                let fail = member_dev.status();
                vec![cmds::md_remove(&container_dev.path(), &member_path, fail)]
            }
            DeviceKind::LvmVolumeGroup(_) => {
                // evacuate allocated extents before shrinking the VG
                vec![
                    cmds::pv_move(&member_path),
                    cmds::vg_reduce(container_dev.name(), &member_path),
                ]
            }
            DeviceKind::BtrfsVolume(_) => {
                let (mut ops, mountpoint, cleanup) = btrfs_workspace(tree, container)?;
                ops.push(cmds::btrfs_device_remove(&mountpoint, &member_path));
                ops.extend(cleanup);
                ops
            }
            _ => {
                return Err(ModelError::device(
                    container_dev.name(),
                    "not a member-bearing container",
                )
                .into());
            }
        }
    };
    for op in &ops {
        run_checked(runner, op)?;
    }
    tree.set_member_container_uuid(member, None)?;
    Ok(())
}

fn run_rename(
    tree: &DeviceTree,
    runner: &mut dyn Runner,
    device: DeviceId,
    previous: &str,
    new_name: &str,
) -> Result<()> {
    let target = tree.get(device)?;
    let op = match &target.kind {
        DeviceKind::LvmVolumeGroup(_) => Some(OpDescriptor::new("vgrename", &[previous, new_name])),
        DeviceKind::LvmLogicalVolume(_) => {
            let vg = tree.lv_volume_group(device)?;
            let vg_name = tree.get(vg)?.name().to_string();
            Some(OpDescriptor::new("lvrename", &[&vg_name, previous, new_name]))
        }
        _ => None,
    };
    if let Some(op) = op {
        run_checked(runner, &op)?;
    }
    Ok(())
}

fn run_relabel(tree: &DeviceTree, runner: &mut dyn Runner, device: DeviceId, label: &str) -> Result<()> {
    let target = tree.get(device)?;
    let path = target.path();
    let op = match &target.format().kind {
        FormatKind::Ext2 | FormatKind::Ext3 | FormatKind::Ext4 => {
            Some(OpDescriptor::new("e2label", &[&path, label]))
        }
        FormatKind::Xfs => Some(OpDescriptor::new("xfs_admin", &["-L", label, &path])),
        FormatKind::Btrfs => Some(OpDescriptor::new(
            "btrfs",
            &["filesystem", "label", &path, label],
        )),
        FormatKind::Swap => Some(OpDescriptor::new("swaplabel", &["-L", label, &path])),
        _ => None,
    };
    if let Some(op) = op {
        run_checked(runner, &op)?;
    }
    Ok(())
}

fn partition_number(part_name: &str) -> u32 {
    part_name
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .chars()
        .rev()
        .collect::<String>()
        .parse()
        .unwrap_or(1)
}

fn run_resize_device(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    device: DeviceId,
    to: Size,
) -> Result<()> {
    let target = tree.get(device)?;
    let op = match &target.kind {
        DeviceKind::LvmLogicalVolume(_) => {
            let vg = tree.lv_volume_group(device)?;
            let vg_name = tree.get(vg)?.name().to_string();
            Some(cmds::lv_resize(&vg_name, target.name(), to))
        }
        DeviceKind::Partition(data) => {
            let disk = target.parents().first().copied().ok_or_else(|| {
                ModelError::device(target.name(), "partition has no disk")
            })?;
            let disk_path = tree.get(disk)?.path();
            let start = data
                .geometry
                .map(|(start_sector, _)| (start_sector * 512 / (1 << 20)) as i64)
                .unwrap_or(1);
            Some(cmds::parted_resizepart(
                &disk_path,
                partition_number(target.name()),
                start + mib(to),
            ))
        }
        _ => None,
    };
    if let Some(op) = op {
        run_checked(runner, &op)?;
    }
    Ok(())
}

fn run_resize_format(tree: &DeviceTree, runner: &mut dyn Runner, device: DeviceId, to: Size) -> Result<()> {
    let target = tree.get(device)?;
    let path = target.path();
    let ops: Vec<OpDescriptor> = match &target.format().kind {
        FormatKind::Ext2 | FormatKind::Ext3 | FormatKind::Ext4 => vec![cmds::resize2fs(&path, to)],
        FormatKind::Xfs => {
            let mountpoint = target.format().mountpoint.clone().ok_or_else(|| {
                ModelError::format(target.name(), "xfs grows online through its mountpoint")
            })?;
            vec![cmds::xfs_growfs(&mountpoint)]
        }
        _ => Vec::new(),
    };
    for op in &ops {
        run_checked(runner, op)?;
    }
    Ok(())
}

fn run_destroy_format(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    device: DeviceId,
    previous: &Format,
) -> Result<()> {
    let path = tree.get(device)?.path();
    let op = match &previous.kind {
        FormatKind::MdMember { .. } => cmds::md_destroy_member(&path),
        _ => cmds::wipefs(&path),
    };
    run_checked(runner, &op)?;
    Ok(())
}

fn run_destroy_device(tree: &mut DeviceTree, runner: &mut dyn Runner, snapshot: &Device) -> Result<()> {
    let path = snapshot.path();
    let ops: Vec<OpDescriptor> = match &snapshot.kind {
        DeviceKind::MdArray(_) => vec![cmds::md_deactivate(&path)],
        DeviceKind::LvmLogicalVolume(_) => {
            // the vg name is encoded in the mapper path of the snapshot
            let vg_name = snapshot
                .parents()
                .first()
                .and_then(|parent| tree.get(*parent).ok())
                .map(|parent| parent.name().to_string());
            match vg_name {
                Some(vg_name) => vec![cmds::lv_remove(&vg_name, snapshot.name())],
                None => Vec::new(),
            }
        }
        DeviceKind::LvmVolumeGroup(_) => vec![cmds::vg_remove(snapshot.name())],
        DeviceKind::Partition(_) => {
            let disk_path = snapshot
                .parents()
                .first()
                .and_then(|parent| tree.get(*parent).ok())
                .map(|parent| parent.path());
            match disk_path {
                Some(disk_path) => vec![
                    cmds::parted_rm(&disk_path, partition_number(snapshot.name())),
                    cmds::kpartx_update(&disk_path),
                ],
                None => Vec::new(),
            }
        }
        DeviceKind::Luks => vec![cmds::luks_close(snapshot.name())],
        DeviceKind::BtrfsSubvolume(_) => Vec::new(),
        _ => Vec::new(),
    };
    for op in &ops {
        run_checked(runner, op)?;
    }
    Ok(())
}
