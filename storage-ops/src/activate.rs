// SPDX-License-Identifier: GPL-3.0-only

//! Device activation and deactivation.
//!
//! Setting a device up activates its parents first, then the device
//! itself. Logical volumes may be auto-activated behind our back by
//! lvmetad/udev once their PVs appear, so activation first waits for that
//! window to close before falling back to a manual `lvchange`.

use std::time::{Duration, Instant};

use storage_model::{DeviceId, DeviceKind, DeviceState, DeviceTree, ModelError};
use tracing::debug;

use crate::cmds;
use crate::error::Result;
use crate::runner::{OpDescriptor, Runner};

/// How long to wait for udev/lvmetad auto-activation before activating
/// manually. The same value udev uses.
pub const AUTO_ACTIVATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for auto-activation.
pub const AUTO_ACTIVATION_POLL: Duration = Duration::from_millis(500);

/// Answers "is this device active right now?" from the running system.
///
/// Production callers read sysfs; tests script the answers.
pub trait StatusProbe {
    fn is_active(&mut self, tree: &DeviceTree, device: DeviceId) -> bool;
}

/// A probe that trusts the in-memory state (no system access).
#[derive(Debug, Default)]
pub struct ModelStatusProbe;

impl StatusProbe for ModelStatusProbe {
    fn is_active(&mut self, tree: &DeviceTree, device: DeviceId) -> bool {
        tree.get(device).map(|dev| dev.status()).unwrap_or(false)
    }
}

/// Set up a device and its ancestry.
pub fn setup_device(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    probe: &mut dyn StatusProbe,
    device: DeviceId,
) -> Result<()> {
    setup_device_with_timing(
        tree,
        runner,
        probe,
        device,
        AUTO_ACTIVATION_TIMEOUT,
        AUTO_ACTIVATION_POLL,
    )
}

/// [`setup_device`] with explicit timing, for tests.
pub fn setup_device_with_timing(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    probe: &mut dyn StatusProbe,
    device: DeviceId,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let target = tree.get(device)?;
    if !target.exists() {
        return Err(ModelError::device(target.name(), "device has not been created").into());
    }
    if target.status() {
        return Ok(());
    }

    for parent in target.parents().to_vec() {
        setup_device_with_timing(tree, runner, probe, parent, timeout, poll)?;
    }

    // LVs may be auto-activated once their PVs come up; give that window
    // a chance to close before activating manually
    if matches!(tree.get(device)?.kind, DeviceKind::LvmLogicalVolume(_)) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if probe.is_active(tree, device) {
                debug!(device = tree.get(device)?.name(), "auto-activated");
                tree.set_device_state(device, DeviceState::Active)?;
                return Ok(());
            }
            std::thread::sleep(poll);
        }
        debug!(
            device = tree.get(device)?.name(),
            "auto-activation timeout reached; activating manually"
        );
    }

    if let Some(op) = activation_op(tree, device)? {
        crate::plan::run_checked(runner, &op)?;
    }
    tree.set_device_state(device, DeviceState::Active)?;
    Ok(())
}

/// Tear down a device; its dependents must already be down.
pub fn teardown_device(
    tree: &mut DeviceTree,
    runner: &mut dyn Runner,
    device: DeviceId,
) -> Result<()> {
    let target = tree.get(device)?;
    if !target.status() {
        return Ok(());
    }
    if target
        .children()
        .iter()
        .any(|child| tree.get(*child).map(|dev| dev.status()).unwrap_or(false))
    {
        return Err(ModelError::device(target.name(), "device still has active dependents").into());
    }

    if let Some(op) = deactivation_op(tree, device)? {
        crate::plan::run_checked(runner, &op)?;
    }
    tree.set_device_state(device, DeviceState::Inactive)?;
    Ok(())
}

fn activation_op(tree: &DeviceTree, device: DeviceId) -> Result<Option<OpDescriptor>> {
    let target = tree.get(device)?;
    Ok(match &target.kind {
        DeviceKind::MdArray(_) => {
            let members: Vec<String> = target
                .parents()
                .iter()
                .filter_map(|member| tree.get(*member).ok())
                .map(|member| member.path())
                .collect();
            let member_refs: Vec<&str> = members.iter().map(String::as_str).collect();
            let mdadm_uuid = tree
                .md_mdadm_uuid(device)?
                .ok_or_else(|| ModelError::device(target.name(), "activation requires a uuid"))?;
            Some(cmds::md_activate(&target.path(), &mdadm_uuid, &member_refs))
        }
        DeviceKind::LvmVolumeGroup(_) => Some(cmds::vg_activate(target.name())),
        DeviceKind::LvmLogicalVolume(data) => {
            let vg = tree.lv_volume_group(device)?;
            let vg_name = tree.get(vg)?.name().to_string();
            // snapshots carry the activation-skip flag
            Some(cmds::lv_activate(&vg_name, target.name(), data.is_snapshot()))
        }
        DeviceKind::Luks => {
            let backing = target
                .parents()
                .first()
                .and_then(|parent| tree.get(*parent).ok())
                .map(|parent| parent.path())
                .unwrap_or_default();
            Some(cmds::luks_open(&backing, target.name(), ""))
        }
        _ => None,
    })
}

fn deactivation_op(tree: &DeviceTree, device: DeviceId) -> Result<Option<OpDescriptor>> {
    let target = tree.get(device)?;
    Ok(match &target.kind {
        DeviceKind::MdArray(_) => Some(cmds::md_deactivate(&target.path())),
        DeviceKind::LvmVolumeGroup(_) => Some(cmds::vg_deactivate(target.name())),
        DeviceKind::LvmLogicalVolume(_) => {
            let vg = tree.lv_volume_group(device)?;
            let vg_name = tree.get(vg)?.name().to_string();
            Some(cmds::lv_deactivate(&vg_name, target.name()))
        }
        DeviceKind::Luks => Some(cmds::luks_close(target.name())),
        _ => None,
    })
}
