// SPDX-License-Identifier: GPL-3.0-only

//! Queued mutations of the storage stack.
//!
//! Each action records enough of the pre-mutation state to undo itself on
//! cancellation, plus the dependency context the scheduler needs (the
//! target's ancestors and its mountpoint weight at queue time).

use std::collections::HashSet;

use storage_model::{Device, DeviceId, DeviceTree, Format};
use storage_units::Size;

pub type ActionId = u64;

/// The closed set of action kinds.
#[derive(Debug, Clone)]
pub enum ActionKind {
    CreateDevice,
    CreateFormat {
        previous: Format,
    },
    AddMember {
        container: DeviceId,
    },
    ConfigureDevice {
        attr: &'static str,
        previous: String,
        new_value: String,
    },
    ConfigureFormat {
        attr: &'static str,
        previous: String,
        new_value: String,
    },
    ResizeDevice {
        from: Size,
        to: Size,
    },
    ResizeFormat {
        from: Size,
        to: Size,
    },
    RemoveMember {
        container: DeviceId,
    },
    DestroyFormat {
        previous: Format,
    },
    DestroyDevice {
        /// The device, captured when it left the graph.
        snapshot: Box<Device>,
    },
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::CreateDevice => "create device",
            ActionKind::CreateFormat { .. } => "create format",
            ActionKind::AddMember { .. } => "add member",
            ActionKind::ConfigureDevice { .. } => "configure device",
            ActionKind::ConfigureFormat { .. } => "configure format",
            ActionKind::ResizeDevice { .. } => "resize device",
            ActionKind::ResizeFormat { .. } => "resize format",
            ActionKind::RemoveMember { .. } => "remove member",
            ActionKind::DestroyFormat { .. } => "destroy format",
            ActionKind::DestroyDevice { .. } => "destroy device",
        }
    }
}

/// A queued action against one device.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionId,
    pub device: DeviceId,
    pub kind: ActionKind,
    pub executed: bool,
    /// Ancestors of the target (self excluded) when the action was queued;
    /// destroy actions keep usable ordering data after the device left the
    /// graph.
    pub(crate) ancestors: HashSet<DeviceId>,
    /// Mountpoint weight for boot-critical tie-breaking.
    pub(crate) weight: i64,
}

/// Placement weight of a mountpoint: boot-critical filesystems sort ahead
/// of their siblings.
pub fn mountpoint_weight(mountpoint: Option<&str>) -> i64 {
    match mountpoint {
        Some("/boot/efi") => 5000,
        Some("/boot") => 2000,
        _ => 0,
    }
}

impl Action {
    pub(crate) fn new(id: ActionId, tree: &DeviceTree, device: DeviceId, kind: ActionKind) -> Action {
        let ancestors: HashSet<DeviceId> = tree
            .ancestors(device)
            .unwrap_or_default()
            .into_iter()
            .filter(|ancestor| *ancestor != device)
            .collect();
        let weight = tree
            .get(device)
            .ok()
            .map(|dev| mountpoint_weight(dev.format().mountpoint.as_deref()))
            .unwrap_or(0);
        Action {
            id,
            device,
            kind,
            executed: false,
            ancestors,
            weight,
        }
    }

    /// The scheduling class; actions apply in non-decreasing class order.
    pub fn class(&self) -> u32 {
        match &self.kind {
            ActionKind::CreateDevice => 10,
            ActionKind::CreateFormat { .. } => 20,
            ActionKind::AddMember { .. } => 30,
            ActionKind::ConfigureDevice { .. } => 40,
            ActionKind::ConfigureFormat { .. } => 50,
            ActionKind::ResizeDevice { from, to } if to > from => 60,
            ActionKind::ResizeFormat { from, to } if to > from => 70,
            ActionKind::ResizeFormat { .. } => 80,
            ActionKind::ResizeDevice { .. } => 90,
            ActionKind::RemoveMember { .. } => 100,
            ActionKind::DestroyFormat { .. } => 110,
            ActionKind::DestroyDevice { .. } => 120,
        }
    }

    /// Classes at or above member removal tear the stack down and order
    /// children before parents; everything below builds it up.
    pub fn is_teardown(&self) -> bool {
        self.class() >= 80
    }

    pub fn describe(&self, tree: &DeviceTree) -> String {
        let device_name = match &self.kind {
            ActionKind::DestroyDevice { snapshot } => snapshot.name().to_string(),
            _ => tree
                .get(self.device)
                .map(|device| device.name().to_string())
                .unwrap_or_else(|_| self.device.to_string()),
        };
        format!("{} {}", self.kind.name(), device_name)
    }
}
