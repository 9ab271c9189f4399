// SPDX-License-Identifier: GPL-3.0-only

//! Action scheduling.
//!
//! Actions apply in non-decreasing scheduling-class order. Within one
//! class a topological order on the parent-of relation applies: build-up
//! classes run parents before children, teardown classes run children
//! before parents. Ties break by mountpoint weight (boot-critical first),
//! then by stable insertion order.

use std::collections::BTreeMap;

use crate::action::Action;

/// Compute the execution order of `actions` as indices into the slice.
pub fn schedule(actions: &[Action]) -> Vec<usize> {
    let mut by_class: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
    for (index, action) in actions.iter().enumerate() {
        by_class.entry(action.class()).or_default().push(index);
    }

    let mut order = Vec::with_capacity(actions.len());
    for (_, group) in by_class {
        order.extend(schedule_class(actions, group));
    }
    order
}

/// Stable topological sort of one class group.
fn schedule_class(actions: &[Action], mut pending: Vec<usize>) -> Vec<usize> {
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        // an action is ready when no other pending action must precede it
        let ready_position = pending
            .iter()
            .position(|candidate| {
                !pending
                    .iter()
                    .any(|other| other != candidate && precedes(&actions[*other], &actions[*candidate]))
            })
            // a dependency cycle cannot arise from an acyclic graph; fall
            // back to insertion order if the data is inconsistent
            .unwrap_or(0);

        // among all ready actions, prefer higher mountpoint weight, then
        // insertion order
        let mut best = ready_position;
        for (position, candidate) in pending.iter().enumerate() {
            let is_ready = !pending
                .iter()
                .any(|other| other != candidate && precedes(&actions[*other], &actions[*candidate]));
            if !is_ready {
                continue;
            }
            let best_action = &actions[pending[best]];
            let this_action = &actions[*candidate];
            if this_action.weight > best_action.weight
                || (this_action.weight == best_action.weight && this_action.id < best_action.id)
            {
                best = position;
            }
        }

        ordered.push(pending.remove(best));
    }
    ordered
}

/// Must `first` run before `second` within the same class?
fn precedes(first: &Action, second: &Action) -> bool {
    if first.is_teardown() {
        // teardown: children before parents
        first.ancestors.contains(&second.device)
    } else {
        // build-up: parents before children
        second.ancestors.contains(&first.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use storage_model::{DeviceTree, Format, FormatKind, PartType};
    use storage_units::Size;

    #[test]
    fn classes_apply_in_table_order() {
        let mut tree = DeviceTree::new();
        let disk = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
        let actions = vec![
            Action::new(1, &tree, disk, ActionKind::DestroyFormat { previous: Format::none() }),
            Action::new(2, &tree, disk, ActionKind::CreateDevice),
            Action::new(
                3,
                &tree,
                disk,
                ActionKind::CreateFormat { previous: Format::none() },
            ),
        ];
        let order = schedule(&actions);
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn create_orders_parents_before_children() {
        let mut tree = DeviceTree::new();
        let disk = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
        let part = tree
            .new_partition("sda1", disk, Size::gib(1), PartType::Primary, false, false)
            .unwrap();
        let dm = tree.new_dm_linear("dm0", part, Size::gib(1), false).unwrap();

        // queue children first to prove the sort reorders them
        let actions = vec![
            Action::new(1, &tree, dm, ActionKind::CreateDevice),
            Action::new(2, &tree, part, ActionKind::CreateDevice),
            Action::new(3, &tree, disk, ActionKind::CreateDevice),
        ];
        let order = schedule(&actions);
        assert_eq!(order, vec![2, 1, 0]);
    }

    #[test]
    fn destroy_orders_children_before_parents() {
        let mut tree = DeviceTree::new();
        let disk = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
        let part = tree
            .new_partition("sda1", disk, Size::gib(1), PartType::Primary, false, false)
            .unwrap();

        let disk_snapshot = Box::new(tree.get(disk).unwrap().clone());
        let part_snapshot = Box::new(tree.get(part).unwrap().clone());
        let actions = vec![
            Action::new(1, &tree, disk, ActionKind::DestroyDevice { snapshot: disk_snapshot }),
            Action::new(2, &tree, part, ActionKind::DestroyDevice { snapshot: part_snapshot }),
        ];
        let order = schedule(&actions);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn boot_critical_formats_come_first_within_ties() {
        let mut tree = DeviceTree::new();
        let disk = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
        let root = tree
            .new_partition("sda2", disk, Size::gib(8), PartType::Primary, false, false)
            .unwrap();
        let efi = tree
            .new_partition("sda1", disk, Size::mib(512), PartType::Primary, true, false)
            .unwrap();
        tree.set_format(root, Format::new(FormatKind::Ext4).with_mountpoint("/"))
            .unwrap();
        tree.set_format(efi, Format::new(FormatKind::Efi).with_mountpoint("/boot/efi"))
            .unwrap();

        let actions = vec![
            Action::new(1, &tree, root, ActionKind::CreateFormat { previous: Format::none() }),
            Action::new(2, &tree, efi, ActionKind::CreateFormat { previous: Format::none() }),
        ];
        let order = schedule(&actions);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn insertion_order_breaks_remaining_ties() {
        let mut tree = DeviceTree::new();
        let disk_a = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
        let disk_b = tree.new_disk("sdb", Size::gib(10), 512, true).unwrap();
        let actions = vec![
            Action::new(7, &tree, disk_b, ActionKind::CreateDevice),
            Action::new(3, &tree, disk_a, ActionKind::CreateDevice),
        ];
        let order = schedule(&actions);
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn format_shrink_precedes_device_shrink() {
        let mut tree = DeviceTree::new();
        let disk = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
        let part = tree
            .new_partition("sda1", disk, Size::gib(1), PartType::Primary, false, true)
            .unwrap();
        let actions = vec![
            Action::new(
                1,
                &tree,
                part,
                ActionKind::ResizeDevice { from: Size::gib(1), to: Size::mib(700) },
            ),
            Action::new(
                2,
                &tree,
                part,
                ActionKind::ResizeFormat { from: Size::gib(1), to: Size::mib(700) },
            ),
        ];
        let order = schedule(&actions);
        // class 80 (format shrink) before class 90 (device shrink)
        assert_eq!(order, vec![1, 0]);
    }
}
