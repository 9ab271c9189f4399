// SPDX-License-Identifier: GPL-3.0-only

//! Discovery ingestion.
//!
//! A prober (sysfs/udev scanner, test fixture, remote agent) produces
//! typed records; [`ingest`] materializes or updates the corresponding
//! devices. Aggregates and members may arrive in any order: members carry
//! the aggregate UUID in their format, and attachment happens as soon as
//! both sides are known.

use serde::{Deserialize, Serialize};
use storage_model::{DeviceId, DeviceKind, DeviceTree, Format, FormatKind, LvSpec, PartType};
use storage_units::Size;
use tracing::debug;

use crate::error::{OpsError, Result};

/// One discovered entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ProbeRecord {
    Disk {
        name: String,
        sysfs_path: Option<String>,
        size: u64,
        sector_size: u64,
    },
    Partition {
        name: String,
        disk: String,
        size: u64,
        number: u32,
    },
    MdMember {
        device: String,
        md_uuid: String,
    },
    MdArray {
        name: String,
        uuid: String,
        level: String,
        member_devices: usize,
        total_devices: usize,
        chunk_size: Option<u64>,
        metadata_version: Option<String>,
        size: u64,
    },
    LvmPv {
        device: String,
        vg_name: Option<String>,
        vg_uuid: Option<String>,
        pe_start: u64,
    },
    LvmVg {
        name: String,
        uuid: String,
        pv_count: usize,
        pe_size: u64,
    },
    LvmLv {
        vg: String,
        name: String,
        uuid: Option<String>,
        size: u64,
        seg_type: String,
    },
    BtrfsMember {
        device: String,
        vol_uuid: String,
    },
    BtrfsVolume {
        label: Option<String>,
        uuid: String,
        data_level: Option<String>,
        metadata_level: Option<String>,
    },
    Luks {
        name: String,
        device: String,
        uuid: Option<String>,
    },
    DmLinear {
        name: String,
        device: String,
        size: u64,
    },
    Format {
        device: String,
        format: String,
        uuid: Option<String>,
        label: Option<String>,
        mountpoint: Option<String>,
    },
}

fn known_format(kind_name: &str) -> Option<FormatKind> {
    match kind_name {
        "ext2" => Some(FormatKind::Ext2),
        "ext3" => Some(FormatKind::Ext3),
        "ext4" => Some(FormatKind::Ext4),
        "xfs" => Some(FormatKind::Xfs),
        "swap" => Some(FormatKind::Swap),
        "biosboot" => Some(FormatKind::BiosBoot),
        "prepboot" => Some(FormatKind::PrepBoot),
        "efi" | "vfat" => Some(FormatKind::Efi),
        "btrfs" => Some(FormatKind::Btrfs),
        _ => None,
    }
}

/// Materialize or update the device a record describes.
pub fn ingest(tree: &mut DeviceTree, record: ProbeRecord) -> Result<DeviceId> {
    debug!(?record, "ingesting probe record");
    match record {
        ProbeRecord::Disk {
            name,
            sysfs_path,
            size,
            sector_size,
        } => {
            if let Ok(existing) = tree.resolve(&name) {
                if !tree.get(existing)?.is_disk() {
                    return Err(OpsError::Probe(format!(
                        "{name} already exists and is not a disk"
                    )));
                }
                tree.set_device_size(existing, Size::from(size))?;
                return Ok(existing);
            }
            let id = tree.new_disk(&name, Size::from(size), sector_size, true)?;
            if let Some(path) = sysfs_path {
                tree.set_sysfs_path(id, Some(path))?;
            }
            Ok(id)
        }

        ProbeRecord::Partition {
            name, disk, size, ..
        } => {
            let parent = tree
                .resolve(&disk)
                .map_err(|_| OpsError::Probe(format!("partition {name} on unknown disk {disk}")))?;
            tree.new_partition(&name, parent, Size::from(size), PartType::Primary, false, true)
                .map_err(OpsError::from)
        }

        ProbeRecord::MdMember { device, md_uuid } => {
            let member = resolve_or_probe_err(tree, &device)?;
            tree.set_format(member, Format::existing(FormatKind::md_member()))?;
            tree.set_member_container_uuid(member, Some(md_uuid.clone()))?;
            // bind to the array if it has been seen already
            if let Some(array) = find_by_uuid(tree, &md_uuid, |kind| {
                matches!(kind, DeviceKind::MdArray(_))
            }) {
                tree.add_parent(array, member)?;
            }
            Ok(member)
        }

        ProbeRecord::MdArray {
            name,
            uuid,
            level,
            member_devices,
            total_devices,
            chunk_size,
            metadata_version,
            size,
        } => {
            let id = tree.new_md_array(
                &name,
                &level,
                &[],
                0,
                metadata_version.as_deref(),
                chunk_size.map(|chunk| Size::from(chunk)),
                Some(uuid.clone()),
                true,
            )?;
            tree.md_set_discovered_counts(id, member_devices, total_devices)?;
            tree.set_device_size(id, Size::from(size))?;
            // adopt members that arrived first
            for member in members_with_uuid(tree, &uuid) {
                tree.add_parent(id, member)?;
            }
            Ok(id)
        }

        ProbeRecord::LvmPv {
            device,
            vg_name,
            vg_uuid,
            pe_start,
        } => {
            let member = resolve_or_probe_err(tree, &device)?;
            let format = Format::existing(FormatKind::LvmPv {
                pe_start: Size::from(pe_start),
                vg_name,
                vg_uuid: vg_uuid.clone(),
                free: None,
            });
            tree.set_format(member, format)?;
            if let Some(vg_uuid) = vg_uuid {
                if let Some(vg) = find_by_uuid(tree, &vg_uuid, |kind| {
                    matches!(kind, DeviceKind::LvmVolumeGroup(_))
                }) {
                    tree.add_parent(vg, member)?;
                }
            }
            Ok(member)
        }

        ProbeRecord::LvmVg {
            name,
            uuid,
            pv_count,
            pe_size,
        } => {
            let id = tree.new_lvm_vg(&name, &[], Some(Size::from(pe_size)), Some(uuid.clone()), true)?;
            tree.vg_set_discovered_pv_count(id, pv_count)?;
            for member in members_with_uuid(tree, &uuid) {
                tree.add_parent(id, member)?;
            }
            Ok(id)
        }

        ProbeRecord::LvmLv {
            vg,
            name,
            uuid,
            size,
            seg_type,
        } => {
            let vg_id = tree
                .resolve(&vg)
                .map_err(|_| OpsError::Probe(format!("LV {name} in unknown VG {vg}")))?;
            tree.new_lvm_lv(
                &name,
                vg_id,
                LvSpec {
                    seg_type: Some(seg_type),
                    size: Size::from(size),
                    uuid,
                    exists: true,
                    ..Default::default()
                },
            )
            .map_err(OpsError::from)
        }

        ProbeRecord::BtrfsMember { device, vol_uuid } => {
            let member = resolve_or_probe_err(tree, &device)?;
            tree.set_format(member, Format::existing(FormatKind::btrfs_member()))?;
            tree.set_member_container_uuid(member, Some(vol_uuid.clone()))?;
            if let Some(volume) = find_by_uuid(tree, &vol_uuid, |kind| {
                matches!(kind, DeviceKind::BtrfsVolume(_))
            }) {
                tree.add_parent(volume, member)?;
            }
            Ok(member)
        }

        ProbeRecord::BtrfsVolume {
            label,
            uuid,
            data_level,
            metadata_level,
        } => {
            let members = members_with_uuid(tree, &uuid);
            if members.is_empty() {
                return Err(OpsError::Probe(format!(
                    "btrfs volume {uuid} has no known members"
                )));
            }
            tree.new_btrfs_volume(
                label.as_deref(),
                &members,
                data_level.as_deref(),
                metadata_level.as_deref(),
                Some(uuid),
                true,
            )
            .map_err(OpsError::from)
        }

        ProbeRecord::Luks { name, device, uuid } => {
            let backing = resolve_or_probe_err(tree, &device)?;
            if !matches!(tree.get(backing)?.format().kind, FormatKind::Luks { .. }) {
                let mut format = Format::existing(FormatKind::luks());
                format.uuid = uuid.clone();
                tree.set_format(backing, format)?;
            }
            tree.new_luks(&name, backing, true).map_err(OpsError::from)
        }

        ProbeRecord::DmLinear { name, device, size } => {
            let backing = resolve_or_probe_err(tree, &device)?;
            tree.new_dm_linear(&name, backing, Size::from(size), true)
                .map_err(OpsError::from)
        }

        ProbeRecord::Format {
            device,
            format,
            uuid,
            label,
            mountpoint,
        } => {
            let target = resolve_or_probe_err(tree, &device)?;
            let kind = known_format(&format)
                .ok_or_else(|| OpsError::Probe(format!("unknown format kind {format:?}")))?;
            let mut record = Format::existing(kind);
            record.uuid = uuid;
            record.label = label;
            record.mountpoint = mountpoint;
            tree.set_format(target, record)?;
            Ok(target)
        }
    }
}

fn resolve_or_probe_err(tree: &DeviceTree, key: &str) -> Result<DeviceId> {
    tree.resolve(key)
        .map_err(|_| OpsError::Probe(format!("record references unknown device {key:?}")))
}

fn find_by_uuid(
    tree: &DeviceTree,
    uuid: &str,
    kind_matches: impl Fn(&DeviceKind) -> bool,
) -> Option<DeviceId> {
    tree.devices()
        .find(|device| {
            kind_matches(&device.kind) && device.common.uuid.as_deref() == Some(uuid)
        })
        .map(|device| device.id())
}

/// Devices whose member format references the given aggregate UUID and
/// that are not yet attached to an aggregate.
fn members_with_uuid(tree: &DeviceTree, uuid: &str) -> Vec<DeviceId> {
    tree.devices()
        .filter(|device| {
            device.format().container_uuid() == Some(uuid) && device.is_leaf()
        })
        .map(|device| device.id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_record(name: &str) -> ProbeRecord {
        ProbeRecord::Disk {
            name: name.to_string(),
            sysfs_path: Some(format!("/sys/block/{name}")),
            size: 100 << 30,
            sector_size: 512,
        }
    }

    #[test]
    fn disks_materialize_and_update() {
        let mut tree = DeviceTree::new();
        let id = ingest(&mut tree, disk_record("sda")).unwrap();
        assert!(tree.get(id).unwrap().exists());

        // a second record for the same disk updates rather than duplicates
        let again = ingest(
            &mut tree,
            ProbeRecord::Disk {
                name: "sda".into(),
                sysfs_path: None,
                size: 200 << 30,
                sector_size: 512,
            },
        )
        .unwrap();
        assert_eq!(again, id);
        assert_eq!(tree.get(id).unwrap().size(), Size::from(200u64 << 30));
        assert_eq!(tree.devices().count(), 1);
    }

    #[test]
    fn partitions_need_their_disk() {
        let mut tree = DeviceTree::new();
        let err = ingest(
            &mut tree,
            ProbeRecord::Partition {
                name: "sda1".into(),
                disk: "sda".into(),
                size: 1 << 30,
                number: 1,
            },
        )
        .unwrap_err();
        assert!(matches!(err, OpsError::Probe(_)));

        ingest(&mut tree, disk_record("sda")).unwrap();
        let part = ingest(
            &mut tree,
            ProbeRecord::Partition {
                name: "sda1".into(),
                disk: "sda".into(),
                size: 1 << 30,
                number: 1,
            },
        )
        .unwrap();
        assert!(tree.get(part).unwrap().exists());
    }

    #[test]
    fn md_members_bind_to_their_array_in_any_order() {
        let uuid = "3386ff85-f501-2621-4a43-5f061eb47236".to_string();
        let mut tree = DeviceTree::new();
        ingest(&mut tree, disk_record("sda")).unwrap();
        ingest(&mut tree, disk_record("sdb")).unwrap();

        // member first, then the array
        ingest(
            &mut tree,
            ProbeRecord::MdMember {
                device: "sda".into(),
                md_uuid: uuid.clone(),
            },
        )
        .unwrap();
        let array = ingest(
            &mut tree,
            ProbeRecord::MdArray {
                name: "md0".into(),
                uuid: uuid.clone(),
                level: "raid1".into(),
                member_devices: 2,
                total_devices: 2,
                chunk_size: None,
                metadata_version: Some("1.2".into()),
                size: 100 << 30,
            },
        )
        .unwrap();
        assert_eq!(tree.get(array).unwrap().parents().len(), 1);
        assert!(!tree.md_complete(array).unwrap());

        // then the remaining member
        ingest(
            &mut tree,
            ProbeRecord::MdMember {
                device: "sdb".into(),
                md_uuid: uuid,
            },
        )
        .unwrap();
        assert_eq!(tree.get(array).unwrap().parents().len(), 2);
        assert!(tree.md_complete(array).unwrap());
    }

    #[test]
    fn lvm_stack_ingests_bottom_up() {
        let vg_uuid = "9f0f40cc-95b4-4e42-9f26-1af6b4b1a9cd".to_string();
        let mut tree = DeviceTree::new();
        ingest(&mut tree, disk_record("sda")).unwrap();
        ingest(
            &mut tree,
            ProbeRecord::LvmPv {
                device: "sda".into(),
                vg_name: Some("vg0".into()),
                vg_uuid: Some(vg_uuid.clone()),
                pe_start: 1 << 20,
            },
        )
        .unwrap();
        let vg = ingest(
            &mut tree,
            ProbeRecord::LvmVg {
                name: "vg0".into(),
                uuid: vg_uuid,
                pv_count: 1,
                pe_size: 4 << 20,
            },
        )
        .unwrap();
        assert_eq!(tree.get(vg).unwrap().parents().len(), 1);
        assert!(tree.vg_complete(vg).unwrap());

        let lv = ingest(
            &mut tree,
            ProbeRecord::LvmLv {
                vg: "vg0".into(),
                name: "root".into(),
                uuid: None,
                size: 10 << 30,
                seg_type: "linear".into(),
            },
        )
        .unwrap();
        assert!(tree.get(lv).unwrap().exists());
        assert!(tree.depends_on(lv, vg));
    }

    #[test]
    fn mismatched_records_are_probe_errors() {
        let mut tree = DeviceTree::new();
        assert!(matches!(
            ingest(
                &mut tree,
                ProbeRecord::MdMember {
                    device: "sda".into(),
                    md_uuid: "whatever".into()
                }
            ),
            Err(OpsError::Probe(_))
        ));
        assert!(matches!(
            ingest(
                &mut tree,
                ProbeRecord::BtrfsVolume {
                    label: None,
                    uuid: "no-members".into(),
                    data_level: None,
                    metadata_level: None,
                }
            ),
            Err(OpsError::Probe(_))
        ));
    }

    #[test]
    fn records_serialize_with_kind_tags() {
        let record = ProbeRecord::MdMember {
            device: "/dev/sda1".into(),
            md_uuid: "abc".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"kind\":\"md-member\""));
        assert_eq!(serde_json::from_str::<ProbeRecord>(&json).unwrap(), record);
    }
}
