// SPDX-License-Identifier: GPL-3.0-only

//! Well-known argv shapes for the external storage tools.
//!
//! The core consumes the tools' own flags and conventions as-is; nothing
//! here invents options. Builders return [`OpDescriptor`]s for the Runner.

use storage_units::{Size, Unit};

use crate::runner::OpDescriptor;

fn kib(size: Size) -> String {
    format!("{}", size.convert_to(Unit::KiB) as i64)
}

//
// mdadm
//

pub fn md_create(
    array_path: &str,
    level: &str,
    member_paths: &[&str],
    spares: usize,
    metadata_version: Option<&str>,
    bitmap: bool,
    chunk_size: Option<Size>,
) -> OpDescriptor {
    let mut args = vec![
        "--create".to_string(),
        array_path.to_string(),
        "--run".to_string(),
        format!("--level={level}"),
        format!("--raid-devices={}", member_paths.len() - spares),
    ];
    if let Some(chunk) = chunk_size {
        if !chunk.is_zero() {
            args.push(format!("--chunk={}", kib(chunk)));
        }
    }
    if spares > 0 {
        args.push(format!("--spare-devices={spares}"));
    }
    if let Some(version) = metadata_version {
        args.push(format!("--metadata={version}"));
    }
    if bitmap {
        args.push("--bitmap=internal".to_string());
    }
    args.extend(member_paths.iter().map(|path| (*path).to_string()));
    op("mdadm", args)
}

pub fn md_destroy_member(member_path: &str) -> OpDescriptor {
    OpDescriptor::new("mdadm", &["--zero-superblock", member_path])
}

pub fn md_add(array_path: &str, member_path: &str, raid_devices: Option<usize>) -> OpDescriptor {
    // arrays without redundancy must be grown all at once rather than
    // handed a spare
    match raid_devices {
        Some(count) => op(
            "mdadm",
            vec![
                "--grow".to_string(),
                array_path.to_string(),
                "--raid-devices".to_string(),
                count.to_string(),
                "--add".to_string(),
                member_path.to_string(),
            ],
        ),
        None => OpDescriptor::new("mdadm", &[array_path, "--add", member_path]),
    }
}

pub fn md_remove(array_path: &str, member_path: &str, fail: bool) -> OpDescriptor {
    let mut args = vec![array_path.to_string()];
    if fail {
        args.push("--fail".to_string());
        args.push(member_path.to_string());
    }
    args.push("--remove".to_string());
    args.push(member_path.to_string());
    op("mdadm", args)
}

pub fn md_activate(array_path: &str, mdadm_uuid: &str, member_paths: &[&str]) -> OpDescriptor {
    let mut args = vec![
        "--assemble".to_string(),
        array_path.to_string(),
        format!("--uuid={mdadm_uuid}"),
        "--run".to_string(),
    ];
    args.extend(member_paths.iter().map(|path| (*path).to_string()));
    op("mdadm", args)
}

pub fn md_deactivate(array_path: &str) -> OpDescriptor {
    OpDescriptor::new("mdadm", &["--stop", array_path])
}

pub fn md_run(array_path: &str) -> OpDescriptor {
    OpDescriptor::new("mdadm", &["--run", array_path])
}

pub fn md_detail(array_path: &str) -> OpDescriptor {
    OpDescriptor::new("mdadm", &["--detail", array_path]).with_capture()
}

pub fn md_examine(member_path: &str) -> OpDescriptor {
    OpDescriptor::new("mdadm", &["--examine", "--export", member_path]).with_capture()
}

/// Parse `mdadm --detail` output into label/value pairs.
///
/// mdadm prints `     Name : value` lines; labels are upper-cased for
/// stable lookup.
pub fn parse_md_detail(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|line| {
            let (label, value) = line.trim().split_once(" : ")?;
            let label = label.trim().to_uppercase();
            let value = value.trim().to_string();
            if label.is_empty() || value.is_empty() {
                return None;
            }
            Some((label, value))
        })
        .collect()
}

//
// lvm
//

pub fn pv_create(device_path: &str) -> OpDescriptor {
    OpDescriptor::new("pvcreate", &[device_path])
}

pub fn pv_remove(device_path: &str) -> OpDescriptor {
    OpDescriptor::new("pvremove", &["--force", "--force", "--yes", device_path])
}

pub fn pv_move(device_path: &str) -> OpDescriptor {
    OpDescriptor::new("pvmove", &[device_path])
}

pub fn pv_info(device_path: &str) -> OpDescriptor {
    OpDescriptor::new(
        "pvs",
        &[
            "--noheadings",
            "--nosuffix",
            "--units",
            "b",
            "-o",
            "pv_name,vg_name,vg_uuid,pv_size,pv_free",
            "--separator",
            "\t",
            device_path,
        ],
    )
    .with_capture()
}

pub fn vg_create(vg_name: &str, pv_paths: &[&str], pe_size: Size) -> OpDescriptor {
    let mut args = vec![
        vg_name.to_string(),
        format!("--physicalextentsize={}k", kib(pe_size)),
    ];
    args.extend(pv_paths.iter().map(|path| (*path).to_string()));
    op("vgcreate", args)
}

pub fn vg_remove(vg_name: &str) -> OpDescriptor {
    OpDescriptor::new("vgremove", &["--force", "--yes", vg_name])
}

pub fn vg_activate(vg_name: &str) -> OpDescriptor {
    OpDescriptor::new("vgchange", &["-a", "y", vg_name])
}

pub fn vg_deactivate(vg_name: &str) -> OpDescriptor {
    OpDescriptor::new("vgchange", &["-a", "n", vg_name])
}

pub fn vg_extend(vg_name: &str, pv_path: &str) -> OpDescriptor {
    OpDescriptor::new("vgextend", &[vg_name, pv_path])
}

pub fn vg_reduce(vg_name: &str, pv_path: &str) -> OpDescriptor {
    OpDescriptor::new("vgreduce", &[vg_name, pv_path])
}

pub fn lv_create(
    vg_name: &str,
    lv_name: &str,
    size: Size,
    seg_type: Option<&str>,
    pv_paths: &[&str],
) -> OpDescriptor {
    let mut args = vec![
        "--name".to_string(),
        lv_name.to_string(),
        "--size".to_string(),
        format!("{}k", kib(size)),
    ];
    if let Some(seg) = seg_type {
        args.push("--type".to_string());
        args.push(seg.to_string());
    }
    args.push(vg_name.to_string());
    args.extend(pv_paths.iter().map(|path| (*path).to_string()));
    op("lvcreate", args)
}

pub fn lv_remove(vg_name: &str, lv_name: &str) -> OpDescriptor {
    op(
        "lvremove",
        vec!["--force".to_string(), format!("{vg_name}/{lv_name}")],
    )
}

pub fn lv_resize(vg_name: &str, lv_name: &str, size: Size) -> OpDescriptor {
    op(
        "lvresize",
        vec![
            "--force".to_string(),
            "--size".to_string(),
            format!("{}k", kib(size)),
            format!("{vg_name}/{lv_name}"),
        ],
    )
}

pub fn lv_activate(vg_name: &str, lv_name: &str, ignore_skip: bool) -> OpDescriptor {
    let mut args = vec!["-a".to_string(), "y".to_string()];
    if ignore_skip {
        args.push("--ignoreactivationskip".to_string());
    }
    args.push(format!("{vg_name}/{lv_name}"));
    op("lvchange", args)
}

pub fn lv_deactivate(vg_name: &str, lv_name: &str) -> OpDescriptor {
    op(
        "lvchange",
        vec!["-a".to_string(), "n".to_string(), format!("{vg_name}/{lv_name}")],
    )
}

pub fn thpool_create(
    vg_name: &str,
    pool_name: &str,
    size: Size,
    metadata_size: Size,
    chunk_size: Size,
) -> OpDescriptor {
    op(
        "lvcreate",
        vec![
            "--thinpool".to_string(),
            format!("{vg_name}/{pool_name}"),
            "--size".to_string(),
            format!("{}k", kib(size)),
            "--poolmetadatasize".to_string(),
            format!("{}k", kib(metadata_size)),
            "--chunksize".to_string(),
            format!("{}k", kib(chunk_size)),
        ],
    )
}

/// Convert an existing data LV and metadata LV into a thin pool.
pub fn thpool_convert(vg_name: &str, data_lv: &str, metadata_lv: &str) -> OpDescriptor {
    op(
        "lvconvert",
        vec![
            "--yes".to_string(),
            "--type".to_string(),
            "thin-pool".to_string(),
            "--poolmetadata".to_string(),
            format!("{vg_name}/{metadata_lv}"),
            format!("{vg_name}/{data_lv}"),
        ],
    )
}

pub fn thin_create(vg_name: &str, pool_name: &str, lv_name: &str, size: Size) -> OpDescriptor {
    op(
        "lvcreate",
        vec![
            "--thin".to_string(),
            "--name".to_string(),
            lv_name.to_string(),
            "--virtualsize".to_string(),
            format!("{}k", kib(size)),
            format!("{vg_name}/{pool_name}"),
        ],
    )
}

pub fn thin_snapshot(vg_name: &str, origin_lv: &str, snap_name: &str) -> OpDescriptor {
    op(
        "lvcreate",
        vec![
            "--snapshot".to_string(),
            "--name".to_string(),
            snap_name.to_string(),
            format!("{vg_name}/{origin_lv}"),
        ],
    )
}

pub fn lv_snapshot(vg_name: &str, origin_lv: &str, snap_name: &str, size: Size) -> OpDescriptor {
    op(
        "lvcreate",
        vec![
            "--snapshot".to_string(),
            "--name".to_string(),
            snap_name.to_string(),
            "--size".to_string(),
            format!("{}k", kib(size)),
            format!("{vg_name}/{origin_lv}"),
        ],
    )
}

/// Create a cached LV: data and cache carved in one shot.
#[allow(clippy::too_many_arguments)]
pub fn cache_create_cached_lv(
    vg_name: &str,
    lv_name: &str,
    size: Size,
    cache_size: Size,
    cache_md_size: Size,
    mode: &str,
    slow_pvs: &[&str],
    fast_pvs: &[&str],
) -> Vec<OpDescriptor> {
    let mut create_args = vec![
        "--name".to_string(),
        lv_name.to_string(),
        "--size".to_string(),
        format!("{}k", kib(size)),
        vg_name.to_string(),
    ];
    create_args.extend(slow_pvs.iter().map(|path| (*path).to_string()));

    let mut cache_args = vec![
        "--yes".to_string(),
        "--type".to_string(),
        "cache".to_string(),
        "--cachemode".to_string(),
        mode.to_string(),
        "--cachesize".to_string(),
        format!("{}k", kib(cache_size)),
        "--poolmetadatasize".to_string(),
        format!("{}k", kib(cache_md_size)),
        format!("{vg_name}/{lv_name}"),
    ];
    cache_args.extend(fast_pvs.iter().map(|path| (*path).to_string()));

    vec![op("lvcreate", create_args), op("lvconvert", cache_args)]
}

//
// cryptsetup
//

pub fn luks_format(device_path: &str, passphrase: &str, cipher: &str, key_size: u32) -> OpDescriptor {
    op(
        "cryptsetup",
        vec![
            "luksFormat".to_string(),
            "--batch-mode".to_string(),
            "--cipher".to_string(),
            cipher.to_string(),
            "--key-size".to_string(),
            key_size.to_string(),
            device_path.to_string(),
        ],
    )
    .with_stdin(passphrase)
}

pub fn luks_open(device_path: &str, dm_name: &str, passphrase: &str) -> OpDescriptor {
    OpDescriptor::new("cryptsetup", &["open", device_path, dm_name]).with_stdin(passphrase)
}

pub fn luks_close(dm_name: &str) -> OpDescriptor {
    OpDescriptor::new("cryptsetup", &["close", dm_name])
}

//
// mkfs and friends
//

/// mkfs invocation for a filesystem format kind name.
pub fn mkfs(kind: &str, device_path: &str, label: Option<&str>, extra: &[String]) -> OpDescriptor {
    let (program, label_flag): (&str, &str) = match kind {
        "ext2" => ("mkfs.ext2", "-L"),
        "ext3" => ("mkfs.ext3", "-L"),
        "ext4" => ("mkfs.ext4", "-L"),
        "xfs" => ("mkfs.xfs", "-L"),
        "swap" => ("mkswap", "-L"),
        "efi" => ("mkfs.vfat", "-n"),
        _ => ("wipefs", "-a"),
    };
    if program == "wipefs" {
        return OpDescriptor::new("wipefs", &["-a", device_path]);
    }
    let mut args: Vec<String> = Vec::new();
    if let Some(text) = label {
        args.push(label_flag.to_string());
        args.push(text.to_string());
    }
    args.extend(extra.iter().cloned());
    args.push(device_path.to_string());
    op(program, args)
}

pub fn wipefs(device_path: &str) -> OpDescriptor {
    OpDescriptor::new("wipefs", &["-a", device_path])
}

pub fn resize2fs(device_path: &str, size: Size) -> OpDescriptor {
    op(
        "resize2fs",
        vec![device_path.to_string(), format!("{}K", kib(size))],
    )
}

pub fn xfs_growfs(mountpoint: &str) -> OpDescriptor {
    OpDescriptor::new("xfs_growfs", &[mountpoint])
}

pub fn ntfsresize(device_path: &str, size: Size) -> OpDescriptor {
    op(
        "ntfsresize",
        vec![
            "--force".to_string(),
            "--size".to_string(),
            format!("{}k", kib(size)),
            device_path.to_string(),
        ],
    )
}

pub fn mount(device_path: &str, mountpoint: &str, options: Option<&str>) -> OpDescriptor {
    let mut args = Vec::new();
    if let Some(options) = options {
        args.push("-o".to_string());
        args.push(options.to_string());
    }
    args.push(device_path.to_string());
    args.push(mountpoint.to_string());
    op("mount", args)
}

pub fn umount(mountpoint: &str) -> OpDescriptor {
    OpDescriptor::new("umount", &[mountpoint])
}

pub fn dd_wipe_start(device_path: &str, count_sectors: u64) -> OpDescriptor {
    op(
        "dd",
        vec![
            "if=/dev/zero".to_string(),
            format!("of={device_path}"),
            "bs=512".to_string(),
            format!("count={count_sectors}"),
        ],
    )
}

//
// btrfs
//

pub fn mkfs_btrfs(
    member_paths: &[&str],
    data_level: Option<&str>,
    metadata_level: Option<&str>,
    label: Option<&str>,
) -> OpDescriptor {
    let mut args: Vec<String> = Vec::new();
    if let Some(level) = data_level {
        args.push("--data".to_string());
        args.push(level.to_string());
    }
    if let Some(level) = metadata_level {
        args.push("--metadata".to_string());
        args.push(level.to_string());
    }
    if let Some(text) = label {
        args.push("--label".to_string());
        args.push(text.to_string());
    }
    args.extend(member_paths.iter().map(|path| (*path).to_string()));
    op("mkfs.btrfs", args)
}

pub fn btrfs_device_add(mountpoint: &str, device_path: &str) -> OpDescriptor {
    OpDescriptor::new("btrfs", &["device", "add", device_path, mountpoint])
}

pub fn btrfs_device_remove(mountpoint: &str, device_path: &str) -> OpDescriptor {
    OpDescriptor::new("btrfs", &["device", "delete", device_path, mountpoint])
}

pub fn btrfs_subvol_create(mountpoint: &str, subvol_name: &str) -> OpDescriptor {
    op(
        "btrfs",
        vec![
            "subvolume".to_string(),
            "create".to_string(),
            format!("{mountpoint}/{subvol_name}"),
        ],
    )
}

pub fn btrfs_subvol_delete(mountpoint: &str, subvol_name: &str) -> OpDescriptor {
    op(
        "btrfs",
        vec![
            "subvolume".to_string(),
            "delete".to_string(),
            format!("{mountpoint}/{subvol_name}"),
        ],
    )
}

pub fn btrfs_subvol_snapshot(mountpoint: &str, source: &str, dest: &str) -> OpDescriptor {
    op(
        "btrfs",
        vec![
            "subvolume".to_string(),
            "snapshot".to_string(),
            format!("{mountpoint}/{source}"),
            format!("{mountpoint}/{dest}"),
        ],
    )
}

//
// parted / kpartx
//

pub fn parted_mklabel(disk_path: &str, label: &str) -> OpDescriptor {
    OpDescriptor::new("parted", &["--script", disk_path, "mklabel", label])
}

pub fn parted_mkpart(disk_path: &str, part_type: &str, start_mib: i64, end_mib: i64) -> OpDescriptor {
    op(
        "parted",
        vec![
            "--script".to_string(),
            disk_path.to_string(),
            "mkpart".to_string(),
            part_type.to_string(),
            format!("{start_mib}MiB"),
            format!("{end_mib}MiB"),
        ],
    )
}

pub fn parted_rm(disk_path: &str, number: u32) -> OpDescriptor {
    op(
        "parted",
        vec![
            "--script".to_string(),
            disk_path.to_string(),
            "rm".to_string(),
            number.to_string(),
        ],
    )
}

pub fn parted_resizepart(disk_path: &str, number: u32, end_mib: i64) -> OpDescriptor {
    op(
        "parted",
        vec![
            "--script".to_string(),
            disk_path.to_string(),
            "resizepart".to_string(),
            number.to_string(),
            format!("{end_mib}MiB"),
        ],
    )
}

pub fn kpartx_update(disk_path: &str) -> OpDescriptor {
    OpDescriptor::new("kpartx", &["-u", disk_path])
}

fn op(program: &str, args: Vec<String>) -> OpDescriptor {
    OpDescriptor {
        program: program.to_string(),
        args,
        stdin: None,
        capture: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md_create_matches_mdadm_conventions() {
        let op = md_create(
            "/dev/md/fast",
            "raid1",
            &["/dev/sda1", "/dev/sdb1", "/dev/sdc1"],
            1,
            Some("1.2"),
            true,
            Some(Size::kib(512)),
        );
        assert_eq!(
            op.to_string(),
            "mdadm --create /dev/md/fast --run --level=raid1 --raid-devices=2 \
             --chunk=512 --spare-devices=1 --metadata=1.2 --bitmap=internal \
             /dev/sda1 /dev/sdb1 /dev/sdc1"
        );
    }

    #[test]
    fn md_add_grows_redundancy_less_arrays() {
        assert_eq!(
            md_add("/dev/md0", "/dev/sdd1", None).to_string(),
            "mdadm /dev/md0 --add /dev/sdd1"
        );
        assert_eq!(
            md_add("/dev/md0", "/dev/sdd1", Some(4)).to_string(),
            "mdadm --grow /dev/md0 --raid-devices 4 --add /dev/sdd1"
        );
    }

    #[test]
    fn md_remove_fails_active_members_first() {
        assert_eq!(
            md_remove("/dev/md0", "/dev/sda1", true).to_string(),
            "mdadm /dev/md0 --fail /dev/sda1 --remove /dev/sda1"
        );
        assert_eq!(
            md_remove("/dev/md0", "/dev/sda1", false).to_string(),
            "mdadm /dev/md0 --remove /dev/sda1"
        );
    }

    #[test]
    fn md_detail_output_parses_into_pairs() {
        let output = "/dev/md0:\n        Version : 1.2\n  Creation Time : Fri Aug  1 10:00:00 2026\n     Raid Level : raid1\n           UUID : 3386ff85:f5012621:4a435f06:1eb47236\n";
        let pairs = parse_md_detail(output);
        assert!(pairs.contains(&("RAID LEVEL".to_string(), "raid1".to_string())));
        assert!(pairs.contains(&(
            "UUID".to_string(),
            "3386ff85:f5012621:4a435f06:1eb47236".to_string()
        )));
    }

    #[test]
    fn lvm_shapes() {
        assert_eq!(
            vg_create("vg0", &["/dev/sda1", "/dev/sdb1"], Size::mib(4)).to_string(),
            "vgcreate vg0 --physicalextentsize=4096k /dev/sda1 /dev/sdb1"
        );
        assert_eq!(
            lv_create("vg0", "data", Size::gib(2), None, &[]).to_string(),
            "lvcreate --name data --size 2097152k vg0"
        );
        assert_eq!(
            thpool_convert("vg0", "data_lv", "metadata_lv").to_string(),
            "lvconvert --yes --type thin-pool --poolmetadata vg0/metadata_lv vg0/data_lv"
        );
        assert_eq!(
            thin_create("vg0", "pool", "thin1", Size::gib(10)).to_string(),
            "lvcreate --thin --name thin1 --virtualsize 10485760k vg0/pool"
        );
    }

    #[test]
    fn luks_format_feeds_the_passphrase_on_stdin() {
        let op = luks_format("/dev/sda2", "secret", "aes-xts-plain64", 512);
        assert_eq!(op.stdin.as_deref(), Some("secret"));
        assert!(op.to_string().starts_with("cryptsetup luksFormat --batch-mode"));
    }

    #[test]
    fn mkfs_dispatches_by_kind() {
        assert_eq!(
            mkfs("ext4", "/dev/vg0/data", Some("data"), &[]).to_string(),
            "mkfs.ext4 -L data /dev/vg0/data"
        );
        assert_eq!(mkfs("swap", "/dev/sda2", None, &[]).to_string(), "mkswap /dev/sda2");
        assert_eq!(
            mkfs("ext2", "/dev/md0", None, &["-R".into(), "stride=48".into()]).to_string(),
            "mkfs.ext2 -R stride=48 /dev/md0"
        );
    }

    #[test]
    fn btrfs_shapes() {
        assert_eq!(
            mkfs_btrfs(&["/dev/sda", "/dev/sdb"], Some("raid1"), Some("raid1"), None).to_string(),
            "mkfs.btrfs --data raid1 --metadata raid1 /dev/sda /dev/sdb"
        );
        assert_eq!(
            btrfs_subvol_create("/mnt", "home").to_string(),
            "btrfs subvolume create /mnt/home"
        );
    }
}
