// SPDX-License-Identifier: GPL-3.0-only

//! Volume-group stack scenarios: space accounting, caches, thin pools.

use storage_model::{
    DeviceId, DeviceKind, DeviceTree, Format, FormatKind, InternalLvKind, LvPvSpec, LvSpec,
    LvmCacheRequest, ModelError, ThPoolReserve,
};
use storage_units::Size;

fn pv_disk(tree: &mut DeviceTree, name: &str, size: Size) -> DeviceId {
    let disk = tree.new_disk(name, size, 512, true).unwrap();
    tree.set_format(disk, Format::new(FormatKind::lvm_pv())).unwrap();
    disk
}

fn simple_vg(tree: &mut DeviceTree, pv_size: Size, pv_count: usize) -> (DeviceId, Vec<DeviceId>) {
    let pvs: Vec<DeviceId> = (0..pv_count)
        .map(|i| pv_disk(tree, &format!("sd{}", (b'a' + i as u8) as char), pv_size))
        .collect();
    let vg = tree.new_lvm_vg("vg0", &pvs, None, None, false).unwrap();
    (vg, pvs)
}

#[test]
fn vg_size_subtracts_metadata_and_aligns() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 2);
    // each PV loses its 1 MiB extent start, rounded down to whole 4 MiB extents
    assert_eq!(tree.vg_size(vg).unwrap(), Size::mib(204792));
    assert_eq!(tree.vg_extents(vg).unwrap(), 51198);
}

#[test]
fn vg_needs_consistent_sector_sizes() {
    let mut tree = DeviceTree::new();
    let pv1 = pv_disk(&mut tree, "sda", Size::gib(10));
    let disk4k = tree.new_disk("nvme0n1", Size::gib(10), 4096, true).unwrap();
    tree.set_format(disk4k, Format::new(FormatKind::lvm_pv())).unwrap();
    assert!(matches!(
        tree.new_lvm_vg("vg0", &[pv1, disk4k], None, None, false),
        Err(ModelError::Value(_))
    ));
}

#[test]
fn vg_needs_lvm_pv_formats() {
    let mut tree = DeviceTree::new();
    let plain = tree.new_disk("sda", Size::gib(10), 512, true).unwrap();
    assert!(tree.new_lvm_vg("vg0", &[plain], None, None, false).is_err());
    // the failed VG must not linger
    assert!(tree.resolve("vg0").is_err());
}

#[test]
fn lv_creation_accounts_vg_and_pv_space() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 2);
    let free_before = tree.vg_free_space(vg).unwrap();

    let lv = tree
        .new_lvm_lv(
            "data",
            vg,
            LvSpec {
                size: Size::gib(2),
                ..Default::default()
            },
        )
        .unwrap();

    let used = tree.lv_vg_space_used(lv).unwrap();
    assert_eq!(used, Size::gib(2));
    // free space drops by exactly the LV's footprint
    assert_eq!(tree.vg_free_space(vg).unwrap(), free_before - used);

    tree.vg_remove_lv(lv).unwrap();
    assert_eq!(tree.vg_free_space(vg).unwrap(), free_before);
}

#[test]
fn oversized_lvs_are_rejected() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(1), 1);
    assert!(matches!(
        tree.new_lvm_lv(
            "big",
            vg,
            LvSpec {
                size: Size::gib(10),
                ..Default::default()
            },
        ),
        Err(ModelError::Device { .. })
    ));
}

#[test]
fn cached_lv_carves_metadata_and_pmspare_from_the_request() {
    let mut tree = DeviceTree::new();
    let (vg, pvs) = simple_vg(&mut tree, Size::gib(100), 2);

    let lv = tree
        .new_lvm_lv(
            "cached",
            vg,
            LvSpec {
                size: Size::gib(2),
                cache_request: Some(LvmCacheRequest::new(Size::gib(1), vec![pvs[1]])),
                ..Default::default()
            },
        )
        .unwrap();

    let device = tree.get(lv).unwrap();
    let DeviceKind::LvmLogicalVolume(data) = &device.kind else {
        panic!("not an LV");
    };
    let cache = data.cache.as_ref().expect("cache attached");

    // 1 GiB - 8 MiB metadata - 8 MiB pmspare allocation
    assert_eq!(cache.size, Size::mib(1008));
    assert_eq!(cache.md_size, Size::mib(8));
    assert_eq!(cache.vg_space_used(), Size::mib(1016));
    assert_eq!(cache.mode, "writethrough");
    assert_eq!(cache.fast_pvs.len(), 1);
    assert_eq!(cache.fast_pvs[0].pv, pvs[1]);

    // the LV's VG footprint covers its size plus the whole cache
    assert_eq!(
        tree.lv_vg_space_used(lv).unwrap(),
        Size::gib(2) + cache.size + cache.md_size
    );
    // the cache metadata sizes the pmspare reservation
    assert_eq!(tree.vg_pmspare_size(vg).unwrap(), Size::mib(8));
    assert_eq!(tree.vg_reserved_space(vg).unwrap(), Size::mib(8));
}

#[test]
fn second_cache_shares_the_pmspare_volume() {
    let mut tree = DeviceTree::new();
    let (vg, pvs) = simple_vg(&mut tree, Size::gib(100), 2);
    for (name, expected_cache_size) in [("lv1", Size::mib(240)), ("lv2", Size::mib(248))] {
        let lv = tree
            .new_lvm_lv(
                name,
                vg,
                LvSpec {
                    size: Size::gib(1),
                    cache_request: Some(LvmCacheRequest::new(Size::mib(256), vec![pvs[1]])),
                    ..Default::default()
                },
            )
            .unwrap();
        let DeviceKind::LvmLogicalVolume(data) = &tree.get(lv).unwrap().kind else {
            panic!("not an LV");
        };
        assert_eq!(data.cache.as_ref().unwrap().size, expected_cache_size);
    }
}

#[test]
fn raid_lvs_need_pvs_and_reserve_leg_metadata() {
    let mut tree = DeviceTree::new();
    let (vg, pvs) = simple_vg(&mut tree, Size::gib(100), 2);

    assert!(matches!(
        tree.new_lvm_lv(
            "r",
            vg,
            LvSpec {
                seg_type: Some("raid1".into()),
                size: Size::gib(1),
                ..Default::default()
            },
        ),
        Err(ModelError::Device { .. })
    ));

    let lv = tree
        .new_lvm_lv(
            "r",
            vg,
            LvSpec {
                seg_type: Some("raid1".into()),
                size: Size::gib(1),
                pvs: pvs.iter().map(|pv| LvPvSpec { pv: *pv, size: Size::ZERO }).collect(),
                ..Default::default()
            },
        )
        .unwrap();

    // one extent of metadata came out of the requested size
    assert_eq!(tree.get(lv).unwrap().size(), Size::gib(1) - Size::mib(4));
    assert_eq!(tree.lv_metadata_size(lv).unwrap(), Size::mib(4));
    // both legs occupy a full copy
    assert_eq!(tree.lv_vg_space_used(lv).unwrap(), Size::gib(2));
}

#[test]
fn linear_pv_specs_must_sum_to_the_size() {
    let mut tree = DeviceTree::new();
    let (vg, pvs) = simple_vg(&mut tree, Size::gib(10), 2);
    assert!(tree
        .new_lvm_lv(
            "lv",
            vg,
            LvSpec {
                size: Size::gib(2),
                pvs: vec![LvPvSpec { pv: pvs[0], size: Size::gib(1) }],
                ..Default::default()
            },
        )
        .is_err());
    assert!(tree
        .new_lvm_lv(
            "lv",
            vg,
            LvSpec {
                size: Size::gib(2),
                pvs: vec![
                    LvPvSpec { pv: pvs[0], size: Size::gib(1) },
                    LvPvSpec { pv: pvs[1], size: Size::gib(1) },
                ],
                ..Default::default()
            },
        )
        .is_ok());
}

#[test]
fn thin_pool_auto_sizes_its_metadata() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 1);
    let pool = tree
        .new_lvm_lv(
            "pool",
            vg,
            LvSpec {
                seg_type: Some("thin-pool".into()),
                size: Size::gib(10),
                ..Default::default()
            },
        )
        .unwrap();
    let metadata = tree.lv_metadata_size(pool).unwrap();
    // 64 B per 64 KiB chunk of a 10 GiB pool, extent aligned
    assert_eq!(metadata, Size::mib(12));
    // metadata and the pmspare growth both came out of the requested size
    assert_eq!(
        tree.get(pool).unwrap().size(),
        Size::gib(10) - metadata - metadata
    );
}

#[test]
fn thin_pool_metadata_bounds_are_enforced() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 1);
    assert!(tree
        .new_lvm_lv(
            "pool",
            vg,
            LvSpec {
                seg_type: Some("thin-pool".into()),
                size: Size::gib(1),
                metadata_size: Some(Size::mib(1)),
                ..Default::default()
            },
        )
        .is_err());
    assert!(tree
        .new_lvm_lv(
            "pool",
            vg,
            LvSpec {
                seg_type: Some("thin-pool".into()),
                size: Size::gib(1),
                chunk_size: Some(Size::kib(100)),
                ..Default::default()
            },
        )
        .is_err());
}

#[test]
fn thin_lvs_occupy_the_pool_not_the_vg() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 1);
    let pool = tree
        .new_lvm_lv(
            "pool",
            vg,
            LvSpec {
                seg_type: Some("thin-pool".into()),
                size: Size::gib(10),
                ..Default::default()
            },
        )
        .unwrap();
    let free_before = tree.vg_free_space(vg).unwrap();

    // thin LVs attach to the pool, not the VG
    assert!(tree
        .new_lvm_lv(
            "thin1",
            vg,
            LvSpec {
                seg_type: Some("thin".into()),
                size: Size::gib(50),
                ..Default::default()
            },
        )
        .is_err());

    let thin = tree
        .new_lvm_lv(
            "thin1",
            pool,
            LvSpec {
                seg_type: Some("thin".into()),
                size: Size::gib(50),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(tree.lv_vg_space_used(thin).unwrap(), Size::ZERO);
    assert_eq!(tree.vg_free_space(vg).unwrap(), free_before);
    assert_eq!(tree.lv_pool_space_used(thin).unwrap(), Size::gib(50));
    assert_eq!(
        tree.pool_free_space(pool).unwrap(),
        tree.get(pool).unwrap().size() - Size::gib(50)
    );
    assert!(tree.depends_on(thin, vg));
}

#[test]
fn thin_pool_reserve_applies_only_with_a_pool() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 2);
    tree.vg_set_thpool_reserve(vg, ThPoolReserve::DEFAULT).unwrap();
    assert_eq!(tree.vg_reserved_space(vg).unwrap(), Size::ZERO);

    tree.new_lvm_lv(
        "pool",
        vg,
        LvSpec {
            seg_type: Some("thin-pool".into()),
            size: Size::gib(10),
            ..Default::default()
        },
    )
    .unwrap();
    // 20% of ~200 GiB clamps to the 100 GiB ceiling? no - to the computed
    // percentage, which lies between the 1 GiB floor and 100 GiB ceiling
    let reserved = tree.vg_reserved_space(vg).unwrap();
    let size = tree.vg_size(vg).unwrap();
    let expected_pool_reserve = size * 20 / 100;
    assert!(reserved >= expected_pool_reserve);
    assert!(reserved <= expected_pool_reserve + Size::mib(16) + Size::gib(1));
}

#[test]
fn reservation_grows_monotonically_with_percent() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 2);
    let mut previous = Size::ZERO;
    for percent in [0, 5, 10, 20, 50, 80, 100] {
        tree.vg_set_reserved_percent(vg, percent).unwrap();
        let reserved = tree.vg_reserved_space(vg).unwrap();
        assert!(reserved >= previous, "{percent}%: {reserved} < {previous}");
        previous = reserved;
    }
}

#[test]
fn absolute_and_percent_reservations_take_the_larger() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 2);
    tree.vg_set_reserved_space(vg, Size::gib(10)).unwrap();
    tree.vg_set_reserved_percent(vg, 1).unwrap();
    // 1% of ~200 GiB is ~2 GiB, the absolute reservation wins
    assert_eq!(tree.vg_reserved_space(vg).unwrap(), Size::gib(10));
}

#[test]
fn thin_pool_conversion_internalizes_the_source_lvs() {
    let mut tree = DeviceTree::new();
    let pv = pv_disk(&mut tree, "sda", Size::gib(2));
    let vg = tree.new_lvm_vg("testvg", &[pv], None, None, true).unwrap();
    let data_lv = tree
        .new_lvm_lv(
            "data_lv",
            vg,
            LvSpec {
                size: Size::gib(1),
                exists: true,
                ..Default::default()
            },
        )
        .unwrap();
    let meta_lv = tree
        .new_lvm_lv(
            "metadata_lv",
            vg,
            LvSpec {
                size: Size::mib(50),
                exists: true,
                ..Default::default()
            },
        )
        .unwrap();

    let pool = tree
        .new_lvm_lv(
            "pool",
            vg,
            LvSpec {
                seg_type: Some("thin-pool".into()),
                from_lvs: Some((data_lv, meta_lv)),
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(tree.get(pool).unwrap().size(), Size::gib(1));
    assert_eq!(tree.lv_metadata_size(pool).unwrap(), Size::mib(50));
    assert_eq!(tree.vg_lvs(vg).unwrap(), vec![pool]);

    let DeviceKind::LvmLogicalVolume(data) = &tree.get(data_lv).unwrap().kind else {
        panic!("not an LV");
    };
    assert_eq!(data.internal.unwrap().kind, InternalLvKind::Data);
    assert_eq!(data.internal.unwrap().parent_lv, pool);
    let DeviceKind::LvmLogicalVolume(meta) = &tree.get(meta_lv).unwrap().kind else {
        panic!("not an LV");
    };
    assert_eq!(meta.internal.unwrap().kind, InternalLvKind::Meta);
    // the sources left the tree's parent/child graph
    assert!(tree.get(data_lv).unwrap().parents().is_empty());

    // removing the pool releases them again
    tree.vg_remove_lv(pool).unwrap();
    assert_eq!(tree.vg_lvs(vg).unwrap(), vec![data_lv, meta_lv]);
    let DeviceKind::LvmLogicalVolume(data) = &tree.get(data_lv).unwrap().kind else {
        panic!("not an LV");
    };
    assert!(data.internal.is_none());
}

#[test]
fn converted_pools_reject_explicit_sizes() {
    let mut tree = DeviceTree::new();
    let pv = pv_disk(&mut tree, "sda", Size::gib(2));
    let vg = tree.new_lvm_vg("testvg", &[pv], None, None, true).unwrap();
    let data_lv = tree
        .new_lvm_lv("data_lv", vg, LvSpec { size: Size::gib(1), exists: true, ..Default::default() })
        .unwrap();
    let meta_lv = tree
        .new_lvm_lv("meta_lv", vg, LvSpec { size: Size::mib(50), exists: true, ..Default::default() })
        .unwrap();
    assert!(tree
        .new_lvm_lv(
            "pool",
            vg,
            LvSpec {
                seg_type: Some("thin-pool".into()),
                size: Size::gib(1),
                from_lvs: Some((data_lv, meta_lv)),
                ..Default::default()
            },
        )
        .is_err());
}

#[test]
fn snapshots_track_their_origin() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(100), 1);
    let origin = tree
        .new_lvm_lv("data", vg, LvSpec { size: Size::gib(2), ..Default::default() })
        .unwrap();
    tree.set_format(origin, Format::new(FormatKind::Ext4).with_mountpoint("/data"))
        .unwrap();

    let snap = tree
        .new_lvm_lv(
            "data-snap",
            vg,
            LvSpec {
                size: Size::gib(1),
                origin: Some(origin),
                ..Default::default()
            },
        )
        .unwrap();

    // planned snapshots mirror the origin's format, minus the mountpoint
    let format = tree.get(snap).unwrap().format();
    assert_eq!(format.kind, FormatKind::Ext4);
    assert_eq!(format.mountpoint, None);
    assert!(!format.exists);
    assert!(tree.depends_on(snap, origin));

    // and they follow later format changes
    tree.set_format(origin, Format::new(FormatKind::Xfs)).unwrap();
    assert_eq!(tree.get(snap).unwrap().format().kind, FormatKind::Xfs);
}

#[test]
fn lv_names_follow_lvm_rules() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(10), 1);
    for bad in ["pvmove0", "data_tmeta", "bad name"] {
        assert!(
            tree.new_lvm_lv(bad, vg, LvSpec { size: Size::gib(1), ..Default::default() })
                .is_err(),
            "{bad}"
        );
    }
    // duplicate LV names within one VG are rejected
    tree.new_lvm_lv("data", vg, LvSpec { size: Size::gib(1), ..Default::default() })
        .unwrap();
    assert!(tree
        .new_lvm_lv("data", vg, LvSpec { size: Size::gib(1), ..Default::default() })
        .is_err());
}

#[test]
fn lv_max_size_is_bounded_by_free_space_and_format() {
    let mut tree = DeviceTree::new();
    let (vg, _) = simple_vg(&mut tree, Size::gib(10), 1);
    let lv = tree
        .new_lvm_lv("data", vg, LvSpec { size: Size::gib(2), ..Default::default() })
        .unwrap();
    let max = tree.lv_max_size(lv).unwrap();
    assert_eq!(max, Size::gib(2) + tree.vg_free_space(vg).unwrap());
}
