// SPDX-License-Identifier: GPL-3.0-only

//! In-memory model of a Linux storage stack
//!
//! The model is a typed, acyclic device graph held in an ID-indexed arena
//! ([`tree::DeviceTree`]). Devices are sum types over a closed set of kinds
//! (disks, partitions, md arrays, LVM volume groups and logical volumes,
//! btrfs volumes and subvolumes, LUKS and device-mapper devices, and
//! file-backed leaves), each carrying exactly one [`format::Format`] record.
//!
//! All mutation goes through `DeviceTree` methods, which enforce the graph
//! invariants (acyclicity, parent-count and member-format rules, name
//! uniqueness, UUID cross-checks) before committing a change. Aggregate
//! sizing (array capacity, volume-group free space, reservations) is
//! computed from the graph rather than cached, so queued changes are always
//! reflected.

pub mod container;
pub mod device;
pub mod error;
pub mod format;
pub mod name;
pub mod tree;

pub use container::lvm::{
    LvSpec, cache_default_md_size, is_valid_thpool_chunk_size, is_valid_thpool_md_size,
    thpool_meta_size,
};
pub use device::{
    CacheType, Device, DeviceCommon, DeviceId, DeviceKind, DeviceState, InternalLvKind, LvPvSpec,
    LvSegment, LvmCache, LvmCacheRequest, PartType, Tag, ThPoolReserve,
};
pub use error::{ModelError, Result};
pub use format::{DisklabelType, Format, FormatKind};
pub use tree::{DeviceTree, FormatEvent};
