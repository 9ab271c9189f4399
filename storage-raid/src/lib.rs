// SPDX-License-Identifier: GPL-3.0-only

//! RAID level registry and sizing rules
//!
//! A closed set of RAID levels with pure sizing functions (member counts,
//! spare limits, usable capacity, filesystem stride hints) plus the
//! md-specific metadata rules: default chunk size, superblock reservation,
//! and the conversion between canonical RFC-4122 UUIDs and mdadm's
//! colon-grouped form.

pub mod level;
pub mod mdraid;

pub use level::{RaidError, RaidLevel, RaidLevelSet};
pub use mdraid::{
    MD_CHUNK_SIZE, MD_SUPERBLOCK_SIZE, canonical_from_mduuid, md_superblock_size,
    mduuid_from_canonical,
};

/// Result type alias for RAID computations
pub type Result<T> = std::result::Result<T, RaidError>;
