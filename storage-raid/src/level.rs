// SPDX-License-Identifier: GPL-3.0-only

//! RAID level classification and sizing algebra.
//!
//! Each level is a pure-value classifier: all operations are functions of
//! member counts and sizes. Aggregating devices (md arrays, LVM RAID LVs,
//! btrfs volumes) consult a [`RaidLevelSet`] restricted to the levels their
//! backend supports.

use serde::{Deserialize, Serialize};
use storage_units::Size;
use thiserror::Error;

/// Error types for RAID level lookups and sizing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaidError {
    #[error("invalid RAID level descriptor {0:?}")]
    InvalidLevel(String),

    #[error("{level} requires at least {min} members, got {got}")]
    FewMembers {
        level: RaidLevel,
        min: usize,
        got: usize,
    },

    #[error("size is negative")]
    NegativeSize,

    #[error("chunk size must be non-zero for {0}")]
    ZeroChunk(RaidLevel),

    #[error("{0} has no data capacity of its own")]
    NoSizing(RaidLevel),

    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

/// A RAID level (strictly, a classification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidLevel {
    Linear,
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
    /// A BIOS-RAID set wrapper; neither data nor spares are counted.
    Container,
    Single,
    Dup,
}

fn div_up(a: i128, b: i128) -> i128 {
    (a + (b - 1)) / b
}

impl RaidLevel {
    /// Canonical name, e.g. "raid5".
    pub fn name(self) -> &'static str {
        match self {
            RaidLevel::Linear => "linear",
            RaidLevel::Raid0 => "raid0",
            RaidLevel::Raid1 => "raid1",
            RaidLevel::Raid4 => "raid4",
            RaidLevel::Raid5 => "raid5",
            RaidLevel::Raid6 => "raid6",
            RaidLevel::Raid10 => "raid10",
            RaidLevel::Container => "container",
            RaidLevel::Single => "single",
            RaidLevel::Dup => "dup",
        }
    }

    /// Nickname, if the level has one.
    pub fn nick(self) -> Option<&'static str> {
        match self {
            RaidLevel::Raid0 => Some("stripe"),
            RaidLevel::Raid1 => Some("mirror"),
            _ => None,
        }
    }

    /// Numeric code for numbered levels.
    pub fn number(self) -> Option<u32> {
        match self {
            RaidLevel::Raid0 => Some(0),
            RaidLevel::Raid1 => Some(1),
            RaidLevel::Raid4 => Some(4),
            RaidLevel::Raid5 => Some(5),
            RaidLevel::Raid6 => Some(6),
            RaidLevel::Raid10 => Some(10),
            _ => None,
        }
    }

    /// Whether `descriptor` names this level (canonical name, nickname, or
    /// bare number, case-insensitively).
    pub fn matches(self, descriptor: &str) -> bool {
        let descriptor = descriptor.trim();
        if descriptor.eq_ignore_ascii_case(self.name()) {
            return true;
        }
        if let Some(nick) = self.nick() {
            if descriptor.eq_ignore_ascii_case(nick) {
                return true;
            }
        }
        if let Some(number) = self.number() {
            if descriptor == number.to_string() {
                return true;
            }
        }
        false
    }

    /// The smallest member count that makes this level meaningful.
    pub fn min_members(self) -> usize {
        match self {
            RaidLevel::Linear | RaidLevel::Container | RaidLevel::Single | RaidLevel::Dup => 1,
            RaidLevel::Raid0 | RaidLevel::Raid1 => 2,
            RaidLevel::Raid4 | RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 | RaidLevel::Raid10 => 4,
        }
    }

    /// Whether the level stores data redundantly.
    ///
    /// Containers have no data of their own; redundancy is reported as
    /// false and member-removal rules treat them specially.
    pub fn has_redundancy(self) -> bool {
        matches!(
            self,
            RaidLevel::Raid1
                | RaidLevel::Raid4
                | RaidLevel::Raid5
                | RaidLevel::Raid6
                | RaidLevel::Raid10
                | RaidLevel::Dup
        )
    }

    fn check_members(self, count: usize) -> Result<(), RaidError> {
        if count < self.min_members() {
            return Err(RaidError::FewMembers {
                level: self,
                min: self.min_members(),
                got: count,
            });
        }
        Ok(())
    }

    /// The maximum number of spares an array of `member_count` devices can
    /// carry at this level.
    pub fn max_spares(self, member_count: usize) -> Result<usize, RaidError> {
        self.check_members(member_count)?;
        Ok(match self {
            RaidLevel::Raid1
            | RaidLevel::Raid4
            | RaidLevel::Raid5
            | RaidLevel::Raid6
            | RaidLevel::Raid10 => member_count - self.min_members(),
            _ => 0,
        })
    }

    /// The per-member size needed to store `data` on `member_count` members.
    pub fn base_member_size(self, data: Size, member_count: usize) -> Result<Size, RaidError> {
        self.check_members(member_count)?;
        if data < Size::ZERO {
            return Err(RaidError::NegativeSize);
        }
        let n = member_count as i128;
        let bytes = data.bytes();
        let base = match self {
            RaidLevel::Linear | RaidLevel::Single => div_up(bytes, n),
            RaidLevel::Raid0 => div_up(bytes, n),
            RaidLevel::Raid1 | RaidLevel::Dup => bytes,
            RaidLevel::Raid4 | RaidLevel::Raid5 => div_up(bytes, n - 1),
            RaidLevel::Raid6 => div_up(bytes, n - 2),
            RaidLevel::Raid10 => div_up(bytes, n / 2),
            RaidLevel::Container => return Err(RaidError::NoSizing(self)),
        };
        Ok(Size::from_bytes(base))
    }

    /// Raw capacity from `member_count` members, each at least
    /// `smallest_member` in size.
    pub fn raw_array_size(
        self,
        member_count: usize,
        smallest_member: Size,
    ) -> Result<Size, RaidError> {
        self.check_members(member_count)?;
        if smallest_member < Size::ZERO {
            return Err(RaidError::NegativeSize);
        }
        let n = member_count as i128;
        let raw = match self {
            RaidLevel::Linear | RaidLevel::Single | RaidLevel::Raid0 => n * smallest_member.bytes(),
            RaidLevel::Raid1 | RaidLevel::Dup => smallest_member.bytes(),
            RaidLevel::Raid4 | RaidLevel::Raid5 => (n - 1) * smallest_member.bytes(),
            RaidLevel::Raid6 => (n - 2) * smallest_member.bytes(),
            RaidLevel::Raid10 => (n / 2) * smallest_member.bytes(),
            RaidLevel::Container => return Err(RaidError::NoSizing(self)),
        };
        Ok(Size::from_bytes(raw))
    }

    /// Whether the level stripes data in chunk-sized units, which makes the
    /// net size a whole multiple of the chunk.
    fn is_chunked(self) -> bool {
        matches!(
            self,
            RaidLevel::Raid0 | RaidLevel::Raid4 | RaidLevel::Raid5 | RaidLevel::Raid6
        )
    }

    /// Net array size from the given member sizes.
    ///
    /// The superblock reservation (`superblock_fn` of the smallest member)
    /// comes off every member; striped levels then round the capacity down
    /// to a chunk multiple. Linear and single sum the member sizes; RAID1
    /// and RAID10 return the usable data region without chunk trimming.
    pub fn size(
        self,
        member_sizes: &[Size],
        num_members: Option<usize>,
        chunk_size: Size,
        superblock_fn: &dyn Fn(Size) -> Size,
    ) -> Result<Size, RaidError> {
        if member_sizes.is_empty() {
            return Ok(Size::ZERO);
        }
        let count = num_members.unwrap_or(member_sizes.len());
        self.check_members(count)?;

        if self == RaidLevel::Container {
            return Err(RaidError::NoSizing(self));
        }

        if matches!(self, RaidLevel::Linear | RaidLevel::Single) {
            return Ok(member_sizes.iter().copied().sum());
        }

        let smallest = member_sizes.iter().copied().min().unwrap_or(Size::ZERO);
        let data = smallest - superblock_fn(smallest);
        if data < Size::ZERO {
            return Ok(Size::ZERO);
        }

        let raw = self.raw_array_size(count, data)?;
        if self.is_chunked() {
            if chunk_size <= Size::ZERO {
                return Err(RaidError::ZeroChunk(self));
            }
            let trimmed = raw
                - raw
                    .checked_rem(chunk_size)
                    .map_err(|_| RaidError::ZeroChunk(self))?;
            Ok(trimmed)
        } else {
            Ok(raw)
        }
    }

    /// Recommended filesystem stride in blocks, if the level has one.
    pub fn recommended_stride(self, member_count: usize) -> Result<Option<u64>, RaidError> {
        self.check_members(member_count)?;
        let n = member_count as u64;
        Ok(match self {
            RaidLevel::Raid0 => Some(n * 16),
            RaidLevel::Raid4 | RaidLevel::Raid5 => Some((n - 1) * 16),
            _ => None,
        })
    }
}

impl std::fmt::Display for RaidLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A restricted registry of RAID levels.
///
/// Aggregates validate level descriptors against the set their backend
/// supports rather than the full classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaidLevelSet {
    levels: Vec<RaidLevel>,
}

impl RaidLevelSet {
    pub fn new(levels: &[RaidLevel]) -> RaidLevelSet {
        let mut deduped: Vec<RaidLevel> = Vec::new();
        for level in levels {
            if !deduped.contains(level) {
                deduped.push(*level);
            }
        }
        RaidLevelSet { levels: deduped }
    }

    /// Every level in this package's classification.
    pub fn standard() -> RaidLevelSet {
        RaidLevelSet::new(&[
            RaidLevel::Linear,
            RaidLevel::Raid0,
            RaidLevel::Raid1,
            RaidLevel::Raid4,
            RaidLevel::Raid5,
            RaidLevel::Raid6,
            RaidLevel::Raid10,
            RaidLevel::Container,
            RaidLevel::Single,
            RaidLevel::Dup,
        ])
    }

    /// Levels mdadm can assemble.
    pub fn md() -> RaidLevelSet {
        RaidLevelSet::new(&[
            RaidLevel::Raid0,
            RaidLevel::Raid1,
            RaidLevel::Raid4,
            RaidLevel::Raid5,
            RaidLevel::Raid6,
            RaidLevel::Raid10,
            RaidLevel::Container,
            RaidLevel::Linear,
        ])
    }

    /// Levels usable as LVM RAID segment types.
    pub fn lvm() -> RaidLevelSet {
        RaidLevelSet::new(&[
            RaidLevel::Raid0,
            RaidLevel::Raid1,
            RaidLevel::Raid4,
            RaidLevel::Raid5,
            RaidLevel::Raid6,
            RaidLevel::Raid10,
            RaidLevel::Linear,
        ])
    }

    /// Levels accepted for btrfs data.
    pub fn btrfs_data() -> RaidLevelSet {
        RaidLevelSet::new(&[
            RaidLevel::Single,
            RaidLevel::Raid0,
            RaidLevel::Raid1,
            RaidLevel::Raid10,
            RaidLevel::Raid5,
            RaidLevel::Raid6,
        ])
    }

    /// Levels accepted for btrfs metadata; `dup` is metadata-only.
    pub fn btrfs_metadata() -> RaidLevelSet {
        RaidLevelSet::new(&[
            RaidLevel::Single,
            RaidLevel::Dup,
            RaidLevel::Raid0,
            RaidLevel::Raid1,
            RaidLevel::Raid10,
            RaidLevel::Raid5,
            RaidLevel::Raid6,
        ])
    }

    pub fn levels(&self) -> &[RaidLevel] {
        &self.levels
    }

    pub fn contains(&self, level: RaidLevel) -> bool {
        self.levels.contains(&level)
    }

    /// Look up a level by any of its valid names.
    pub fn resolve(&self, descriptor: &str) -> Result<RaidLevel, RaidError> {
        self.levels
            .iter()
            .copied()
            .find(|level| level.matches(descriptor))
            .ok_or_else(|| RaidError::InvalidLevel(descriptor.to_string()))
    }
}
