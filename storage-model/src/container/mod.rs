// SPDX-License-Identifier: GPL-3.0-only

//! Member semantics of aggregating devices.
//!
//! md arrays, LVM volume groups and btrfs volumes all bind members through
//! an on-member format that cross-references the aggregate by UUID. The
//! shared UUID verification lives here; the per-backend rules live in the
//! submodules.

pub mod btrfs;
pub mod lvm;
pub mod md;

use tracing::warn;

use crate::device::DeviceId;
use crate::error::{ModelError, Result};
use crate::tree::DeviceTree;

/// Check the relationship between a member format's aggregate UUID and the
/// aggregate's own UUID.
///
/// With `expect_equality` the UUIDs must match (adding a discovered member
/// to its aggregate); without it they must differ (re-adding a member that
/// already belongs elsewhere is refused by the caller). Checks are skipped
/// when either UUID is unavailable, or when `require_existence` is set and
/// the member format does not exist yet.
pub(crate) fn verify_member_uuid(
    tree: &DeviceTree,
    container: DeviceId,
    member: DeviceId,
    expect_equality: bool,
    require_existence: bool,
) -> Result<()> {
    let container_dev = tree.get(container)?;
    let member_dev = tree.get(member)?;

    let member_uuid = member_dev.format().container_uuid();
    let container_uuid = container_dev.common.uuid.as_deref();

    if container_dev.exists() && (member_uuid.is_none() || container_uuid.is_none()) {
        warn!(
            container = container_dev.name(),
            member = member_dev.name(),
            "at least one UUID missing, skipping member UUID check"
        );
        return Ok(());
    }

    if require_existence && !member_dev.format().exists {
        return Ok(());
    }

    let uuids_equal = member_uuid == container_uuid;
    if expect_equality && !uuids_equal {
        return Err(ModelError::device(
            container_dev.name(),
            format!(
                "member {} format UUID {:?} does not match expected UUID {:?}",
                member_dev.name(),
                member_uuid,
                container_uuid
            ),
        ));
    }
    if !expect_equality && uuids_equal {
        return Err(ModelError::device(
            container_dev.name(),
            format!(
                "member {} is already part of this container",
                member_dev.name()
            ),
        ));
    }
    Ok(())
}
