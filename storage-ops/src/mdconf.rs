// SPDX-License-Identifier: GPL-3.0-only

//! mdadm.conf persistence.
//!
//! mdadm hands out high minor numbers to arrays it has no configuration
//! entry for, so arrays discovered or created at runtime are pinned with
//! an `ARRAY <path> UUID=<uuid>` line.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Appends ARRAY lines to an mdadm configuration file.
#[derive(Debug, Clone)]
pub struct MdadmConf {
    path: PathBuf,
}

impl MdadmConf {
    pub fn new(path: impl Into<PathBuf>) -> MdadmConf {
        MdadmConf { path: path.into() }
    }

    /// The conventional system location.
    pub fn system() -> MdadmConf {
        MdadmConf::new("/etc/mdadm.conf")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an array, unless a line with its UUID is already present.
    pub fn note_array(&self, array_path: &str, mdadm_uuid: &str) -> std::io::Result<()> {
        let mut existing = String::new();
        if self.path.exists() {
            std::fs::File::open(&self.path)?.read_to_string(&mut existing)?;
            if existing
                .lines()
                .any(|line| line.contains(&format!("UUID={mdadm_uuid}")))
            {
                return Ok(());
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "ARRAY {array_path} UUID={mdadm_uuid}")?;
        Ok(())
    }
}
