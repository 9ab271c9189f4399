// SPDX-License-Identifier: GPL-3.0-only

//! Byte-exact size arithmetic for storage management
//!
//! This crate defines [`Size`], the single representation of byte quantities
//! used throughout the stack. A `Size` is an exact (integer) number of bytes;
//! conversions to IEC (KiB..YiB) and SI (KB..YB) units, string parsing, unit
//! rounding and human-readable rendering are all built on top of that exact
//! value so that formatting and re-parsing never drift.

pub mod size;

pub use size::{RoundMode, Size, SizeError, Unit};

/// Result type alias for size operations
pub type Result<T> = std::result::Result<T, SizeError>;
