// SPDX-License-Identifier: GPL-3.0-only

//! Action planning and execution
//!
//! Callers describe changes to the in-memory device graph through
//! [`plan::Planner`] operations, which mutate the graph immediately and
//! queue [`action::Action`] records. Executing the plan schedules the
//! actions (class order, then topological order within a class), emits
//! structured operation descriptors for the external tools, and dispatches
//! them through a caller-supplied [`runner::Runner`].
//!
//! Discovery flows the other way: a prober feeds typed records into
//! [`probe::ingest`], which materializes devices in the graph.

pub mod action;
pub mod activate;
pub mod cmds;
pub mod error;
pub mod mdconf;
pub mod plan;
pub mod probe;
pub mod runner;
pub mod schedule;

pub use action::{Action, ActionId, ActionKind};
pub use activate::{ModelStatusProbe, StatusProbe, setup_device, teardown_device};
pub use error::{OpsError, Result};
pub use mdconf::MdadmConf;
pub use plan::Planner;
pub use probe::{ProbeRecord, ingest};
pub use runner::{OpDescriptor, RecordingRunner, Runner, RunnerOutput, SystemRunner, require_tools};
