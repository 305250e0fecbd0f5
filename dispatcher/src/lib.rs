//! Dispatch batches of experiment runs to a cluster.
//!
//! A batch is a base experiment config plus one override set per run. Overrides are checked
//! against the config schema, runs the tracker already knows about are skipped and the
//! remaining ones are handed to a submission backend (or only printed in a dry run).

pub mod backends;
pub mod config;
pub mod context;
pub mod counter;
pub mod dispatch;
pub mod git;
pub mod job;
pub mod overrides;
pub mod resources;
pub mod tracker;

pub use dispatch::{DispatchError, DispatchReport, Dispatcher, ExperimentBatch, Outcome};
pub use overrides::INVALID_OVERRIDES;
