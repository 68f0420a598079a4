//! Core orchestration for imgdesc.
//!
//! This crate turns a worklist configuration into work items and drives them
//! through fetching, inference and storage as one run.

pub mod pipeline;
pub mod worklist;

pub use pipeline::{
    Pipeline, PipelineRun, ProgressReporter, Reconciled, RunState, SilentProgress, reconcile,
};
pub use worklist::{ItemRange, UrlTemplate};
