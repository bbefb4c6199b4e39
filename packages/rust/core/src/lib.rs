//! Pipeline orchestration for PostVault.
//!
//! This crate ties fetching, extraction, dedup filtering, downloading, and
//! remote sync together into the end-to-end run executed by the CLI.

pub mod pipeline;

pub use pipeline::{Pipeline, RunPhase, RunSummary};
