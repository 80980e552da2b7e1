//! Pure building blocks for the snapbooth generation core.
//!
//! Job templates and the style catalog, job materialization, per-job
//! progress accounting, and output-artifact discovery. Nothing in this
//! crate talks to the network.

pub mod artifact;
pub mod builder;
pub mod error;
pub mod progress;
pub mod template;
pub mod types;
