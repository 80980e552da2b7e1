//! Generation pipeline for the booth.
//!
//! [`runner::JobRunner`] drives a single ComfyUI job end to end,
//! [`worker::GenerationWorker`] and [`countdown::CountdownTimer`] run
//! cancelable work off the caller's thread, and [`session::BoothSession`]
//! bundles them into the surface a front end drives.

mod background;
pub mod config;
pub mod countdown;
pub mod runner;
pub mod session;
pub mod worker;
