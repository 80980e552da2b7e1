//! Headless host for the booth pipeline.

pub mod sequencer;
