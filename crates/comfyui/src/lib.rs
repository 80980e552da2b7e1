//! ComfyUI WebSocket and REST client library.
//!
//! Provides loose message decoding, WebSocket connection setup, the HTTP
//! submission endpoint, and the per-job [`channel::JobChannel`] that ties
//! them together for one generation.

pub mod api;
pub mod channel;
pub mod client;
pub mod messages;
