/// ComfyUI node identifiers are the string keys of the workflow object.
pub type NodeId = String;

/// Aggregate job progress, `0.0..=100.0` in normal operation.
///
/// Not clamped: a remote service reporting more steps than a node
/// declared pushes the value past 100.
pub type Percent = f64;
