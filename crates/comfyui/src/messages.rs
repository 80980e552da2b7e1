//! ComfyUI WebSocket message decoding.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. The vocabulary drifts between
//! server versions and custom nodes, so messages are decoded loosely
//! into a [`RawEvent`] and then classified into the handful of
//! [`ChannelEvent`]s the job channel acts on.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer};

/// Event type carrying per-node step progress.
pub const PROGRESS_EVENT: &str = "progress";

/// Event type signalling a failed execution.
pub const EXECUTION_ERROR_EVENT: &str = "execution_error";

/// Completion synonyms recognized when none are configured.
pub const DEFAULT_COMPLETION_EVENTS: &[&str] = &[
    "done",
    "execution_success",
    "execution_complete",
    "execution_end",
];

/// A decoded but unclassified server message.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<EventData>,
}

/// The `data` payload. Every field is optional; unknown keys are kept
/// in [`rest`](Self::rest).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    /// Node id. Some servers send it as a number.
    #[serde(default, deserialize_with = "string_or_number")]
    pub node: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Session id announced in the first `status` message.
    #[serde(default)]
    pub sid: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl RawEvent {
    /// Session identifier carried by a handshake message, if any.
    pub fn session_id(&self) -> Option<&str> {
        let data = self.data.as_ref()?;
        data.sid
            .as_deref()
            .or(data.client_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// What the job channel does with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Step progress for one node. Missing values count as zero.
    Progress { node: Option<String>, value: f64 },
    /// One of the completion synonyms.
    Completed { kind: String },
    /// The job failed remotely.
    ExecutionError { message: Option<String> },
    /// Anything else; ignored while listening.
    Other { kind: String },
}

/// The configurable set of event types that mean "job finished".
///
/// Compared case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvents {
    kinds: HashSet<String>,
}

impl CompletionEvents {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            kinds: kinds
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains(&kind.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for CompletionEvents {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_EVENTS)
    }
}

/// Parse a ComfyUI WebSocket text message.
///
/// Returns `Err` only for text that is not a JSON object with a string
/// `type`. Unknown types decode fine and classify as
/// [`ChannelEvent::Other`].
pub fn parse_message(text: &str) -> Result<RawEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Map a decoded message onto the channel's vocabulary.
pub fn classify(event: &RawEvent, completion: &CompletionEvents) -> ChannelEvent {
    let data = event.data.as_ref();
    if event.kind == PROGRESS_EVENT {
        return ChannelEvent::Progress {
            node: data.and_then(|d| d.node.clone()),
            value: data.and_then(|d| d.value).unwrap_or(0.0),
        };
    }
    if completion.contains(&event.kind) {
        return ChannelEvent::Completed {
            kind: event.kind.clone(),
        };
    }
    if event.kind == EXECUTION_ERROR_EVENT {
        return ChannelEvent::ExecutionError {
            message: data.and_then(|d| d.exception_message.clone()),
        };
    }
    ChannelEvent::Other {
        kind: event.kind.clone(),
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
