//! Booth configuration from environment variables.
//!
//! Everything has a default, so a booth next to a local ComfyUI checkout
//! runs without any variables set.

use std::path::PathBuf;
use std::time::Duration;

use snapbooth_comfyui::channel::ChannelConfig;
use snapbooth_comfyui::messages::CompletionEvents;

/// Errors from reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Booth configuration loaded from environment variables.
///
/// All fields have defaults suitable for a ComfyUI checkout next to the
/// booth. Override via environment variables.
#[derive(Debug, Clone)]
pub struct BoothConfig {
    /// ComfyUI WebSocket endpoint (default: `ws://127.0.0.1:8188/ws`).
    pub ws_url: String,
    /// ComfyUI HTTP base URL (default: `http://127.0.0.1:8188`).
    pub api_url: String,
    /// Directory of `<style>.json` job templates (default: `./workflows`).
    pub workflow_dir: PathBuf,
    /// Style catalog file (default: `./workflows/styles.json`).
    pub styles_file: PathBuf,
    /// Where ComfyUI writes its results. Only ever read.
    pub output_dir: PathBuf,
    /// Where the captured image is staged for the load-image node.
    pub input_image: PathBuf,
    /// Archive directory for kept results. Archiving is off when unset.
    pub saved_dir: Option<PathBuf>,
    pub keep_generated: bool,
    /// Keep the staged input, and archive it alongside kept results.
    pub keep_input: bool,
    /// First countdown value (default: `2`).
    pub countdown_start: u32,
    pub handshake_timeout: Duration,
    /// Upper bound on the `POST /prompt` round trip.
    pub submit_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub receive_poll: Duration,
    pub artifact_timeout: Duration,
    pub artifact_poll: Duration,
    pub completion_events: CompletionEvents,
}

impl Default for BoothConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8188/ws".into(),
            api_url: "http://127.0.0.1:8188".into(),
            workflow_dir: PathBuf::from("./workflows"),
            styles_file: PathBuf::from("./workflows/styles.json"),
            output_dir: PathBuf::from("../ComfyUI/output"),
            input_image: PathBuf::from("../ComfyUI/input/input.png"),
            saved_dir: None,
            keep_generated: false,
            keep_input: false,
            countdown_start: 2,
            handshake_timeout: Duration::from_secs(10),
            submit_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            receive_poll: Duration::from_millis(1000),
            artifact_timeout: Duration::from_secs(15),
            artifact_poll: Duration::from_millis(500),
            completion_events: CompletionEvents::default(),
        }
    }
}

impl BoothConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                        |
    /// |----------------------------------|--------------------------------|
    /// | `COMFYUI_WS_URL`                 | `ws://127.0.0.1:8188/ws`       |
    /// | `COMFYUI_API_URL`                | `http://127.0.0.1:8188`        |
    /// | `BOOTH_WORKFLOW_DIR`             | `./workflows`                  |
    /// | `BOOTH_STYLES_FILE`              | `./workflows/styles.json`      |
    /// | `COMFYUI_OUTPUT_DIR`             | `../ComfyUI/output`            |
    /// | `COMFYUI_INPUT_IMAGE`            | `../ComfyUI/input/input.png`   |
    /// | `BOOTH_SAVED_DIR`                | unset                          |
    /// | `BOOTH_KEEP_GENERATED`           | `false`                        |
    /// | `BOOTH_KEEP_INPUT`               | `false`                        |
    /// | `BOOTH_COUNTDOWN_START`          | `2`                            |
    /// | `COMFYUI_HANDSHAKE_TIMEOUT_SECS` | `10`                           |
    /// | `COMFYUI_SUBMIT_TIMEOUT_SECS`    | `30`                           |
    /// | `COMFYUI_HEARTBEAT_SECS`         | `15`                           |
    /// | `COMFYUI_RECEIVE_POLL_MS`        | `1000`                         |
    /// | `BOOTH_ARTIFACT_TIMEOUT_SECS`    | `15`                           |
    /// | `BOOTH_ARTIFACT_POLL_MS`         | `500`                          |
    /// | `COMFYUI_COMPLETION_EVENTS`      | `done,execution_success,execution_complete,execution_end` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let completion_events = match var("COMFYUI_COMPLETION_EVENTS") {
            Some(list) => {
                let events = CompletionEvents::new(list.split(','));
                if events.is_empty() {
                    return Err(invalid(
                        "COMFYUI_COMPLETION_EVENTS",
                        list,
                        "a comma-separated list of event types",
                    ));
                }
                events
            }
            None => defaults.completion_events,
        };

        Ok(Self {
            ws_url: var("COMFYUI_WS_URL").unwrap_or(defaults.ws_url),
            api_url: var("COMFYUI_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            workflow_dir: var("BOOTH_WORKFLOW_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflow_dir),
            styles_file: var("BOOTH_STYLES_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.styles_file),
            output_dir: var("COMFYUI_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            input_image: var("COMFYUI_INPUT_IMAGE")
                .map(PathBuf::from)
                .unwrap_or(defaults.input_image),
            saved_dir: var("BOOTH_SAVED_DIR").map(PathBuf::from),
            keep_generated: parse_bool(
                "BOOTH_KEEP_GENERATED",
                var("BOOTH_KEEP_GENERATED"),
                defaults.keep_generated,
            )?,
            keep_input: parse_bool("BOOTH_KEEP_INPUT", var("BOOTH_KEEP_INPUT"), defaults.keep_input)?,
            countdown_start: parse_num(
                "BOOTH_COUNTDOWN_START",
                var("BOOTH_COUNTDOWN_START"),
                defaults.countdown_start,
            )?,
            handshake_timeout: Duration::from_secs(parse_num(
                "COMFYUI_HANDSHAKE_TIMEOUT_SECS",
                var("COMFYUI_HANDSHAKE_TIMEOUT_SECS"),
                defaults.handshake_timeout.as_secs(),
            )?),
            submit_timeout: Duration::from_secs(parse_positive(
                "COMFYUI_SUBMIT_TIMEOUT_SECS",
                var("COMFYUI_SUBMIT_TIMEOUT_SECS"),
                defaults.submit_timeout.as_secs(),
            )?),
            heartbeat_interval: Duration::from_secs(parse_positive(
                "COMFYUI_HEARTBEAT_SECS",
                var("COMFYUI_HEARTBEAT_SECS"),
                defaults.heartbeat_interval.as_secs(),
            )?),
            receive_poll: Duration::from_millis(parse_positive(
                "COMFYUI_RECEIVE_POLL_MS",
                var("COMFYUI_RECEIVE_POLL_MS"),
                defaults.receive_poll.as_millis() as u64,
            )?),
            artifact_timeout: Duration::from_secs(parse_num(
                "BOOTH_ARTIFACT_TIMEOUT_SECS",
                var("BOOTH_ARTIFACT_TIMEOUT_SECS"),
                defaults.artifact_timeout.as_secs(),
            )?),
            artifact_poll: Duration::from_millis(parse_positive(
                "BOOTH_ARTIFACT_POLL_MS",
                var("BOOTH_ARTIFACT_POLL_MS"),
                defaults.artifact_poll.as_millis() as u64,
            )?),
            completion_events,
        })
    }

    /// Settings for each job's event channel.
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            handshake_timeout: self.handshake_timeout,
            heartbeat_interval: self.heartbeat_interval,
            receive_poll: self.receive_poll,
            completion_events: self.completion_events.clone(),
        }
    }
}

fn invalid(var: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        expected,
    }
}

fn parse_num<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| invalid(var, raw, "a non-negative integer")),
        None => Ok(default),
    }
}

/// Intervals of zero would spin.
fn parse_positive(var: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match parse_num(var, value, default)? {
        0 => Err(invalid(var, "0".into(), "a positive integer")),
        n => Ok(n),
    }
}

fn parse_bool(var: &'static str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, raw, "a boolean (true/false)")),
    }
}
