//! Core Error Types and User-Facing Classification
//!
//! Two layers live here:
//! - typed errors ([`CoreError`], [`PipelineError`]) propagated with `?`
//! - the classification used to turn arbitrary error text into a stable
//!   [`ErrorKind`] and a UI string for a given [`ErrorContext`]

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the pipeline thread and codec backends
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Cannot open {uri}: {message}")]
    Load { uri: String, message: String },

    #[error("No media loaded")]
    NoMedia,

    #[error("Output unavailable: {0}")]
    Output(String),

    #[error("Exclusive mode requires ALSA")]
    ExclusiveRequiresAlsa,

    #[error("Rate/depth mismatch: source {source_rate} Hz/{source_depth}-bit, sink {sink_rate} Hz/{sink_depth}-bit")]
    FormatMismatch {
        source_rate: u32,
        source_depth: u16,
        sink_rate: u32,
        sink_depth: u16,
    },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Pipeline not running")]
    NotRunning,
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur in the audio core
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Platform error: {0}")]
    Platform(#[from] hiresti_platform::PlatformError),

    #[error("DSP error: {0}")]
    Dsp(#[from] hiresti_dsp::DspError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Settings error at {path:?}: {message}")]
    Settings { path: PathBuf, message: String },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("No output device available")]
    NoOutput,

    #[error("Stream URL resolution failed: {0}")]
    Resolve(String),

    #[error("Failed to spawn thread {name}: {message}")]
    Spawn { name: String, message: String },

    #[error("Work queue is full")]
    QueueFull,

    #[error("Channel send error - receiver dropped")]
    ChannelSend,

    #[error("Audio core is shut down")]
    ShutDown,
}

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoreError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Http(err.to_string())
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Coarse error kind derived from error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Server,
    Network,
    NotFound,
    Busy,
    Parse,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Server => "server",
            ErrorKind::Network => "network",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Busy => "busy",
            ErrorKind::Parse => "parse",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an error surfaced; selects the message table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorContext {
    Search,
    Playback,
    Lyrics,
    General,
}

/// Substring table, checked in order; first hit wins
const KIND_KEYWORDS: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::Auth,
        &["401", "403", "unauthorized", "forbidden", "login", "session expired", "token"],
    ),
    (
        ErrorKind::Server,
        &[
            "500",
            "502",
            "503",
            "504",
            "internal server error",
            "bad gateway",
            "service unavailable",
        ],
    ),
    (
        ErrorKind::Network,
        &["timeout", "timed out", "connection", "network", "dns", "unreachable"],
    ),
    (ErrorKind::NotFound, &["404", "not found", "no such"]),
    (ErrorKind::Busy, &["busy", "in use", "resource busy"]),
    (ErrorKind::Parse, &["json", "decode", "parse", "invalid"]),
];

/// Classify error text by case-insensitive substring match
pub fn classify(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    KIND_KEYWORDS
        .iter()
        .find(|(_, keys)| keys.iter().any(|k| lower.contains(k)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// UI string for `(kind, context)`
///
/// These strings are part of the UI contract; change them only together
/// with the front-end.
pub fn user_message(kind: ErrorKind, context: ErrorContext) -> &'static str {
    use ErrorKind::*;
    match context {
        ErrorContext::Search => match kind {
            Auth => "Search unavailable. Please login again.",
            Server => "Search temporarily unavailable on server side. Please retry.",
            Network => "Search failed due to network issue. Please retry.",
            NotFound => "No matching results found.",
            Parse => "Search response format error. Please retry.",
            Busy | Unknown => "Search failed. Please retry.",
        },
        ErrorContext::Playback => match kind {
            Auth => "Playback unavailable. Please login again.",
            Server => "Playback service is busy on server side. Please retry shortly.",
            Network => "Playback failed due to network issue.",
            Busy => "Output device is busy. Try another device.",
            NotFound => "Track stream is unavailable.",
            Parse | Unknown => "Playback failed. Please retry.",
        },
        ErrorContext::Lyrics => match kind {
            Auth => "Lyrics unavailable. Please login again.",
            Server => "Lyrics service is temporarily unavailable.",
            Network => "Lyrics request timed out. Please retry.",
            NotFound => "No lyrics available for this track.",
            Parse => "Lyrics format is not supported.",
            Busy | Unknown => "Lyrics unavailable right now.",
        },
        ErrorContext::General => "Operation failed. Please retry.",
    }
}

/// Category of an error reported by the codec backend's bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorCategory {
    /// Output device vanished or the sink failed
    Device,
    Network,
    Codec,
    Other,
}

const DEVICE_KEYWORDS: &[&str] = &[
    "disconnected",
    "no such device",
    "device has been disconnected",
    "alsa",
    "pulseaudio",
    "pipewire",
    "outputting to audio device",
];
const NETWORK_KEYWORDS: &[&str] = &["timeout", "timed out", "network", "connection", "dns", "tls", "ssl"];
const CODEC_KEYWORDS: &[&str] = &[
    "decode",
    "decoder",
    "codec",
    "not-negotiated",
    "caps",
    "demux",
    "parser",
];

/// Sort a backend bus error into the category that drives the output policy
pub fn classify_backend_error(text: &str) -> BackendErrorCategory {
    let lower = text.to_lowercase();
    let hit = |keys: &[&str]| keys.iter().any(|k| lower.contains(k));
    if hit(DEVICE_KEYWORDS) {
        BackendErrorCategory::Device
    } else if hit(NETWORK_KEYWORDS) {
        BackendErrorCategory::Network
    } else if hit(CODEC_KEYWORDS) {
        BackendErrorCategory::Codec
    } else {
        BackendErrorCategory::Other
    }
}
