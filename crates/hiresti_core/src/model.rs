//! Data Model
//!
//! Plain values shared between the pipeline, the state machine and the
//! host: tracks, stream formats, output requests and the output state.

use std::fmt;

use serde::{Deserialize, Serialize};

use hiresti_platform::{Driver, DEFAULT_OUTPUT_NAME};

use crate::config::LatencyProfile;

/// A playable track as handed over by the music service layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub duration_s: f64,
    pub artist_id: String,
    pub artist_name: String,
    pub album_id: String,
    pub album_name: String,
    pub cover: Option<String>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Bitrate above which a lossless stream without depth info is assumed 24-bit
const HIRES_BITRATE_GUESS: u32 = 1_200_000;

/// Format of the decoded source; fields stay zero until known
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub rate: u32,
    pub depth: u16,
    pub channels: u16,
    pub codec: String,
    /// Bits per second
    pub bitrate: u32,
}

impl StreamFormat {
    pub fn new(rate: u32, depth: u16, codec: &str) -> Self {
        Self {
            rate,
            depth,
            channels: 2,
            codec: normalize_codec(codec),
            bitrate: 0,
        }
    }

    pub fn is_known(&self) -> bool {
        self.rate > 0
    }

    pub fn is_lossy(&self) -> bool {
        matches!(self.codec.as_str(), "AAC" | "MP3")
    }

    /// Depth for display and comparison
    ///
    /// Lossy codecs report 16-bit; lossless streams without a depth tag are
    /// guessed from the bitrate.
    pub fn effective_depth(&self) -> u16 {
        if self.depth > 0 {
            return self.depth;
        }
        if self.is_lossy() {
            return 16;
        }
        match self.bitrate {
            0 => 0,
            b if b > HIRES_BITRATE_GUESS => 24,
            _ => 16,
        }
    }

    /// Merge a later tag update; zero/empty fields do not overwrite
    pub fn merge(&mut self, update: &StreamFormat) {
        if update.rate > 0 {
            self.rate = update.rate;
        }
        if update.depth > 0 {
            self.depth = update.depth;
        }
        if update.channels > 0 {
            self.channels = update.channels;
        }
        if !update.codec.is_empty() {
            self.codec = normalize_codec(&update.codec);
        }
        if update.bitrate > 0 {
            self.bitrate = update.bitrate;
        }
    }

    /// `"96kHz | 24-bit"`, `"44.1kHz"` when the depth is unknown, `"-"` when nothing is
    pub fn describe(&self) -> String {
        if self.rate == 0 {
            return "-".to_string();
        }
        let khz = f64::from(self.rate) / 1000.0;
        match self.effective_depth() {
            0 => format!("{}kHz", khz),
            depth => format!("{}kHz | {}-bit", khz, depth),
        }
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate / 1000
    }
}

/// Map codec tags from demuxers and services onto a short name
pub fn normalize_codec(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if upper.is_empty() {
        return String::new();
    }
    let name = if upper.contains("FLAC") {
        "FLAC"
    } else if upper.contains("ALAC") || upper.contains("APPLE LOSSLESS") {
        "ALAC"
    } else if upper.contains("AAC") || upper.contains("MP4A") {
        "AAC"
    } else if upper.contains("MP3") || upper.contains("LAYER 3") || upper.contains("MPEG-1 AUDIO") {
        "MP3"
    } else if upper.contains("PCM") || upper.contains("WAV") || upper.contains("RAW") {
        "PCM"
    } else {
        return raw.trim().to_string();
    };
    name.to_string()
}

/// Format the sink actually accepted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkFormat {
    pub rate: u32,
    pub depth: u16,
    pub channels: u16,
}

impl SinkFormat {
    pub fn matches(&self, source: &StreamFormat) -> bool {
        source.rate == self.rate && source.effective_depth() == self.depth
    }
}

/// Requested output target and mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub driver: Driver,
    /// `None` selects the driver's default sink
    pub device_id: Option<String>,
    pub device_name: String,
    pub bit_perfect: bool,
    pub exclusive: bool,
    pub latency: LatencyProfile,
}

impl Default for OutputRequest {
    fn default() -> Self {
        Self {
            driver: Driver::Auto,
            device_id: None,
            device_name: DEFAULT_OUTPUT_NAME.to_string(),
            bit_perfect: false,
            exclusive: false,
            latency: LatencyProfile::default(),
        }
    }
}

impl OutputRequest {
    /// Identity used for coalescing repeated switches
    pub fn target(&self) -> (Driver, Option<&str>) {
        (self.driver, self.device_id.as_deref())
    }

    /// Key into the per-device visual offset table
    pub fn offset_key(&self) -> String {
        let device = self.device_id.as_deref().unwrap_or(&self.device_name);
        format!("{}|{}", self.driver, device)
    }
}

/// User-visible output status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum OutputState {
    #[default]
    Idle,
    Switching,
    Active,
    Fallback(String),
    Error(String),
}

impl OutputState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputState::Idle => "idle",
            OutputState::Switching => "switching",
            OutputState::Active => "active",
            OutputState::Fallback(_) => "fallback",
            OutputState::Error(_) => "error",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            OutputState::Fallback(r) | OutputState::Error(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, OutputState::Fallback(_) | OutputState::Error(_))
    }
}

impl fmt::Display for OutputState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{} ({})", self.as_str(), reason),
            None => f.write_str(self.as_str()),
        }
    }
}

/// Queue play mode as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayMode {
    #[default]
    Loop,
    One,
    Shuffle,
    Smart,
}

impl PlayMode {
    pub fn index(self) -> u8 {
        match self {
            PlayMode::Loop => 0,
            PlayMode::One => 1,
            PlayMode::Shuffle => 2,
            PlayMode::Smart => 3,
        }
    }

    pub fn from_index(index: i64) -> Option<Self> {
        match index {
            0 => Some(PlayMode::Loop),
            1 => Some(PlayMode::One),
            2 => Some(PlayMode::Shuffle),
            3 => Some(PlayMode::Smart),
            _ => None,
        }
    }
}
