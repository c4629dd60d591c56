//! Message Types for Thread Communication
//!
//! Commands flow from the foreground thread -> pipeline thread.
//! Events flow from the pipeline thread -> foreground thread.
//! Work results flow from worker/watchdog threads -> foreground thread.

use serde::{Deserialize, Serialize};

use hiresti_platform::{ClockSettings, DeviceList, Driver, RuntimeFormat};

use crate::model::{OutputRequest, SinkFormat, StreamFormat, Track};

/// Commands sent from the foreground thread to the pipeline thread
#[derive(Debug, Clone)]
pub enum PipelineCommand {
    /// Tear down the current graph and open `uri`
    Load { uri: String, request_id: u64 },

    Play,

    Pause,

    /// Stop and release decode resources
    Stop,

    Seek(f64),

    /// Software volume (0.0 - 1.0); forced to 1.0 under bit-perfect
    SetVolume(f32),

    SetEqBand { band: usize, gain_db: f32 },

    /// Rebuild the sink for `request`
    SetOutput { request_id: u64, request: OutputRequest },

    /// Sink buffer and period sizes
    SetAlsaLatency { buffer_ms: u32, latency_ms: u32 },

    SetSpectrumEnabled(bool),

    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Events sent from the pipeline thread to the foreground thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    /// Media opened and pre-rolled
    Loaded {
        request_id: u64,
        format: StreamFormat,
        duration_s: Option<f64>,
    },

    LoadFailed { request_id: u64, message: String },

    StateChanged(PlaybackState),

    /// Format-relevant tag update
    Tag(StreamFormat),

    /// Sink drained
    Eos,

    /// Bus error from the codec backend
    Error { message: String },

    /// Sink (re)built; `request_id` is 0 when triggered by a load
    OutputApplied {
        request_id: u64,
        sink: SinkFormat,
        elements: Vec<String>,
        /// Set when audio flows but not as requested
        fallback: Option<String>,
    },

    OutputFailed { request_id: u64, message: String },

    /// Learned audio/visual offset settled
    SyncOffset { learned_ms: i32 },
}

impl PipelineEvent {
    /// Create an error event from any error type
    pub fn error<E: std::fmt::Display>(err: E) -> Self {
        PipelineEvent::Error {
            message: err.to_string(),
        }
    }
}

/// Why a device list was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshPurpose {
    /// Settings view asked for it
    User,
    /// Passive monitor checking the selected device is still there
    Presence,
    /// Looking for a substitute after device loss
    Rebind,
    /// Resolving the persisted device name at startup
    Restore,
}

/// Results produced off the foreground thread
#[derive(Debug, Clone)]
pub enum WorkResult {
    StreamResolved {
        request_id: u64,
        track: Track,
        result: Result<String, String>,
    },

    Prefetched {
        track_id: String,
        quality: String,
        uri: String,
    },

    DevicesListed {
        request_id: u64,
        driver: Driver,
        purpose: RefreshPurpose,
        result: Result<DeviceList, String>,
    },

    /// PipeWire force-rate negotiation finished
    ClockNegotiated {
        request_id: u64,
        rate: u32,
        honoured: bool,
        clock: ClockSettings,
        /// Outcome of the pro-audio profile switch, when attempted
        pro_audio: Option<Result<String, String>>,
    },

    RuntimeFormat {
        request_id: u64,
        format: Option<RuntimeFormat>,
    },

    /// Listing from the hotplug watchdog; `request_id` is the watch generation
    HotplugProbe {
        request_id: u64,
        driver: Driver,
        list: DeviceList,
    },

    /// Audio cache download finished
    Cached {
        request_id: u64,
        track_id: String,
        result: Result<Option<String>, String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::Tag(StreamFormat::new(96000, 24, "FLAC"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"Tag\""));

        let deserialized: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn test_error_event() {
        let event = PipelineEvent::error("Test error message");
        if let PipelineEvent::Error { message } = event {
            assert_eq!(message, "Test error message");
        } else {
            panic!("Should be Error variant");
        }
    }

    #[test]
    fn test_output_applied_serialization() {
        let event = PipelineEvent::OutputApplied {
            request_id: 3,
            sink: SinkFormat {
                rate: 96000,
                depth: 24,
                channels: 2,
            },
            elements: vec!["source".into(), "sink".into()],
            fallback: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        if let PipelineEvent::OutputApplied { request_id, sink, .. } = back {
            assert_eq!(request_id, 3);
            assert_eq!(sink.rate, 96000);
        } else {
            panic!("Wrong variant");
        }
    }
}
