//! Bit-Perfect Verdict and Signal-Path Diagnostics
//!
//! The verdict answers "is the DAC receiving the source bit-for-bit?" and,
//! when it is not, lists every failing condition. Two paths can pass:
//!
//! | Driver   | Requires                                              |
//! |----------|-------------------------------------------------------|
//! | ALSA     | bit-perfect, exclusive, Active, sink == source format |
//! | PipeWire | bit-perfect, Active, session clock == source format   |

use serde::{Deserialize, Serialize};

use hiresti_platform::Driver;

use crate::host::Health;
use crate::model::{OutputState, SinkFormat, StreamFormat};

/// Most suggestions shown at once
const MAX_SUGGESTIONS: usize = 3;

/// Events listed under "Recent Events"
const DIAG_RECENT_EVENTS: usize = 8;

/// Everything the verdict looks at
#[derive(Debug, Clone)]
pub struct VerdictInput<'a> {
    pub bit_perfect: bool,
    pub exclusive: bool,
    pub driver: Driver,
    pub device_name: &'a str,
    pub state: &'a OutputState,
    pub source: &'a StreamFormat,
    /// Format the sink (or the session graph) runs at
    pub sink: Option<SinkFormat>,
    pub last_error: Option<&'a str>,
}

impl VerdictInput<'_> {
    /// `None` until both sides are known
    pub fn format_match(&self) -> Option<bool> {
        match self.sink {
            Some(sink) if self.source.is_known() && sink.rate > 0 => Some(sink.matches(self.source)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitPerfectVerdict {
    pub yes: bool,
    pub reasons: Vec<String>,
}

impl BitPerfectVerdict {
    pub fn evaluate(input: &VerdictInput<'_>) -> Self {
        let mut reasons = Vec::new();
        if !input.bit_perfect {
            reasons.push("Bit-Perfect mode disabled".to_string());
        }
        match input.driver {
            Driver::Alsa => {
                if !input.exclusive {
                    reasons.push("Not in exclusive mode".to_string());
                }
            }
            // The session graph can carry the source untouched without exclusivity
            Driver::PipeWire => {}
            other => {
                reasons.push(format!("Driver is {}", other));
                if !input.exclusive {
                    reasons.push("Not in exclusive mode".to_string());
                }
            }
        }
        if *input.state != OutputState::Active {
            reasons.push(format!("Output state is {}", input.state.as_str()));
            if let Some(reason) = input.state.reason() {
                reasons.push(reason.to_string());
            }
        }
        match input.format_match() {
            Some(true) => {}
            Some(false) => reasons.push("Rate/depth mismatch".to_string()),
            None => reasons.push("Format not detected yet".to_string()),
        }
        Self {
            yes: reasons.is_empty(),
            reasons,
        }
    }

    pub fn label(&self) -> &'static str {
        if self.yes {
            "Yes"
        } else {
            "No"
        }
    }
}

/// Up to three actions that move the verdict towards Yes
pub fn fix_suggestions(input: &VerdictInput<'_>, verdict: &BitPerfectVerdict) -> Vec<&'static str> {
    if verdict.yes {
        return Vec::new();
    }
    let mut out = Vec::new();
    if input.driver != Driver::Alsa {
        out.push("Switch driver to ALSA");
    }
    if !input.bit_perfect {
        out.push("Enable Bit-Perfect mode");
    }
    if !input.exclusive {
        out.push("Enable Exclusive mode");
    }
    if input.state.is_recoverable() {
        out.push("Click Recover in Settings");
    }
    if input.format_match().is_none() {
        out.push("Play a track for a few seconds to detect format");
    }
    out.truncate(MAX_SUGGESTIONS);
    out
}

fn on_off(v: bool) -> &'static str {
    if v {
        "On"
    } else {
        "Off"
    }
}

/// Lines for the signal-path diagnostics view
pub fn diagnostics_lines(input: &VerdictInput<'_>, recent_events: &[String]) -> Vec<String> {
    let verdict = BitPerfectVerdict::evaluate(input);
    let format_match = match input.format_match() {
        Some(true) => "Yes",
        Some(false) => "No",
        None => "Unknown",
    };
    let codec = if input.source.codec.is_empty() {
        "-"
    } else {
        input.source.codec.as_str()
    };
    let bitrate = match input.source.bitrate_kbps() {
        0 => "-".to_string(),
        kbps => format!("{} kbps", kbps),
    };
    let sink = input
        .sink
        .map(|s| {
            StreamFormat {
                rate: s.rate,
                depth: s.depth,
                ..Default::default()
            }
            .describe()
        })
        .unwrap_or_else(|| "-".to_string());

    let mut lines = vec![
        format!("Bit-Perfect Verdict: {}", verdict.label()),
        format!("Format Match: {}", format_match),
        format!("Bit-Perfect Mode: {}", on_off(input.bit_perfect)),
        format!("Exclusive Mode: {}", on_off(input.exclusive)),
        format!("Driver: {}", input.driver),
        format!("Device: {}", input.device_name),
        format!("Output State: {}", input.state),
        format!("Source Codec: {}", codec),
        format!("Source Format: {}", input.source.describe()),
        format!("Source Bitrate: {}", bitrate),
        format!("Output Format: {}", sink),
    ];
    if !verdict.reasons.is_empty() {
        lines.push(format!("Reasons: {}", verdict.reasons.join(" | ")));
    }
    let fixes = fix_suggestions(input, &verdict);
    if !fixes.is_empty() {
        lines.push(format!("How to Fix: {}", fixes.join(" | ")));
    }
    if let Some(err) = input.last_error.filter(|e| !e.is_empty()) {
        lines.push(format!("Last Error: {}", err));
    }
    lines.push("Recent Events:".to_string());
    let skip = recent_events.len().saturating_sub(DIAG_RECENT_EVENTS);
    if recent_events.is_empty() {
        lines.push("- none".to_string());
    }
    lines.extend(recent_events.iter().skip(skip).map(|ev| format!("- {}", ev)));
    lines
}

/// Health badge for the output area
pub fn output_health(state: &OutputState) -> (Health, Option<&str>) {
    match state {
        OutputState::Active => (Health::Ok, None),
        OutputState::Switching => (Health::Warn, Some("switching")),
        OutputState::Fallback(reason) => (Health::Warn, Some(reason)),
        OutputState::Error(reason) => (Health::Error, Some(reason)),
        OutputState::Idle => (Health::Idle, None),
    }
}
