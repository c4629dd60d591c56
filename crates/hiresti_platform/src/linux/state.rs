//! PipeWire Graph Snapshot
//!
//! Node state as reported by one `pw-dump` run. Only the fields the output
//! engine needs are kept: sink identity for enumeration and the negotiated
//! `Format` param for runtime format reporting.

use std::collections::HashMap;

use serde_json::Value;

use crate::device::depth_from_format_name;
use crate::error::{PlatformError, PlatformResult};

const NODE_TYPE: &str = "PipeWire:Interface:Node";

/// Negotiated format of a node (`params.Format[0]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwFormat {
    pub rate: u32,
    pub depth: Option<u16>,
    pub channels: u32,
}

/// Information about a PipeWire node
#[derive(Debug, Clone)]
pub struct PwNodeInfo {
    /// Unique node identifier assigned by PipeWire
    pub id: u32,

    /// `node.name`, used as the device id (`target.object`)
    pub name: String,

    /// `node.description`, falling back to `device.description`
    pub description: Option<String>,

    /// `node.nick`
    pub nick: Option<String>,

    /// Media class (e.g., "Audio/Sink", "Stream/Output/Audio")
    pub media_class: Option<String>,

    /// Node state ("running", "idle", "suspended")
    pub state: Option<String>,

    pub format: Option<PwFormat>,
}

impl PwNodeInfo {
    pub fn is_audio_sink(&self) -> bool {
        self.media_class
            .as_deref()
            .map(|c| c.starts_with("Audio/Sink"))
            .unwrap_or(false)
    }

    pub fn is_monitor(&self) -> bool {
        self.name.contains(".monitor")
    }

    pub fn is_running(&self) -> bool {
        self.state.as_deref() == Some("running")
    }

    /// Label shown to the user: description, then nick, then node name
    pub fn display_name(&self) -> &str {
        self.description
            .as_deref()
            .or(self.nick.as_deref())
            .unwrap_or(&self.name)
    }
}

/// Snapshot of the PipeWire graph nodes
#[derive(Debug, Clone, Default)]
pub struct PipeWireState {
    /// All discovered nodes indexed by ID
    pub nodes: HashMap<u32, PwNodeInfo>,
}

impl PipeWireState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON array printed by `pw-dump`
    pub fn from_pw_dump(json: &str) -> PlatformResult<Self> {
        let root: Value = serde_json::from_str(json)
            .map_err(|e| PlatformError::parse("pw-dump output", e.to_string()))?;
        let objects = root
            .as_array()
            .ok_or_else(|| PlatformError::parse("pw-dump output", "expected a JSON array"))?;

        let mut state = Self::new();
        for obj in objects {
            if obj.get("type").and_then(Value::as_str) != Some(NODE_TYPE) {
                continue;
            }
            if let Some(node) = parse_node(obj) {
                state.nodes.insert(node.id, node);
            }
        }
        Ok(state)
    }

    /// Audio sinks excluding monitors, in node id order
    pub fn sinks(&self) -> Vec<&PwNodeInfo> {
        let mut sinks: Vec<_> = self
            .nodes
            .values()
            .filter(|n| n.is_audio_sink() && !n.is_monitor() && !n.name.is_empty())
            .collect();
        sinks.sort_by_key(|n| n.id);
        sinks
    }

    pub fn node_by_name(&self, name: &str) -> Option<&PwNodeInfo> {
        self.nodes.values().find(|n| n.name == name)
    }
}

fn prop_string(props: &Value, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_node(obj: &Value) -> Option<PwNodeInfo> {
    let id = u32::try_from(obj.get("id")?.as_u64()?).ok()?;
    let info = obj.get("info")?;
    let props = info.get("props").cloned().unwrap_or(Value::Null);

    let format = info
        .get("params")
        .and_then(|p| p.get("Format"))
        .and_then(Value::as_array)
        .and_then(|formats| formats.first())
        .and_then(parse_format);

    Some(PwNodeInfo {
        id,
        name: prop_string(&props, "node.name").unwrap_or_default(),
        description: prop_string(&props, "node.description")
            .or_else(|| prop_string(&props, "device.description")),
        nick: prop_string(&props, "node.nick"),
        media_class: prop_string(&props, "media.class"),
        state: info.get("state").and_then(Value::as_str).map(str::to_string),
        format,
    })
}

fn parse_format(fmt: &Value) -> Option<PwFormat> {
    let rate = u32::try_from(fmt.get("rate")?.as_u64()?).ok()?;
    if rate == 0 {
        return None;
    }
    Some(PwFormat {
        rate,
        depth: fmt
            .get("format")
            .and_then(Value::as_str)
            .and_then(depth_from_format_name),
        channels: fmt
            .get("channels")
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(2),
    })
}
