//! Persistent Settings Management
//!
//! Settings are stored as pretty JSON. Loading is lenient per key: a value
//! of the wrong type or out of range reverts that key to its default and
//! leaves the others alone. Keys the core does not know (owned by the
//! front-end) are carried through untouched.
//!
//! # Storage Locations
//! - Linux: `~/.config/hiresti/settings.json`
//!
//! Writes are coalesced by [`SettingsHandle::schedule_save`] and performed on
//! the `hiresti-settings` thread.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{after, bounded, never, select, Sender};
use directories::ProjectDirs;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use hiresti_dsp::{
    is_allowed_bar_count, sanitize_sync_offset, SpectrumProfile, DEFAULT_BAR_COUNT, EQ_MAX_DB,
    EQ_MIN_DB, MAX_SYNC_OFFSET_MS, NUM_EQ_BANDS,
};
use hiresti_platform::{Driver, DEFAULT_OUTPUT_NAME};

use crate::config::LatencyProfile;
use crate::error::{CoreError, CoreResult};
use crate::model::PlayMode;

pub const CURRENT_SETTINGS_VERSION: u32 = 1;

/// Per-device offsets kept at most
pub const MAX_DEVICE_OFFSETS: usize = 64;

/// Shortest delay between a change and its write
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(250);

const MAX_VOLUME: i64 = 100;
const MAX_AUDIO_CACHE_TRACKS: i64 = 200;

/// Root settings structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub settings_version: u32,
    /// Driver wire string (`ALSA`, `PipeWire`, ...)
    pub driver: String,
    /// Device name, not id
    pub device: String,
    pub bit_perfect: bool,
    /// Only meaningful with `bit_perfect`
    pub exclusive_lock: bool,
    pub latency_profile: String,
    pub volume: u8,
    pub play_mode: u8,
    pub viz_bar_count: u32,
    pub viz_profile: u8,
    pub viz_sync_offset_ms: i32,
    /// Keyed by `"{driver}|{device_id_or_name}"`
    pub viz_sync_device_offsets: BTreeMap<String, i32>,
    pub output_auto_rebind_once: bool,
    pub audio_cache_tracks: u32,
    pub eq_gains: [f32; NUM_EQ_BANDS],
    /// Front-end keys, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            settings_version: CURRENT_SETTINGS_VERSION,
            driver: Driver::Auto.as_str().to_string(),
            device: DEFAULT_OUTPUT_NAME.to_string(),
            bit_perfect: false,
            exclusive_lock: false,
            latency_profile: LatencyProfile::default().as_str().to_string(),
            volume: 80,
            play_mode: PlayMode::default().index(),
            viz_bar_count: DEFAULT_BAR_COUNT as u32,
            viz_profile: SpectrumProfile::default().index() as u8,
            viz_sync_offset_ms: 0,
            viz_sync_device_offsets: BTreeMap::new(),
            output_auto_rebind_once: false,
            audio_cache_tracks: 20,
            eq_gains: [0.0; NUM_EQ_BANDS],
            extra: Map::new(),
        }
    }
}

fn as_bool(raw: &Map<String, Value>, key: &str, default: bool) -> bool {
    raw.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn as_str(raw: &Map<String, Value>, key: &str, default: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default)
        .to_string()
}

fn as_int(raw: &Map<String, Value>, key: &str, default: i64, min: i64, max: i64) -> i64 {
    raw.get(key)
        .and_then(Value::as_i64)
        .filter(|v| (min..=max).contains(v))
        .unwrap_or(default)
}

const KNOWN_KEYS: [&str; 15] = [
    "settings_version",
    "driver",
    "device",
    "bit_perfect",
    "exclusive_lock",
    "latency_profile",
    "volume",
    "play_mode",
    "viz_bar_count",
    "viz_profile",
    "viz_sync_offset_ms",
    "viz_sync_device_offsets",
    "output_auto_rebind_once",
    "audio_cache_tracks",
    "eq_gains",
];

impl Settings {
    /// Build from arbitrary JSON, reverting bad keys to defaults
    pub fn from_value(raw: &Value) -> Self {
        let Some(raw) = raw.as_object() else {
            return Self::default();
        };
        let d = Self::default();

        let mut offsets = BTreeMap::new();
        if let Some(map) = raw.get("viz_sync_device_offsets").and_then(Value::as_object) {
            for (key, value) in map {
                if offsets.len() >= MAX_DEVICE_OFFSETS {
                    break;
                }
                let Some(v) = value.as_i64() else { continue };
                if key.is_empty() || v.abs() > i64::from(MAX_SYNC_OFFSET_MS) {
                    continue;
                }
                offsets.insert(key.clone(), v as i32);
            }
        }

        let mut eq_gains = d.eq_gains;
        if let Some(values) = raw.get("eq_gains").and_then(Value::as_array) {
            for (slot, value) in eq_gains.iter_mut().zip(values) {
                if let Some(g) = value.as_f64() {
                    *slot = g as f32;
                }
            }
        }

        let extra = raw
            .iter()
            .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut settings = Self {
            settings_version: CURRENT_SETTINGS_VERSION,
            driver: as_str(raw, "driver", &d.driver),
            device: as_str(raw, "device", &d.device),
            bit_perfect: as_bool(raw, "bit_perfect", d.bit_perfect),
            exclusive_lock: as_bool(raw, "exclusive_lock", d.exclusive_lock),
            latency_profile: as_str(raw, "latency_profile", &d.latency_profile),
            volume: as_int(raw, "volume", i64::from(d.volume), 0, MAX_VOLUME) as u8,
            play_mode: as_int(raw, "play_mode", i64::from(d.play_mode), 0, 3) as u8,
            viz_bar_count: as_int(raw, "viz_bar_count", i64::from(d.viz_bar_count), 4, 128) as u32,
            viz_profile: as_int(raw, "viz_profile", i64::from(d.viz_profile), 0, 3) as u8,
            viz_sync_offset_ms: raw
                .get("viz_sync_offset_ms")
                .and_then(Value::as_i64)
                .map(sanitize_sync_offset)
                .unwrap_or(0),
            viz_sync_device_offsets: offsets,
            output_auto_rebind_once: as_bool(raw, "output_auto_rebind_once", d.output_auto_rebind_once),
            audio_cache_tracks: as_int(
                raw,
                "audio_cache_tracks",
                i64::from(d.audio_cache_tracks),
                0,
                MAX_AUDIO_CACHE_TRACKS,
            ) as u32,
            eq_gains,
            extra,
        };
        settings.normalize();
        settings
    }

    /// Re-apply validation rules after in-memory edits
    pub fn normalize(&mut self) {
        let d = Self::default();
        self.settings_version = CURRENT_SETTINGS_VERSION;
        if self.driver.parse::<Driver>().is_err() {
            self.driver = d.driver;
        }
        if self.device.trim().is_empty() {
            self.device = d.device;
        }
        if self.latency_profile.parse::<LatencyProfile>().is_err() {
            self.latency_profile = d.latency_profile;
        }
        if i64::from(self.volume) > MAX_VOLUME {
            self.volume = d.volume;
        }
        if PlayMode::from_index(i64::from(self.play_mode)).is_none() {
            self.play_mode = d.play_mode;
        }
        if !is_allowed_bar_count(self.viz_bar_count as usize) {
            self.viz_bar_count = d.viz_bar_count;
        }
        if usize::from(self.viz_profile) >= SpectrumProfile::ALL.len() {
            self.viz_profile = d.viz_profile;
        }
        self.viz_sync_offset_ms = sanitize_sync_offset(i64::from(self.viz_sync_offset_ms));
        self.viz_sync_device_offsets
            .retain(|k, v| !k.is_empty() && v.abs() <= MAX_SYNC_OFFSET_MS);
        while self.viz_sync_device_offsets.len() > MAX_DEVICE_OFFSETS {
            self.viz_sync_device_offsets.pop_last();
        }
        if i64::from(self.audio_cache_tracks) > MAX_AUDIO_CACHE_TRACKS {
            self.audio_cache_tracks = d.audio_cache_tracks;
        }
        for gain in &mut self.eq_gains {
            *gain = if gain.is_finite() { gain.clamp(EQ_MIN_DB, EQ_MAX_DB) } else { 0.0 };
        }
        if !self.bit_perfect {
            self.exclusive_lock = false;
        }
    }

    pub fn driver(&self) -> Driver {
        self.driver.parse().unwrap_or_default()
    }

    pub fn latency(&self) -> LatencyProfile {
        self.latency_profile.parse().unwrap_or_default()
    }

    pub fn play_mode(&self) -> PlayMode {
        PlayMode::from_index(i64::from(self.play_mode)).unwrap_or_default()
    }

    pub fn viz_profile(&self) -> SpectrumProfile {
        SpectrumProfile::from_index(i64::from(self.viz_profile))
    }

    /// Learned offset for one output, when one was stored
    pub fn device_offset(&self, key: &str) -> Option<i32> {
        self.viz_sync_device_offsets.get(key).copied()
    }

    pub fn set_device_offset(&mut self, key: &str, offset_ms: i32) {
        let offset = sanitize_sync_offset(i64::from(offset_ms));
        if !self.viz_sync_device_offsets.contains_key(key)
            && self.viz_sync_device_offsets.len() >= MAX_DEVICE_OFFSETS
        {
            warn!("Per-device offset table full; not storing {}", key);
            return;
        }
        self.viz_sync_device_offsets.insert(key.to_string(), offset);
    }
}

/// Where settings live
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> CoreResult<Settings>;

    fn save(&self, settings: &Settings) -> CoreResult<()>;
}

/// JSON file store with atomic replace
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `settings.json` in the platform config directory
    pub fn open_default() -> CoreResult<Self> {
        Self::default_path()
            .map(Self::new)
            .ok_or_else(|| CoreError::Settings {
                path: PathBuf::new(),
                message: "Could not determine config path".to_string(),
            })
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "hiresti", "hiresti")
            .map(|proj| proj.config_dir().join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self) -> CoreResult<Settings> {
        if !self.path.exists() {
            info!("No settings at {:?}; using defaults", self.path);
            return Ok(Settings::default());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| CoreError::io(&self.path, e))?;
        match serde_json::from_str::<Value>(&text) {
            Ok(raw) => {
                info!("Settings loaded from {:?}", self.path);
                Ok(Settings::from_value(&raw))
            }
            Err(e) => {
                error!("Failed to parse settings file: {}", e);
                Ok(Settings::default())
            }
        }
    }

    fn save(&self, settings: &Settings) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
        }
        let mut normalized = settings.clone();
        normalized.normalize();
        let json = serde_json::to_string_pretty(&normalized).map_err(|e| CoreError::Settings {
            path: self.path.clone(),
            message: e.to_string(),
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(|e| CoreError::io(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| CoreError::io(&self.path, e))?;
        debug!("Settings saved to {:?}", self.path);
        Ok(())
    }
}

/// In-memory store for tests and simulation
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    saved: Mutex<Option<Settings>>,
    saves: Mutex<usize>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            saved: Mutex::new(Some(settings)),
            saves: Mutex::new(0),
        }
    }

    pub fn saved(&self) -> Option<Settings> {
        self.saved.lock().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> CoreResult<Settings> {
        Ok(self.saved.lock().clone().unwrap_or_default())
    }

    fn save(&self, settings: &Settings) -> CoreResult<()> {
        *self.saved.lock() = Some(settings.clone());
        *self.saves.lock() += 1;
        Ok(())
    }
}

enum SaveMsg {
    Schedule,
    Flush(Sender<CoreResult<()>>),
    Shutdown,
}

/// Snapshot reads and coalesced writes
pub struct SettingsHandle {
    current: Arc<RwLock<Settings>>,
    saver: Sender<SaveMsg>,
    thread: Option<JoinHandle<()>>,
}

impl SettingsHandle {
    /// Load from `store` and start the saver thread
    pub fn open(store: Arc<dyn SettingsStore>) -> CoreResult<Self> {
        let settings = store.load()?;
        Self::with_debounce(store, settings, SAVE_DEBOUNCE)
    }

    pub fn with_debounce(store: Arc<dyn SettingsStore>, settings: Settings, debounce: Duration) -> CoreResult<Self> {
        let debounce = debounce.max(SAVE_DEBOUNCE);
        let current = Arc::new(RwLock::new(settings));
        let (saver, rx) = bounded::<SaveMsg>(64);
        let shared = Arc::clone(&current);

        let name = "hiresti-settings".to_string();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let mut deadline: Option<Instant> = None;
                let write = |shared: &RwLock<Settings>| {
                    let snapshot = shared.read().clone();
                    let result = store.save(&snapshot);
                    if let Err(e) = &result {
                        error!("Failed to save settings: {}", e);
                    }
                    result
                };
                loop {
                    let wait = deadline
                        .map(|d| after(d.saturating_duration_since(Instant::now())))
                        .unwrap_or_else(never);
                    select! {
                        recv(rx) -> msg => match msg {
                            Ok(SaveMsg::Schedule) => {
                                deadline.get_or_insert_with(|| Instant::now() + debounce);
                            }
                            Ok(SaveMsg::Flush(reply)) => {
                                deadline = None;
                                let _ = reply.send(write(&shared));
                            }
                            Ok(SaveMsg::Shutdown) | Err(_) => {
                                if deadline.take().is_some() {
                                    let _ = write(&shared);
                                }
                                break;
                            }
                        },
                        recv(wait) -> _ => {
                            deadline = None;
                            let _ = write(&shared);
                        }
                    }
                }
            })
            .map_err(|e| CoreError::Spawn {
                name,
                message: e.to_string(),
            })?;

        Ok(Self {
            current,
            saver,
            thread: Some(thread),
        })
    }

    pub fn snapshot(&self) -> Settings {
        self.current.read().clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Settings) -> R) -> R {
        f(&self.current.read())
    }

    /// Edit, normalize and schedule a save
    pub fn update(&self, f: impl FnOnce(&mut Settings)) {
        {
            let mut settings = self.current.write();
            f(&mut settings);
            settings.normalize();
        }
        self.schedule_save();
    }

    /// Coalesce writes; the file is written at most once per debounce window
    pub fn schedule_save(&self) {
        if self.saver.try_send(SaveMsg::Schedule).is_err() {
            debug!("Save already pending");
        }
    }

    /// Write now and wait for the result
    pub fn flush(&self) -> CoreResult<()> {
        let (tx, rx) = bounded(1);
        self.saver
            .send(SaveMsg::Flush(tx))
            .map_err(|_| CoreError::ChannelSend)?;
        rx.recv().map_err(|_| CoreError::ShutDown)?
    }
}

impl Drop for SettingsHandle {
    fn drop(&mut self) {
        let _ = self.saver.send(SaveMsg::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.driver, "Auto (Default)");
        assert_eq!(settings.device, "Default Output");
        assert_eq!(settings.latency_profile, "Standard (100ms)");
        assert_eq!(settings.volume, 80);
        assert_eq!(settings.viz_bar_count, 32);
        assert_eq!(settings.audio_cache_tracks, 20);
        assert_eq!(settings.settings_version, 1);
        assert_eq!(settings.driver(), Driver::Auto);
    }

    #[test]
    fn test_lenient_per_key() {
        let raw = json!({
            "driver": "ALSA",
            "device": "",
            "volume": "loud",
            "play_mode": 9,
            "viz_bar_count": 100,
            "viz_sync_offset_ms": 350,
            "latency_profile": "Turbo",
            "audio_cache_tracks": 50,
            "last_nav": "home"
        });
        let settings = Settings::from_value(&raw);
        assert_eq!(settings.driver(), Driver::Alsa);
        assert_eq!(settings.device, "Default Output");
        assert_eq!(settings.volume, 80);
        assert_eq!(settings.play_mode, 0);
        assert_eq!(settings.viz_bar_count, 32);
        assert_eq!(settings.viz_sync_offset_ms, 0);
        assert_eq!(settings.latency(), LatencyProfile::Standard);
        assert_eq!(settings.audio_cache_tracks, 50);
        assert_eq!(settings.extra.get("last_nav"), Some(&json!("home")));

        assert_eq!(Settings::from_value(&json!([1, 2])), Settings::default());
    }

    #[test]
    fn test_exclusive_requires_bit_perfect() {
        let settings = Settings::from_value(&json!({"bit_perfect": false, "exclusive_lock": true}));
        assert!(!settings.exclusive_lock);
        let settings = Settings::from_value(&json!({"bit_perfect": true, "exclusive_lock": true}));
        assert!(settings.exclusive_lock);
    }

    #[test]
    fn test_device_offsets() {
        let mut offsets = Map::new();
        for i in 0..80 {
            offsets.insert(format!("ALSA|hw:{},0", i), json!(i));
        }
        offsets.insert("PipeWire|bad".into(), json!(999));
        let settings = Settings::from_value(&json!({ "viz_sync_device_offsets": offsets }));
        assert_eq!(settings.viz_sync_device_offsets.len(), MAX_DEVICE_OFFSETS);
        assert!(settings.device_offset("PipeWire|bad").is_none());

        let mut settings = Settings::default();
        settings.set_device_offset("ALSA|hw:1,0", 40);
        settings.set_device_offset("ALSA|hw:2,0", 900);
        assert_eq!(settings.device_offset("ALSA|hw:1,0"), Some(40));
        assert_eq!(settings.device_offset("ALSA|hw:2,0"), Some(0));
    }

    #[test]
    fn test_json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("nested").join("settings.json"));
        assert_eq!(store.load().unwrap(), Settings::default());

        let mut settings = Settings::default();
        settings.bit_perfect = true;
        settings.exclusive_lock = true;
        settings.viz_sync_offset_ms = 40;
        settings.extra.insert("search_history".into(), json!(["a"]));
        store.save(&settings).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        let store = JsonSettingsStore::new(&path);
        assert_eq!(store.load().unwrap(), Settings::default());
    }

    #[test]
    fn test_schedule_save_coalesces() {
        let store = Arc::new(MemorySettingsStore::new());
        let handle = SettingsHandle::with_debounce(store.clone(), Settings::default(), SAVE_DEBOUNCE).unwrap();
        for v in 0..5 {
            handle.update(|s| s.volume = 10 + v);
        }
        assert_eq!(store.save_count(), 0);
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.saved().unwrap().volume, 14);

        handle.update(|s| s.viz_sync_offset_ms = 500);
        handle.flush().unwrap();
        assert_eq!(store.saved().unwrap().viz_sync_offset_ms, 0);
    }

    #[test]
    fn test_pending_save_written_on_drop() {
        let store = Arc::new(MemorySettingsStore::new());
        {
            let handle = SettingsHandle::open(store.clone()).unwrap();
            handle.update(|s| s.output_auto_rebind_once = true);
        }
        assert!(store.saved().unwrap().output_auto_rebind_once);
    }
}
