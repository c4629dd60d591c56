//! Track Sources
//!
//! The music-service layer is external; the core only needs it to turn a
//! [`Track`] into a stream URI. Resolution blocks (HTTP), so it always runs
//! on a worker with a timeout.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::model::Track;

/// Resolves playable URIs for tracks
pub trait TrackSource: Send + Sync {
    /// Resolve the stream URI; must give up after `timeout`
    fn stream_uri(&self, track: &Track, timeout: Duration) -> CoreResult<String>;

    /// Quality tag of the streams this source hands out (`LOSSLESS`, `HI_RES/MAX`, ...)
    fn quality_key(&self) -> String;
}

/// Source backed by a fixed id → URI table; unknown ids resolve to the id itself
/// when it looks like a path or URI
#[derive(Default)]
pub struct StaticSource {
    uris: RwLock<HashMap<String, String>>,
    quality: String,
}

impl StaticSource {
    pub fn new(quality: impl Into<String>) -> Self {
        Self {
            uris: RwLock::new(HashMap::new()),
            quality: quality.into(),
        }
    }

    pub fn insert(&self, track_id: impl Into<String>, uri: impl Into<String>) {
        self.uris.write().insert(track_id.into(), uri.into());
    }
}

impl TrackSource for StaticSource {
    fn stream_uri(&self, track: &Track, _timeout: Duration) -> CoreResult<String> {
        if let Some(uri) = self.uris.read().get(&track.id) {
            return Ok(uri.clone());
        }
        if track.id.contains('/') || track.id.contains("://") {
            return Ok(track.id.clone());
        }
        Err(CoreError::Resolve(format!("no stream for track {} (404 not found)", track.id)))
    }

    fn quality_key(&self) -> String {
        self.quality.clone()
    }
}

/// Most prefetched URIs kept
pub const PREFETCH_CAPACITY: usize = 6;

/// Stream URLs are signed and expire; prefetches older than this are dropped
const PREFETCH_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct PrefetchEntry {
    key: (String, String),
    uri: String,
    stored: Instant,
}

/// Next-track URI prefetch, keyed by track id and quality
#[derive(Debug)]
pub struct PrefetchCache {
    entries: VecDeque<PrefetchEntry>,
    capacity: usize,
    ttl: Duration,
}

impl Default for PrefetchCache {
    fn default() -> Self {
        Self::new(PREFETCH_CAPACITY, PREFETCH_TTL)
    }
}

impl PrefetchCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn insert(&mut self, track_id: &str, quality: &str, uri: String) {
        let key = (track_id.to_string(), quality.to_string());
        self.entries.retain(|e| e.key != key);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(PrefetchEntry {
            key,
            uri,
            stored: Instant::now(),
        });
    }

    /// Remove and return a fresh entry
    pub fn take(&mut self, track_id: &str, quality: &str) -> Option<String> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.key.0 == track_id && e.key.1 == quality)?;
        let entry = self.entries.remove(idx)?;
        (entry.stored.elapsed() <= self.ttl).then_some(entry.uri)
    }

    pub fn contains(&self, track_id: &str, quality: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.key.0 == track_id && e.key.1 == quality)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
