//! On-disk caches for audio streams and cover art.
//!
//! Audio files are named `{track_id}_{quality}.bin` and kept LRU by
//! modification time, capped by track count. Covers are named by the MD5
//! of their URL and pruned by age, then by total size.
//!
//! Both caches do blocking I/O and must only be used from worker threads.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use directories::ProjectDirs;
use md5::{Digest, Md5};
use tracing::{debug, info, warn};

use crate::config::EnvConfig;
use crate::error::{CoreError, CoreResult};

const AUDIO_EXT: &str = "bin";
const PARTIAL_EXT: &str = "part";

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
}

fn list_entries(dir: &Path, ext: Option<&str>) -> CoreResult<Vec<Entry>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(CoreError::io(dir, e)),
    };
    let mut entries = Vec::new();
    for item in read.flatten() {
        let path = item.path();
        if let Some(ext) = ext {
            if path.extension().and_then(|e| e.to_str()) != Some(ext) {
                continue;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some(PARTIAL_EXT) {
            continue;
        }
        let Ok(meta) = item.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        entries.push(Entry {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: meta.len(),
        });
    }
    Ok(entries)
}

fn touch(path: &Path) {
    let result = File::options()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!("Could not touch {:?}: {}", path, e);
    }
}

/// Download `url` into `dest` through a `.part` file
fn download(url: &str, dest: &Path, timeout: Duration) -> CoreResult<u64> {
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    let mut response = client.get(url).send()?.error_for_status()?;

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".");
    partial.push(PARTIAL_EXT);
    let partial = PathBuf::from(partial);

    let result = (|| -> CoreResult<u64> {
        let mut file = File::create(&partial).map_err(|e| CoreError::io(&partial, e))?;
        let bytes = response.copy_to(&mut file)?;
        file.flush().map_err(|e| CoreError::io(&partial, e))?;
        fs::rename(&partial, dest).map_err(|e| CoreError::io(dest, e))?;
        Ok(bytes)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn cache_root() -> Option<PathBuf> {
    ProjectDirs::from("com", "hiresti", "hiresti").map(|p| p.cache_dir().to_path_buf())
}

/// Local copies of recently played streams
#[derive(Debug, Clone)]
pub struct AudioCache {
    dir: PathBuf,
    max_tracks: usize,
}

impl AudioCache {
    pub fn new(dir: impl Into<PathBuf>, max_tracks: usize) -> Self {
        Self {
            dir: dir.into(),
            max_tracks,
        }
    }

    /// `audio/` under the platform cache directory
    pub fn open_default(max_tracks: usize) -> CoreResult<Self> {
        cache_root()
            .map(|root| Self::new(root.join("audio"), max_tracks))
            .ok_or_else(|| CoreError::Settings {
                path: PathBuf::new(),
                message: "Could not determine cache path".to_string(),
            })
    }

    pub fn is_enabled(&self) -> bool {
        self.max_tracks > 0
    }

    pub fn set_max_tracks(&mut self, max_tracks: usize) {
        self.max_tracks = max_tracks;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `{track_id}_{quality}.bin`, path separators replaced
    pub fn file_name(track_id: &str, quality: &str) -> String {
        let clean = |s: &str| s.replace(['/', '\\'], "_");
        format!("{}_{}.{}", clean(track_id), clean(quality), AUDIO_EXT)
    }

    pub fn path_for(&self, track_id: &str, quality: &str) -> PathBuf {
        self.dir.join(Self::file_name(track_id, quality))
    }

    /// Cached file for the track, touched so it stays young
    pub fn lookup(&self, track_id: &str, quality: &str) -> Option<PathBuf> {
        let path = self.path_for(track_id, quality);
        if path.is_file() {
            touch(&path);
            Some(path)
        } else {
            None
        }
    }

    /// Download the stream unless cached; `None` when caching is off or the
    /// URL is not remote
    pub fn fetch(&self, track_id: &str, quality: &str, url: &str, timeout: Duration) -> CoreResult<Option<PathBuf>> {
        if !self.is_enabled() || !url.starts_with("http") {
            return Ok(None);
        }
        if let Some(hit) = self.lookup(track_id, quality) {
            debug!("Audio cache hit for {}", track_id);
            return Ok(Some(hit));
        }
        fs::create_dir_all(&self.dir).map_err(|e| CoreError::io(&self.dir, e))?;
        let path = self.path_for(track_id, quality);
        let bytes = download(url, &path, timeout)?;
        info!("Cached {} ({} KiB)", track_id, bytes / 1024);
        self.prune()?;
        Ok(Some(path))
    }

    /// Store bytes directly (tests, local imports)
    pub fn insert(&self, track_id: &str, quality: &str, bytes: &[u8]) -> CoreResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| CoreError::io(&self.dir, e))?;
        let path = self.path_for(track_id, quality);
        fs::write(&path, bytes).map_err(|e| CoreError::io(&path, e))?;
        self.prune()?;
        Ok(path)
    }

    /// Drop the oldest files beyond the track cap; returns how many went
    pub fn prune(&self) -> CoreResult<usize> {
        let mut entries = list_entries(&self.dir, Some(AUDIO_EXT))?;
        if entries.len() <= self.max_tracks {
            return Ok(0);
        }
        entries.sort_by(|a, b| b.modified.cmp(&a.modified));
        let mut removed = 0;
        for entry in entries.iter().skip(self.max_tracks) {
            match fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to evict {:?}: {}", entry.path, e),
            }
        }
        debug!("Audio cache pruned {} files", removed);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        list_entries(&self.dir, Some(AUDIO_EXT))
            .map(|e| e.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Outcome of a cover prune
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub expired: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
}

/// Cover art files keyed by URL hash
#[derive(Debug, Clone)]
pub struct CoverCache {
    dir: PathBuf,
    max_bytes: u64,
    max_age: Duration,
}

impl CoverCache {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            max_age,
        }
    }

    /// Limits from `HIRESTI_COVER_CACHE_MAX_*`
    pub fn from_env(dir: impl Into<PathBuf>, env: &EnvConfig) -> Self {
        Self::new(dir, env.cover_cache_max_bytes(), env.cover_cache_max_age())
    }

    pub fn open_default(env: &EnvConfig) -> CoreResult<Self> {
        cache_root()
            .map(|root| Self::from_env(root.join("covers"), env))
            .ok_or_else(|| CoreError::Settings {
                path: PathBuf::new(),
                message: "Could not determine cache path".to_string(),
            })
    }

    pub fn key(url: &str) -> String {
        format!("{:x}", Md5::digest(url.as_bytes()))
    }

    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(Self::key(url))
    }

    pub fn get(&self, url: &str) -> Option<PathBuf> {
        let path = self.path_for(url);
        path.is_file().then_some(path)
    }

    pub fn fetch(&self, url: &str, timeout: Duration) -> CoreResult<PathBuf> {
        if let Some(hit) = self.get(url) {
            return Ok(hit);
        }
        fs::create_dir_all(&self.dir).map_err(|e| CoreError::io(&self.dir, e))?;
        let path = self.path_for(url);
        download(url, &path, timeout)?;
        Ok(path)
    }

    pub fn insert(&self, url: &str, bytes: &[u8]) -> CoreResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| CoreError::io(&self.dir, e))?;
        let path = self.path_for(url);
        fs::write(&path, bytes).map_err(|e| CoreError::io(&path, e))?;
        Ok(path)
    }

    /// Delete files older than the age limit, then the oldest until under
    /// the size limit
    pub fn prune(&self, now: SystemTime) -> CoreResult<PruneReport> {
        let mut report = PruneReport::default();
        let mut live = Vec::new();
        for entry in list_entries(&self.dir, None)? {
            let age = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
            if age > self.max_age {
                if fs::remove_file(&entry.path).is_ok() {
                    report.expired += 1;
                    report.bytes_freed += entry.len;
                }
            } else {
                live.push(entry);
            }
        }

        let mut total: u64 = live.iter().map(|e| e.len).sum();
        if total > self.max_bytes {
            live.sort_by(|a, b| a.modified.cmp(&b.modified));
            for entry in &live {
                if total <= self.max_bytes {
                    break;
                }
                if fs::remove_file(&entry.path).is_ok() {
                    total -= entry.len;
                    report.evicted += 1;
                    report.bytes_freed += entry.len;
                }
            }
        }
        if report != PruneReport::default() {
            info!(
                "Cover cache pruned: {} expired, {} evicted, {} KiB freed",
                report.expired,
                report.evicted,
                report.bytes_freed / 1024
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_age(path: &Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_audio_file_name() {
        assert_eq!(AudioCache::file_name("123", "HI_RES/MAX"), "123_HI_RES_MAX.bin");
        assert_eq!(AudioCache::file_name("a\\b", "LOSSLESS"), "a_b_LOSSLESS.bin");
    }

    #[test]
    fn test_audio_cache_lru() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), 2);
        let a = cache.insert("a", "q", b"aaaa").unwrap();
        set_age(&a, Duration::from_secs(300));
        let b = cache.insert("b", "q", b"bbbb").unwrap();
        set_age(&b, Duration::from_secs(200));

        // Touching `a` makes `b` the oldest
        assert_eq!(cache.lookup("a", "q"), Some(a.clone()));
        cache.insert("c", "q", b"cccc").unwrap();

        assert_eq!(cache.len(), 2);
        assert!(a.exists());
        assert!(!b.exists());
        assert!(cache.lookup("b", "q").is_none());
    }

    #[test]
    fn test_disabled_audio_cache_skips_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = AudioCache::new(dir.path(), 0);
        let fetched = cache
            .fetch("1", "q", "https://invalid.example/1", Duration::from_millis(10))
            .unwrap();
        assert!(fetched.is_none());
        let enabled = AudioCache::new(dir.path(), 5);
        assert!(enabled
            .fetch("1", "q", "/local/file.flac", Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_cover_key_is_md5() {
        assert_eq!(
            CoverCache::key("https://resources.example/cover.jpg").len(),
            32
        );
        assert_eq!(CoverCache::key(""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn test_cover_prune_age_then_size() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CoverCache::new(dir.path(), 250, Duration::from_secs(30 * 86400));
        let old = cache.insert("old", &[0u8; 100]).unwrap();
        set_age(&old, Duration::from_secs(31 * 86400));
        let older = cache.insert("older-live", &[0u8; 100]).unwrap();
        set_age(&older, Duration::from_secs(3600));
        let mid = cache.insert("mid", &[0u8; 100]).unwrap();
        set_age(&mid, Duration::from_secs(60));
        let new = cache.insert("new", &[0u8; 100]).unwrap();

        let report = cache.prune(SystemTime::now()).unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(report.bytes_freed, 200);
        assert!(!old.exists());
        assert!(!older.exists());
        assert!(mid.exists() && new.exists());
        assert_eq!(cache.get("new"), Some(new));
    }
}
