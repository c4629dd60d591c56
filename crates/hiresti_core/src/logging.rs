//! Logging setup from `HIRESTI_LOG_*` environment variables
//!
//! | Variable                    | Meaning                               | Default |
//! |-----------------------------|---------------------------------------|---------|
//! | `HIRESTI_LOG_LEVEL`         | global level                          | INFO    |
//! | `HIRESTI_LOG_MODULE_LEVELS` | `target=LEVEL,target2=LEVEL`          | -       |
//! | `HIRESTI_LOG_FILE`          | write to this file instead of stderr  | -       |
//! | `HIRESTI_LOG_ROTATE_BYTES`  | rotate the file at startup above this | 5 MiB   |
//! | `HIRESTI_LOG_BACKUP_COUNT`  | numbered backups kept                 | 3       |

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_ROTATE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_BACKUP_COUNT: usize = 3;

/// Parse a level name; `WARNING` and `CRITICAL` map onto tracing's levels
pub fn parse_level(name: &str) -> Option<Level> {
    match name.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some(Level::TRACE),
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" | "CRITICAL" => Some(Level::ERROR),
        _ => None,
    }
}

/// Parse `target=LEVEL,...`; malformed items are skipped
pub fn parse_module_levels(spec: &str) -> Vec<(String, Level)> {
    spec.split(',')
        .filter_map(|item| {
            let (target, level) = item.split_once('=')?;
            let target = target.trim();
            if target.is_empty() || target.contains(char::is_whitespace) {
                return None;
            }
            Some((target.to_string(), parse_level(level)?))
        })
        .collect()
}

fn directive_level(level: Level) -> &'static str {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub module_levels: Vec<(String, Level)>,
    pub file: Option<PathBuf>,
    pub rotate_bytes: u64,
    pub backup_count: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            module_levels: Vec::new(),
            file: None,
            rotate_bytes: DEFAULT_ROTATE_BYTES,
            backup_count: DEFAULT_BACKUP_COUNT,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            level: lookup("HIRESTI_LOG_LEVEL")
                .and_then(|v| parse_level(&v))
                .unwrap_or(defaults.level),
            module_levels: lookup("HIRESTI_LOG_MODULE_LEVELS")
                .map(|v| parse_module_levels(&v))
                .unwrap_or_default(),
            file: lookup("HIRESTI_LOG_FILE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            rotate_bytes: lookup("HIRESTI_LOG_ROTATE_BYTES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.rotate_bytes),
            backup_count: lookup("HIRESTI_LOG_BACKUP_COUNT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.backup_count),
        }
    }

    /// `EnvFilter` directive string, global level first
    pub fn directives(&self) -> String {
        let mut parts = vec![directive_level(self.level).to_string()];
        parts.extend(
            self.module_levels
                .iter()
                .map(|(target, level)| format!("{}={}", target, directive_level(*level))),
        );
        parts.join(",")
    }

    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(self.directives()).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn backup_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

/// Shift `file` → `file.1` → `file.2` ... when it exceeds `max_bytes`
///
/// Returns true when a rotation happened. With zero backups the file is
/// simply removed.
pub fn rotate_log(path: &Path, max_bytes: u64, backups: usize) -> CoreResult<bool> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CoreError::io(path, e)),
    };
    if max_bytes == 0 || len <= max_bytes {
        return Ok(false);
    }
    if backups == 0 {
        fs::remove_file(path).map_err(|e| CoreError::io(path, e))?;
        return Ok(true);
    }
    for index in (1..backups).rev() {
        let from = backup_path(path, index);
        if from.exists() {
            let to = backup_path(path, index + 1);
            fs::rename(&from, &to).map_err(|e| CoreError::io(&to, e))?;
        }
    }
    let first = backup_path(path, 1);
    fs::rename(path, &first).map_err(|e| CoreError::io(&first, e))?;
    Ok(true)
}

/// Install the global subscriber from the environment
///
/// Safe to call more than once; later calls keep the first subscriber.
pub fn init_logging() -> CoreResult<()> {
    init_with(&LogConfig::from_env())
}

pub fn init_with(config: &LogConfig) -> CoreResult<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_target(true)
        .with_thread_names(true);

    match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| CoreError::io(parent, e))?;
            }
            rotate_log(path, config.rotate_bytes, config.backup_count)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| CoreError::io(path, e))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        None => {
            let _ = builder.try_init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("WARNING"), Some(Level::WARN));
        assert_eq!(parse_level(" Critical "), Some(Level::ERROR));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn test_module_levels_skip_malformed() {
        let parsed = parse_module_levels("hiresti_core::watchdog=DEBUG,broken,=INFO,x=LOUD,hiresti_dsp=warning");
        assert_eq!(
            parsed,
            vec![
                ("hiresti_core::watchdog".to_string(), Level::DEBUG),
                ("hiresti_dsp".to_string(), Level::WARN),
            ]
        );
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("HIRESTI_LOG_LEVEL", "error"),
            ("HIRESTI_LOG_MODULE_LEVELS", "hiresti_core=DEBUG"),
            ("HIRESTI_LOG_FILE", "  "),
            ("HIRESTI_LOG_BACKUP_COUNT", "5"),
        ]
        .into_iter()
        .collect();
        let config = LogConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.level, Level::ERROR);
        assert_eq!(config.file, None);
        assert_eq!(config.backup_count, 5);
        assert_eq!(config.rotate_bytes, DEFAULT_ROTATE_BYTES);
        assert_eq!(config.directives(), "error,hiresti_core=debug");

        let defaults = LogConfig::from_lookup(|_| None);
        assert_eq!(defaults.directives(), "info");
    }

    #[test]
    fn test_rotate_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hiresti.log");

        assert!(!rotate_log(&path, 10, 2).unwrap());

        fs::write(&path, "first generation").unwrap();
        assert!(rotate_log(&path, 10, 2).unwrap());
        assert!(!path.exists());

        fs::write(&path, "second generation").unwrap();
        assert!(rotate_log(&path, 10, 2).unwrap());
        fs::write(&path, "third generation").unwrap();
        assert!(rotate_log(&path, 10, 2).unwrap());

        assert_eq!(fs::read_to_string(backup_path(&path, 1)).unwrap(), "third generation");
        assert_eq!(fs::read_to_string(backup_path(&path, 2)).unwrap(), "second generation");
        assert!(!backup_path(&path, 3).exists());

        fs::write(&path, "tiny").unwrap();
        assert!(!rotate_log(&path, 10, 2).unwrap());
    }
}
