//! Platform Error Types

use thiserror::Error;

/// Errors from driver enumeration and session control
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Driver not available on this system: {0}")]
    DriverUnavailable(String),

    #[error("Failed to run {tool}: {message}")]
    CommandFailed { tool: String, message: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("Unsupported device id for this operation: {0}")]
    UnsupportedDevice(String),

    #[error("Card profile switch failed: {0}")]
    ProfileSwitchFailed(String),

    #[error("Feature not available on this platform: {0}")]
    FeatureNotAvailable(String),
}

impl PlatformError {
    pub(crate) fn command(tool: &str, message: impl Into<String>) -> Self {
        PlatformError::CommandFailed {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn parse(what: &str, message: impl Into<String>) -> Self {
        PlatformError::Parse {
            what: what.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::UnknownDriver("OSS".into());
        assert!(err.to_string().contains("OSS"));

        let err = PlatformError::command("pactl", "not found");
        assert_eq!(err.to_string(), "Failed to run pactl: not found");
    }
}
