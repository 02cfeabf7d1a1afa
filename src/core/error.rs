use std::path::PathBuf;

/// Result type alias for device-test-runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for device-test-runner.
///
/// Only precondition, resolution and programming errors surface here. A
/// launched process that fails, times out or crashes is reported through
/// [`ExecutionResult`](crate::process::ExecutionResult) and
/// [`TestVerdict`](crate::harness::TestVerdict) instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No hardware device or simulator matched the request.
    #[error("No device found: {0}")]
    NoDeviceFound(String),

    /// A helper process could not be started or supervised.
    #[error("Process error: {0}")]
    Process(String),

    /// Test listener errors.
    #[error("Listener error: {0}")]
    Listener(String),

    /// Crash report collection errors.
    #[error("Crash reporter error: {0}")]
    CrashReporter(String),

    /// `end_capture` was called before `start_capture`.
    #[error("Crash snapshot capture was ended without being started first")]
    CaptureNotStarted,

    /// Malformed listing or result document.
    #[error("XML error: {0}")]
    Xml(String),

    /// Operation not supported for the given target or bundle.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The app bundle directory does not exist.
    #[error("App bundle not found: {}", .0.display())]
    BundleNotFound(PathBuf),

    /// File not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Missing required configuration field.
    #[error("Missing required configuration field: {0}")]
    MissingConfig(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidConfig { field: String, value: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML deserialization error.
    #[error("TOML parsing error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML reader error.
    #[error("XML parsing error: {0}")]
    XmlRead(#[from] xml::reader::Error),

    /// XML writer error.
    #[error("XML writing error: {0}")]
    XmlWrite(#[from] xml::writer::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a no-device-found error.
    pub fn no_device(msg: impl Into<String>) -> Self {
        Error::NoDeviceFound(msg.into())
    }

    /// Create a process error.
    pub fn process(msg: impl Into<String>) -> Self {
        Error::Process(msg.into())
    }

    /// Create a listener error.
    pub fn listener(msg: impl Into<String>) -> Self {
        Error::Listener(msg.into())
    }

    /// Create a crash reporter error.
    pub fn crash_reporter(msg: impl Into<String>) -> Self {
        Error::CrashReporter(msg.into())
    }

    /// Create an XML document error.
    pub fn xml(msg: impl Into<String>) -> Self {
        Error::Xml(msg.into())
    }

    /// Create an unsupported operation error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::Unsupported(msg.into())
    }

    /// Whether this error means device resolution failed and may be retried.
    pub fn is_no_device(&self) -> bool {
        matches!(self, Error::NoDeviceFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            Error::config("bad value").to_string(),
            "Configuration error: bad value"
        );
        assert_eq!(
            Error::no_device("no iPhone attached").to_string(),
            "No device found: no iPhone attached"
        );
        assert_eq!(
            Error::process("mlaunch missing").to_string(),
            "Process error: mlaunch missing"
        );
        assert_eq!(
            Error::listener("bind failed").to_string(),
            "Listener error: bind failed"
        );
        assert_eq!(
            Error::crash_reporter("download failed").to_string(),
            "Crash reporter error: download failed"
        );
        assert_eq!(
            Error::xml("no root").to_string(),
            "XML error: no root"
        );
        assert_eq!(
            Error::unsupported("WatchKit2 extensions").to_string(),
            "Unsupported operation: WatchKit2 extensions"
        );
    }

    #[test]
    fn test_error_capture_not_started() {
        assert_eq!(
            Error::CaptureNotStarted.to_string(),
            "Crash snapshot capture was ended without being started first"
        );
    }

    #[test]
    fn test_error_bundle_not_found() {
        let err = Error::BundleNotFound(PathBuf::from("/builds/App.app"));
        assert_eq!(err.to_string(), "App bundle not found: /builds/App.app");
    }

    #[test]
    fn test_error_invalid_config() {
        let err = Error::InvalidConfig {
            field: "listener.transport".to_string(),
            value: "udp".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for listener.transport: udp"
        );
    }

    #[test]
    fn test_is_no_device() {
        assert!(Error::no_device("x").is_no_device());
        assert!(!Error::config("x").is_no_device());
    }
}
