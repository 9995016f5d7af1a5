use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    TargetsEmpty(String),
    BadTargetFormatting(String),
    DirectoryDoesNotExist(String),
    NotInRange(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::TargetsEmpty(e) => write!(f, "Targets configuration error: {}", e),
            ConfigError::BadTargetFormatting(e) => write!(f, "Target formatting error: {}", e),
            ConfigError::DirectoryDoesNotExist(e) => write!(f, "Directory error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

/// Failures of a single capture pipeline. None of these ever leaves the
/// pipeline that produced it except as that pipeline's outcome.
#[derive(Debug)]
pub enum CaptureError {
    /// The TCP connection to the target could not be established.
    ConnectFailed(SocketAddr, std::io::Error),
    /// The capture file could not be created.
    FileCreate(PathBuf, std::io::Error),
    /// Writing the global header or a record failed; the file is left as last flushed.
    FileWrite(std::io::Error),
    /// More consecutive bytes were skipped while resynchronising than allowed.
    PersistentDesync(usize),
    /// A stage task panicked or was cancelled.
    StageFailed(String),
    /// A stop was requested while the connection was still being established.
    Cancelled(SocketAddr),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::ConnectFailed(addr, e) => write!(f, "Connection to {} failed: {}", addr, e),
            CaptureError::FileCreate(path, e) => {
                write!(f, "Unable to create capture file {}: {}", path.display(), e)
            }
            CaptureError::FileWrite(e) => write!(f, "Capture file write error: {}", e),
            CaptureError::PersistentDesync(n) => {
                write!(f, "Stream desynchronised for {} consecutive bytes", n)
            }
            CaptureError::StageFailed(e) => write!(f, "Capture stage failed: {}", e),
            CaptureError::Cancelled(addr) => {
                write!(f, "Capture of {} stopped before it connected", addr)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

#[derive(Debug)]
pub enum DiscoveryError {
    IoError(std::io::Error),
    Unsupported,
    MalformedRoute(String),
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::IoError(e) => write!(f, "Routing table IO error: {}", e),
            DiscoveryError::Unsupported => {
                write!(f, "Gateway discovery is not supported on this platform")
            }
            DiscoveryError::MalformedRoute(e) => write!(f, "Malformed routing entry: {}", e),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::IoError(err)
    }
}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    AllCapturesFailed(usize),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::AllCapturesFailed(n) => write!(f, "All {} capture(s) failed", n),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}
