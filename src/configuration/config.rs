use super::types::*;
use crate::data_capture::pipeline::{
    CaptureSettings, DEFAULT_BYTE_CEILING, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CHUNK_SIZE,
};
use crate::data_capture::reassembler::{HEADER_LEN, MAX_FRAME_SIZE};
use crate::error_handling::types::ConfigError;
use clap::Parser;
use log::debug;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Command-line arguments.
///
/// Everything except the config file path overrides the matching value from
/// the file.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mtcp-capture")]
#[command(version)]
#[command(about = "Capture length-prefixed TCP streams into pcap files")]
pub struct CliArgs {
    /// Path to a TOML configuration file
    pub config_file: Option<PathBuf>,

    /// Capture target as ADDR:PORT; may be repeated
    ///
    /// # Command Line
    /// Use `--target 192.168.0.1:9800 --target 192.168.0.1:9801`
    #[arg(long = "target")]
    pub targets: Vec<SocketAddr>,

    /// Directory capture files are written to
    #[arg(long, env = "MTCP_CAPTURE_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Stop each capture after this many bytes
    #[arg(long)]
    pub byte_ceiling: Option<u64>,

    /// Also capture from every default gateway on the discovery ports
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub discover_gateways: bool,
}

/// Application configuration.
///
/// Loaded from TOML; every field has a default, so an empty file is valid.
///
/// ```toml
/// output_dir = "/var/lib/mtcp"
/// byte_ceiling = 524288000
///
/// [[targets]]
/// address = "192.168.0.1"
/// ports = [9800, 9801]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory capture files are created in. Must already exist.
    pub output_dir: PathBuf,
    /// Bytes requested per socket read.
    pub chunk_size: usize,
    /// Bytes after which a capture stops.
    pub byte_ceiling: u64,
    /// Bounded handoff queue size, in chunks.
    pub channel_capacity: usize,
    /// Largest declared frame length accepted, header included.
    pub max_frame_size: usize,
    /// Consecutive skipped bytes before a capture gives up; 0 is unbounded.
    pub max_resync_skip: usize,
    /// Add the host's default gateways as targets.
    pub discover_gateways: bool,
    /// Ports used for discovered gateways.
    pub discovery_ports: Vec<u16>,
    /// Explicit targets.
    pub targets: Vec<TargetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            chunk_size: DEFAULT_CHUNK_SIZE,
            byte_ceiling: DEFAULT_BYTE_CEILING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
            max_resync_skip: 0,
            discover_gateways: false,
            discovery_ports: default_ports(),
            targets: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        debug!("Read configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::TomlError(e.to_string()))
    }

    /// Builds the configuration from parsed arguments: the file (if given)
    /// first, then command-line overrides, then validation.
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match &args.config_file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(args);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if let Some(dir) = &args.output_dir {
            self.output_dir = dir.clone();
        }
        if let Some(ceiling) = args.byte_ceiling {
            self.byte_ceiling = ceiling;
        }
        if args.discover_gateways {
            self.discover_gateways = true;
        }
        for addr in &args.targets {
            match self.targets.iter_mut().find(|t| t.address == addr.ip()) {
                Some(target) if target.ports.contains(&addr.port()) => {}
                Some(target) => target.ports.push(addr.port()),
                None => self.targets.push(TargetConfig {
                    address: addr.ip(),
                    ports: vec![addr.port()],
                }),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::NotInRange("chunk_size must be positive".into()));
        }
        if self.byte_ceiling == 0 {
            return Err(ConfigError::NotInRange("byte_ceiling must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::NotInRange(
                "channel_capacity must be positive".into(),
            ));
        }
        if !(HEADER_LEN..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ConfigError::NotInRange(format!(
                "max_frame_size must be between {} and {}",
                HEADER_LEN, MAX_FRAME_SIZE
            )));
        }
        let all_ports = self
            .targets
            .iter()
            .flat_map(|t| t.ports.iter())
            .chain(self.discovery_ports.iter());
        for port in all_ports {
            if *port == 0 {
                return Err(ConfigError::BadTargetFormatting("port 0 is not connectable".into()));
            }
        }
        if self.targets.iter().any(|t| t.ports.is_empty()) {
            return Err(ConfigError::BadTargetFormatting(
                "every target needs at least one port".into(),
            ));
        }
        if !self.output_dir.is_dir() {
            return Err(ConfigError::DirectoryDoesNotExist(
                self.output_dir.display().to_string(),
            ));
        }
        Ok(())
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            chunk_size: self.chunk_size,
            byte_ceiling: self.byte_ceiling,
            channel_capacity: self.channel_capacity,
            max_frame_size: self.max_frame_size,
            max_resync_skip: self.max_resync_skip,
            output_dir: self.output_dir.clone(),
        }
    }

    /// Explicitly configured endpoints, duplicates removed, in file order.
    pub fn target_addrs(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = Vec::new();
        for addr in self.targets.iter().flat_map(TargetConfig::socket_addrs) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }
}
