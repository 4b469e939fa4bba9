//! Reader configuration.
//!
//! Configuration is a plain serde struct with defaults, loadable from YAML
//! or assembled programmatically (the CLI maps its flags onto it 1:1).
//! [`ReaderConfig::validate`] applies the session's invariants before any
//! stream is opened; it may adjust values (the worker-thread floor) and
//! logs a warning when it does.

use crate::kernels::ProcessingMode;
use crate::packet::MAX_PORTS;
use crate::time::LOFAR_EPOCH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Error type for configuration loading and validation.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    Read(String),
    /// Failed to parse configuration YAML.
    Parse(String),
    /// A configuration value violates a session invariant.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read(msg) => write!(f, "failed to read config: {msg}"),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {msg}"),
            ConfigError::Validation(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Input source selection, one stream per port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InputSpec {
    /// Raw concatenated packets on disk, one file per port.
    Raw { paths: Vec<PathBuf> },
    /// Zstandard-compressed packet stream, one file per port.
    Compressed { paths: Vec<PathBuf> },
    /// Shared-memory ring buffers; port `i` uses `base_key + i * key_offset`.
    Ring { base_key: u32, key_offset: u32 },
}

impl Default for InputSpec {
    fn default() -> Self {
        InputSpec::Raw { paths: Vec::new() }
    }
}

impl InputSpec {
    /// Number of streams this spec describes, if it is path-based.
    pub fn path_count(&self) -> Option<usize> {
        match self {
            InputSpec::Raw { paths } | InputSpec::Compressed { paths } => Some(paths.len()),
            InputSpec::Ring { .. } => None,
        }
    }
}

/// Parameters for the external Jones-matrix generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Base path for the FIFO used to receive the matrix table.
    pub fifo_path: PathBuf,
    /// Subband strategy handed to the generator, e.g. `HBA,12:499`.
    pub subbands: String,
    /// Pointing angles in the chosen basis.
    pub pointing: [f64; 2],
    /// Coordinate basis of the pointing, e.g. `J2000`.
    pub pointing_basis: String,
    /// Observation duration covered by one generated table, in seconds.
    pub duration: f64,
    /// Generator executable; overridable for test rigs.
    pub generator: String,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            fifo_path: PathBuf::new(),
            subbands: String::new(),
            pointing: [0.0, 0.0],
            pointing_basis: String::new(),
            duration: 0.0,
            generator: "dreamBeamJonesGenerator.py".to_string(),
        }
    }
}

/// Full reader configuration; see the field docs for the invariants
/// enforced by [`validate`](ReaderConfig::validate).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Input transport and per-port locations.
    pub input: InputSpec,
    /// Streams to combine; 1..=4 and equal to the opened stream count.
    pub num_ports: usize,
    /// Window size in packets; at least 2. The session may lower its
    /// working copy on partial reads.
    pub packets_per_iteration: i64,
    /// Processing-mode id from the closed set.
    pub processing_mode: u16,
    /// Replay the previous packet on loss instead of zero-filling.
    pub replay_dropped_packets: bool,
    /// Absolute packet number to align to; values before the LOFAR epoch
    /// mean "do not align".
    pub starting_packet: i64,
    /// Cap on cumulative packets consumed; negative means unbounded.
    pub packets_read_max: i64,
    /// Global `[lo, hi)` beamlet selection; `(0, 0)` selects everything.
    pub beamlet_limits: [u32; 2],
    /// Multiply samples by generated Jones matrices.
    pub calibrate_data: bool,
    /// Generator parameters; required when `calibrate_data` is set.
    pub calibration: Option<CalibrationConfig>,
    /// Worker threads for reads and kernels; silently raised to 4.
    pub threads: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            input: InputSpec::default(),
            num_ports: 1,
            packets_per_iteration: 65_536,
            processing_mode: 0,
            replay_dropped_packets: false,
            starting_packet: -1,
            packets_read_max: -1,
            beamlet_limits: [0, 0],
            calibrate_data: false,
            calibration: None,
            threads: 8,
        }
    }
}

impl ReaderConfig {
    /// Load a configuration from a YAML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse a configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the configuration, adjusting values where the session has
    /// a documented floor. Must pass before a reader is constructed.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.num_ports == 0 || self.num_ports > MAX_PORTS {
            return Err(ConfigError::Validation(format!(
                "a station produces between 1 and {MAX_PORTS} streams, not {}",
                self.num_ports
            )));
        }

        if let Some(count) = self.input.path_count() {
            if count != self.num_ports {
                return Err(ConfigError::Validation(format!(
                    "{} input paths given for {} ports",
                    count, self.num_ports
                )));
            }
        }

        if self.packets_per_iteration < 2 {
            return Err(ConfigError::Validation(format!(
                "packets_per_iteration must be at least 2, got {}",
                self.packets_per_iteration
            )));
        }

        if ProcessingMode::from_id(self.processing_mode).is_none() {
            return Err(ConfigError::Validation(format!(
                "unknown processing mode {}",
                self.processing_mode
            )));
        }

        let [lo, hi] = self.beamlet_limits;
        if lo > 0 && hi > 0 && lo >= hi {
            return Err(ConfigError::Validation(format!(
                "beamlet limits [{lo}, {hi}) select nothing"
            )));
        }
        if (lo > 0 || hi > 0) && self.processing_mode < 2 {
            return Err(ConfigError::Validation(
                "processing modes 0 and 1 do not support beamlet limits".to_string(),
            ));
        }

        if self.starting_packet > 0 && self.starting_packet < LOFAR_EPOCH {
            return Err(ConfigError::Validation(format!(
                "starting packet {} predates the LOFAR epoch",
                self.starting_packet
            )));
        }

        if self.packets_read_max == 0 {
            return Err(ConfigError::Validation(
                "packets_read_max of 0 means no work will be performed".to_string(),
            ));
        }

        if self.calibrate_data {
            let cal = self.calibration.as_ref().ok_or_else(|| {
                ConfigError::Validation(
                    "calibration enabled without calibration parameters".to_string(),
                )
            })?;
            if cal.fifo_path.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "calibration requires a FIFO path".to_string(),
                ));
            }
            if cal.subbands.is_empty() {
                return Err(ConfigError::Validation(
                    "calibration requires a subband strategy".to_string(),
                ));
            }
            if cal.pointing_basis.is_empty() {
                return Err(ConfigError::Validation(
                    "calibration requires a pointing basis".to_string(),
                ));
            }
        }

        if self.threads < 4 {
            warn!(
                threads = self.threads,
                "raising worker threads to the floor of 4"
            );
            self.threads = 4;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ReaderConfig {
        ReaderConfig {
            input: InputSpec::Raw {
                paths: vec![PathBuf::from("./port0")],
            },
            num_ports: 1,
            packets_per_iteration: 16,
            ..Default::default()
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_port_count_mismatch() {
        let mut config = valid();
        config.num_ports = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_too_many_ports() {
        let mut config = valid();
        config.num_ports = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tiny_window() {
        let mut config = valid();
        config.packets_per_iteration = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        let mut config = valid();
        config.processing_mode = 42;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_limits_on_copy_modes() {
        let mut config = valid();
        config.beamlet_limits = [0, 10];
        assert!(config.validate().is_err());
        config.processing_mode = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_limits() {
        let mut config = valid();
        config.processing_mode = 100;
        config.beamlet_limits = [20, 10];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_pre_epoch_start() {
        let mut config = valid();
        config.starting_packet = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn raises_thread_floor() {
        let mut config = valid();
        config.threads = 1;
        config.validate().unwrap();
        assert_eq!(config.threads, 4);
    }

    #[test]
    fn calibration_requires_parameters() {
        let mut config = valid();
        config.calibrate_data = true;
        assert!(config.validate().is_err());

        config.calibration = Some(CalibrationConfig {
            fifo_path: PathBuf::from("/tmp/jones"),
            subbands: "HBA,12:499".to_string(),
            pointing: [0.1, 0.2],
            pointing_basis: "J2000".to_string(),
            duration: 10.0,
            ..Default::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_yaml() {
        let yaml = r#"
input:
  kind: raw
  paths: ["./udp_0"]
num_ports: 1
packets_per_iteration: 256
processing_mode: 150
"#;
        let mut config = ReaderConfig::parse(yaml).unwrap();
        assert_eq!(config.packets_per_iteration, 256);
        assert_eq!(config.processing_mode, 150);
        assert!(config.validate().is_ok());
    }
}
