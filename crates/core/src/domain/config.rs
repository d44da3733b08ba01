//! Configuration management for the preamp
//!
//! This module provides:
//! - Configuration structs for relay boards, amplifier power and outputs
//! - TOML serialization and async file IO
//! - Validation of relay index spaces and output definitions
//! - A manager resolving the default configuration location

use crate::domain::error::PreampError;
use crate::domain::hardware::RelayTiming;
use crate::domain::output::OutputId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for PreampError {
    fn from(e: ConfigError) -> Self {
        PreampError::Configuration(e.to_string())
    }
}

/// Relay settle and debounce waits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub settle_ms: u64,
    pub debounce_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 15,
            debounce_ms: 3,
        }
    }
}

impl TimingConfig {
    pub fn relay_timing(&self) -> RelayTiming {
        RelayTiming {
            settle: Duration::from_millis(self.settle_ms),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

/// Volume ladder board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttenuatorConfig {
    pub power_line: String,
    pub prefix: String,
}

impl Default for AttenuatorConfig {
    fn default() -> Self {
        Self {
            power_line: "RELAY_PWR".to_string(),
            prefix: "DELTA1_".to_string(),
        }
    }
}

/// Routing board; `inputs` and `outputs` are board relay numbers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub power_line: String,
    pub prefix: String,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            power_line: "RELAY_PWR".to_string(),
            prefix: "DELTA2_".to_string(),
            inputs: vec![0, 1, 2, 3, 4],
            outputs: vec![5, 6, 7],
        }
    }
}

/// Amplifier trigger line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmplifierConfig {
    pub line: String,
    pub on_delay_ms: u64,
    pub off_grace_ms: u64,
}

impl Default for AmplifierConfig {
    fn default() -> Self {
        Self {
            line: "TRIG_OUT_0".to_string(),
            on_delay_ms: 4_000,
            off_grace_ms: 120_000,
        }
    }
}

impl AmplifierConfig {
    pub fn on_delay(&self) -> Duration {
        Duration::from_millis(self.on_delay_ms)
    }

    pub fn off_grace(&self) -> Duration {
        Duration::from_millis(self.off_grace_ms)
    }
}

/// Power-on and power-off targets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerConfig {
    /// Silent output with pass-through coefficients, used on power transitions
    pub standby_output: String,
    /// Volume applied on power-on
    pub on_volume: u8,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            standby_output: "off:dirac".to_string(),
            on_volume: 170,
        }
    }
}

/// Connection to the FIR filter engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterEngineConfig {
    pub host: String,
    pub port: u16,
    /// Filters whose coefficients are switched together
    pub filters: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for FilterEngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6556,
            filters: vec!["left".to_string(), "right".to_string()],
            timeout_ms: 2_000,
        }
    }
}

/// Sysfs GPIO line numbering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    pub base_path: PathBuf,
    /// Symbolic line name to kernel GPIO number
    #[serde(default)]
    pub lines: BTreeMap<String, u32>,
}

impl Default for GpioConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/sys/class/gpio"),
            lines: BTreeMap::new(),
        }
    }
}

/// One symbolic output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    /// Positions in the matrix output group closed for this output
    pub relays: Vec<usize>,
    /// Valid coefficient sets, in presentation order
    pub coefficients: Vec<String>,
    /// Whether the downstream amplifier must be powered
    #[serde(default)]
    pub amplifier: bool,
}

impl OutputConfig {
    pub fn new(name: &str, relays: &[usize], coefficients: &[&str], amplifier: bool) -> Self {
        Self {
            name: name.to_string(),
            relays: relays.to_vec(),
            coefficients: coefficients.iter().map(|c| c.to_string()).collect(),
            amplifier,
        }
    }
}

pub(crate) fn output_ids(outputs: &[OutputConfig]) -> Vec<OutputId> {
    outputs
        .iter()
        .flat_map(|o| {
            o.coefficients
                .iter()
                .map(move |c| OutputId::new(o.name.as_str(), c.as_str()))
        })
        .collect()
}

/// Complete preamp configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreampConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub attenuator: AttenuatorConfig,
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub amplifier: AmplifierConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub filter_engine: FilterEngineConfig,
    #[serde(default)]
    pub gpio: GpioConfig,
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl Default for PreampConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            attenuator: AttenuatorConfig::default(),
            matrix: MatrixConfig::default(),
            amplifier: AmplifierConfig::default(),
            power: PowerConfig::default(),
            filter_engine: FilterEngineConfig::default(),
            gpio: GpioConfig::default(),
            outputs: vec![OutputConfig::new("off", &[], &["dirac"], false)],
        }
    }
}

impl PreampConfig {
    /// The reference installation: headphones, speakers with and without
    /// subwoofer, and a silent standby output
    pub fn factory_default() -> Self {
        let mut config = Self::default();
        config.outputs = vec![
            OutputConfig::new("headphones", &[2], &["hd650", "dirac"], false),
            OutputConfig::new("speakers", &[0, 1], &["harman_with_sub_dec7", "dirac"], true),
            OutputConfig::new("no_sub", &[0], &["harman_without_sub", "dirac"], true),
            OutputConfig::new("off", &[], &["dirac"], false),
        ];
        config
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config = Self::from_toml_str(&contents)?;

        debug!(outputs = config.outputs.len(), "Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    pub fn output(&self, name: &str) -> Option<&OutputConfig> {
        self.outputs.iter().find(|o| o.name == name)
    }

    /// Every configured output/coefficient pair, in configuration order
    pub fn output_ids(&self) -> Vec<OutputId> {
        output_ids(&self.outputs)
    }

    /// Reject relay and output definitions the hardware cannot honour
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let inputs: BTreeSet<_> = self.matrix.inputs.iter().collect();
        let outputs: BTreeSet<_> = self.matrix.outputs.iter().collect();
        if inputs.len() != self.matrix.inputs.len() || outputs.len() != self.matrix.outputs.len() {
            return invalid("matrix relay groups contain duplicate indices".to_string());
        }
        if let Some(shared) = inputs.intersection(&outputs).next() {
            return invalid(format!(
                "matrix relay {} is both an input and an output",
                shared
            ));
        }

        let mut names = BTreeSet::new();
        for output in &self.outputs {
            if output.name.is_empty() || output.name.contains(':') {
                return invalid(format!("output name '{}' is not usable", output.name));
            }
            if !names.insert(output.name.as_str()) {
                return invalid(format!("output '{}' is defined twice", output.name));
            }
            if output.coefficients.is_empty() {
                return invalid(format!("output '{}' has no coefficient sets", output.name));
            }
            if let Some(coeff) = output
                .coefficients
                .iter()
                .find(|c| c.is_empty() || c.contains(':'))
            {
                return invalid(format!(
                    "output '{}' has unusable coefficient name '{}'",
                    output.name, coeff
                ));
            }
            if let Some(relay) = output
                .relays
                .iter()
                .find(|&&r| r >= self.matrix.outputs.len())
            {
                return invalid(format!(
                    "output '{}' uses relay {} but the matrix has {} outputs",
                    output.name,
                    relay,
                    self.matrix.outputs.len()
                ));
            }
        }

        let standby: OutputId = self
            .power
            .standby_output
            .parse()
            .map_err(|e: PreampError| ConfigError::Invalid(e.to_string()))?;
        let configured = self
            .output(standby.output())
            .map(|o| o.coefficients.iter().any(|c| c == standby.coefficients()))
            .unwrap_or(false);
        if !configured {
            return invalid(format!(
                "standby output '{}' is not a configured output",
                standby
            ));
        }

        Ok(())
    }
}

/// Configuration manager for the main preamp config
///
/// Manages the configuration file at `~/.config/phire/preamp.toml`.
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("preamp.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Get the default config directory path
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("phire"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// A missing file yields the factory default, which is written out for
    /// next time. A file that fails to parse or validate is an error: relay
    /// wiring must never be guessed.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<PreampConfig> {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = PreampConfig::factory_default();
            if let Err(e) = self.save(&config).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }
            return Ok(config);
        }

        PreampConfig::load_from_file(&self.config_path).await
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &PreampConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_serialization() {
        let config = PreampConfig::factory_default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = PreampConfig::from_toml_str(&toml_str).unwrap();

        assert_eq!(parsed.outputs.len(), config.outputs.len());
        assert_eq!(parsed.matrix.outputs, vec![5, 6, 7]);
        assert_eq!(parsed.power.on_volume, 170);
    }

    #[test]
    fn test_sections_default_when_missing() {
        let config = PreampConfig::from_toml_str(
            r#"
            [[outputs]]
            name = "off"
            relays = []
            coefficients = ["dirac"]

            [[outputs]]
            name = "speakers"
            relays = [0, 1]
            coefficients = ["harman"]
            amplifier = true
            "#,
        )
        .unwrap();

        assert_eq!(config.timing.settle_ms, 15);
        assert_eq!(config.amplifier.off_grace(), Duration::from_secs(120));
        assert!(config.output("speakers").unwrap().amplifier);
        assert!(!config.output("off").unwrap().amplifier);
    }

    #[test]
    fn test_output_ids_follow_configuration_order() {
        let ids: Vec<String> = PreampConfig::factory_default()
            .output_ids()
            .iter()
            .map(OutputId::to_string)
            .collect();
        assert_eq!(
            ids,
            vec![
                "headphones:hd650",
                "headphones:dirac",
                "speakers:harman_with_sub_dec7",
                "speakers:dirac",
                "no_sub:harman_without_sub",
                "no_sub:dirac",
                "off:dirac",
            ]
        );
    }

    #[test]
    fn test_overlapping_matrix_groups_rejected() {
        let mut config = PreampConfig::factory_default();
        config.matrix.outputs = vec![4, 5, 6];
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_output_relay_outside_group_rejected() {
        let mut config = PreampConfig::factory_default();
        config.outputs.push(OutputConfig::new("extra", &[3], &["flat"], false));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_and_malformed_outputs_rejected() {
        let mut config = PreampConfig::factory_default();
        config.outputs.push(OutputConfig::new("off", &[], &["dirac"], false));
        assert!(config.validate().is_err());

        let mut config = PreampConfig::factory_default();
        config.outputs.push(OutputConfig::new("a:b", &[], &["dirac"], false));
        assert!(config.validate().is_err());

        let mut config = PreampConfig::factory_default();
        config.outputs.push(OutputConfig::new("empty", &[], &[], false));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_standby_must_be_configured() {
        let mut config = PreampConfig::factory_default();
        config.power.standby_output = "off:harman".to_string();
        assert!(config.validate().is_err());

        config.power.standby_output = "nonsense".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("preamp.toml");

        let mut config = PreampConfig::factory_default();
        config.gpio.lines.insert("RELAY_PWR".to_string(), 17);
        config.save_to_file(&config_path).await.unwrap();

        let loaded = PreampConfig::load_from_file(&config_path).await.unwrap();
        assert_eq!(loaded.gpio.lines.get("RELAY_PWR"), Some(&17));
        assert_eq!(loaded.outputs.len(), 4);
    }

    #[tokio::test]
    async fn test_manager_creates_factory_default() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().join("phire"));

        let config = manager.load().await.unwrap();
        assert_eq!(config.outputs.len(), 4);
        assert!(manager.config_path().exists());
    }

    #[tokio::test]
    async fn test_manager_rejects_corrupt_file() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::new(temp_dir.path().to_path_buf());
        std::fs::write(manager.config_path(), "outputs = 3").unwrap();

        assert!(manager.load().await.is_err());
    }
}
