//! Application configuration
//!
//! Settings come from a TOML file, then `IOTSWARM__SECTION__KEY`
//! environment variables override individual keys.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use iotswarm_core::{DeviceProfile, RetryPolicy, SiteId, TableName};
use iotswarm_live::LiveUploadConfig;
use iotswarm_swarm::SwarmConfig;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, path::PathBuf};

pub const ENV_PREFIX: &str = "IOTSWARM";
pub const ENV_SEPARATOR: &str = "__";

/// Where readings are read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Sqlite { path: PathBuf },
    Memory,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Memory
    }
}

/// Where payloads are delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    Log,
    File { root: PathBuf },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Log
    }
}

/// Settings shared by every simulated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    pub table: TableName,
    /// Explicit sites; when empty the sites are listed from the source
    pub sites: Vec<SiteId>,
    pub sleep_time_ms: u64,
    pub max_cycles: Option<u64>,
    pub delay_start: bool,
    pub no_send_probability: u8,
    pub topic_prefix: Option<String>,
    pub topic_suffix: Option<String>,
    pub profile: DeviceProfile,
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self {
            table: "LEVEL_1_SOILMET_30MIN".to_string(),
            sites: Vec::new(),
            sleep_time_ms: 60_000,
            max_cycles: None,
            delay_start: false,
            no_send_probability: 0,
            topic_prefix: None,
            topic_suffix: None,
            profile: DeviceProfile::default(),
        }
    }
}

/// Location of the checkpoint files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub dir: PathBuf,
    pub name: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("state"),
            name: "live-upload".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete configuration of the `iotswarm` binary
///
/// The top level `[retry]` section applies to devices and to the live
/// uploader alike.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub swarm: SwarmConfig,
    pub device: DeviceDefaults,
    pub retry: RetryPolicy,
    pub live: LiveUploadConfig,
    pub state: StateConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Load `path` with overrides from the process environment
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load `path`, taking overrides from `env` instead of the process
    /// environment when given
    pub fn load_with_env(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let file = File::new(&path.to_string_lossy(), FileFormat::Toml).required(true);
        Self::build(Config::builder().add_source(file), env)
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    }

    /// Parse a TOML document, used for embedded defaults and tests
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::build(
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
            Some(HashMap::new()),
        )
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let mut app: AppConfig = settings.try_deserialize()?;
        app.live.retry = app.retry.clone();
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device.table.is_empty() {
            bail!("device.table must not be empty");
        }
        if self.device.no_send_probability > 100 {
            bail!(
                "device.no_send_probability must be within 0..=100, got {}",
                self.device.no_send_probability
            );
        }
        if self.state.name.is_empty() {
            bail!("state.name must not be empty");
        }
        self.retry.validate()?;
        self.live.validate()?;
        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[source]
kind = "sqlite"
path = "/var/lib/cosmos/readings.db"

[sink]
kind = "file"
root = "/tmp/outbox"

[swarm]
name = "soilmet-load"
max_concurrent_devices = 50

[device]
table = "LEVEL_1_SOILMET_30MIN"
sites = ["MORLY", "ALIC1"]
sleep_time_ms = 5000
max_cycles = 3
no_send_probability = 10

[retry]
max_attempts = 2

[live]
fallback_hours = 6
batch_size = 10

[live.table_batch_sizes]
LEVEL_1_PRECIP_1MIN = 60

[state]
dir = "/var/lib/iotswarm"
name = "cosmos"
"#;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.source, SourceConfig::Memory);
        assert_eq!(config.sink, SinkConfig::Log);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_sample() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.source,
            SourceConfig::Sqlite {
                path: PathBuf::from("/var/lib/cosmos/readings.db")
            }
        );
        assert_eq!(
            config.sink,
            SinkConfig::File {
                root: PathBuf::from("/tmp/outbox")
            }
        );
        assert_eq!(config.swarm.name.as_deref(), Some("soilmet-load"));
        assert_eq!(config.swarm.max_concurrent_devices, Some(50));
        assert_eq!(config.device.sites, vec!["MORLY", "ALIC1"]);
        assert_eq!(config.device.max_cycles, Some(3));
        assert_eq!(config.device.no_send_probability, 10);
        assert_eq!(config.live.fallback_hours, 6);
        assert_eq!(config.live.batch_size_for("LEVEL_1_PRECIP_1MIN"), 60);
        assert_eq!(config.live.batch_size_for("LEVEL_1_NMDB_1HOUR"), 10);
        assert_eq!(config.state.name, "cosmos");
    }

    #[test]
    fn test_top_level_retry_applies_to_live_uploads() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.live.retry, config.retry);
    }

    #[test]
    fn test_invalid_probability_rejected() {
        let err = AppConfig::from_toml_str("[device]\nno_send_probability = 150\n").unwrap_err();
        assert!(err.to_string().contains("no_send_probability"));
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let env = HashMap::from([
            ("IOTSWARM__LIVE__FALLBACK_HOURS".to_string(), "12".to_string()),
            ("IOTSWARM__LOG__JSON".to_string(), "true".to_string()),
        ]);
        // NamedTempFile has no extension, so the format must be explicit
        let config = AppConfig::load_with_env(file.path(), Some(env)).unwrap();

        assert_eq!(config.live.fallback_hours, 12);
        assert!(config.log.json);
        assert_eq!(config.live.batch_size, 10);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load_with_env(&dir.path().join("absent.toml"), Some(HashMap::new()))
            .unwrap_err();
        assert!(err.to_string().contains("absent.toml"));
    }

    #[test]
    fn test_toml_rendering_reloads() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
