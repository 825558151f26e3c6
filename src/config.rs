use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::models::Metric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sensors: SensorMap,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub poll: PollConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Let a later run reclaim rows whose delivery failed.
    #[serde(default)]
    pub reclaim_failed: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub kind: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    pub s3: Option<S3StorageConfig>,
    pub local: Option<LocalStorageConfig>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.csv".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Address objects as `/<bucket>/<key>`. Implied when `endpoint_url` is set.
    #[serde(default)]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalStorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Environment variable holding a bearer token, if the API needs one.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Fixed device for every file. When unset the device is the name of the
    /// file's parent directory.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            device_id: None,
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

/// Which optional metrics are forwarded. `pm25` is always sent.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct MetricsConfig {
    #[serde(default = "enabled")]
    pub pm1: bool,
    #[serde(default = "enabled")]
    pub pm10: bool,
    #[serde(default = "enabled")]
    pub temperature: bool,
    #[serde(default = "enabled")]
    pub humidity: bool,
}

fn enabled() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            pm1: true,
            pm10: true,
            temperature: true,
            humidity: true,
        }
    }
}

impl MetricsConfig {
    pub fn is_enabled(&self, metric: Metric) -> bool {
        match metric {
            Metric::Pm1 => self.pm1,
            Metric::Pm10 => self.pm10,
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
        }
    }
}

/// `device_id → sensor_id`, accepting integer or string sensor ids.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(from = "HashMap<String, RawSensorId>")]
pub struct SensorMap(HashMap<String, String>);

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSensorId {
    Int(i64),
    Str(String),
}

impl From<HashMap<String, RawSensorId>> for SensorMap {
    fn from(raw: HashMap<String, RawSensorId>) -> Self {
        SensorMap(
            raw.into_iter()
                .map(|(device, id)| {
                    let id = match id {
                        RawSensorId::Int(n) => n.to_string(),
                        RawSensorId::Str(s) => s,
                    };
                    (device, id)
                })
                .collect(),
        )
    }
}

impl SensorMap {
    pub fn sensor_for(&self, device_id: &str) -> Option<&str> {
        self.0.get(device_id).map(String::as_str)
    }

    pub fn insert(&mut self, device_id: impl Into<String>, sensor_id: impl Into<String>) {
        self.0.insert(device_id.into(), sensor_id.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<D: Into<String>, S: Into<String>> FromIterator<(D, S)> for SensorMap {
    fn from_iter<I: IntoIterator<Item = (D, S)>>(iter: I) -> Self {
        let mut map = SensorMap::default();
        for (device, sensor) in iter {
            map.insert(device, sensor);
        }
        map
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_format() -> String {
    "pretty".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    60
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.batch_size == 0 {
        bail!("pipeline.batch_size must be > 0");
    }

    if config.poll.interval_secs == 0 {
        bail!("poll.interval_secs must be > 0");
    }

    if config.api.base_url.trim().is_empty() {
        bail!("api.base_url must not be empty");
    }

    match config.storage.kind.as_str() {
        "s3" => match &config.storage.s3 {
            Some(s3) if s3.bucket.trim().is_empty() => bail!("storage.s3.bucket must not be empty"),
            Some(_) => {}
            None => bail!("storage.kind is 's3' but [storage.s3] is missing"),
        },
        "local" => {
            if config.storage.local.is_none() {
                bail!("storage.kind is 'local' but [storage.local] is missing");
            }
        }
        other => bail!(
            "Unknown storage kind: '{}'. Must be s3 or local.",
            other
        ),
    }

    if config.storage.include_globs.is_empty() {
        bail!("storage.include_globs must name at least one pattern");
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => bail!(
            "Unknown logging format: '{}'. Must be pretty or json.",
            other
        ),
    }

    Ok(())
}
