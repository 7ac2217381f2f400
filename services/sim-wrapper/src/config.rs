use std::{net::SocketAddr, time::Duration};

use config::{ConfigError, Environment, File};
use redact::Secret;
use redact::serde::redact_secret;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub redis_url: String,
    pub api: Option<ApiConfig>,
    pub backend: BackendConfig,
    #[serde(default)]
    pub tiling: TilingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "RetryConfig::lease")]
    pub lease: RetryConfig,
    #[serde(default = "RetryConfig::poll")]
    pub poll: RetryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApiConfig {
    pub address: SocketAddr,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BackendConfig {
    pub url: String,
    pub username: String,
    #[serde(serialize_with = "redact_secret")]
    pub password: Secret<String>,
}

/// Geometry of the simulation grid. All lengths are metres in the projected
/// CRS selected by `utm_zone` / `northern`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TilingConfig {
    /// Edge length of the area one backend project can simulate.
    pub tile_size: f64,
    /// Unreliable ring around each tile that is simulated and then cropped.
    pub buffer: f64,
    pub resolution: u32,
    pub utm_zone: u8,
    pub northern: bool,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            tile_size: 500.0,
            buffer: 100.0,
            resolution: 10,
            utm_zone: 32,
            northern: true,
        }
    }
}

impl TilingConfig {
    /// Edge length of the full simulated square, buffer included.
    pub fn simulated_size(&self) -> f64 {
        self.tile_size + 2.0 * self.buffer
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tile_size.is_finite() && self.tile_size > 0.0) {
            return Err(ConfigError::Message(format!(
                "tiling.tile_size must be a positive length, got {}",
                self.tile_size
            )));
        }
        if !(self.buffer.is_finite() && self.buffer >= 0.0) {
            return Err(ConfigError::Message(format!(
                "tiling.buffer must not be negative, got {}",
                self.buffer
            )));
        }
        if self.resolution == 0 {
            return Err(ConfigError::Message(
                "tiling.resolution must be at least 1".to_string(),
            ));
        }
        if !(1..=60).contains(&self.utm_zone) {
            return Err(ConfigError::Message(format!(
                "tiling.utm_zone must be in 1..=60, got {}",
                self.utm_zone
            )));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CacheConfig {
    pub key_prefix: String,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    pub ttl: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    pub job_ttl: Duration,
}

const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "infrared_simulations".to_string(),
            ttl: THIRTY_DAYS,
            job_ttl: THIRTY_DAYS,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    pub initial: Duration,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    pub max: Duration,
}

impl RetryConfig {
    pub fn lease() -> Self {
        Self {
            attempts: 5,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }

    pub fn poll() -> Self {
        Self {
            attempts: 30,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PoolConfig {
    pub min_idle: usize,
    pub project_prefix: String,
    #[serde_as(as = "serde_with::DurationSecondsWithFrac<f64>")]
    pub interval: Duration,
    /// South-west corner given to newly provisioned projects. Only its size
    /// matters to the pipeline, geometry is always sent in local coordinates.
    pub south_west_lat: f64,
    pub south_west_lon: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 10,
            project_prefix: "CUT".to_string(),
            interval: Duration::from_secs(300),
            south_west_lat: 53.5399,
            south_west_lon: 10.0052,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tiles simulated at once across all jobs.
    pub concurrency: usize,
    /// Geometry objects per backend request.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 10,
        }
    }
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(File::with_name("./config.toml").required(false))
            .add_source(File::with_name("/etc/sim-wrapper/config.toml").required(false))
            .add_source(Environment::with_prefix("SIM_WRAPPER").separator("__"))
            .build()?
            .try_deserialize()?;
        config.tiling.validate()?;
        Ok(config)
    }
}
