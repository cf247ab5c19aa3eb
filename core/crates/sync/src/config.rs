//! Sync configuration

use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const SYNC_CONFIG_NAME: &str = "sync.json";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("config I/O error at '{}': {source}", .path.display())]
	Io {
		path: Box<Path>,
		#[source]
		source: std::io::Error,
	},
	#[error("malformed sync config: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("sync config version {0} is newer than supported")]
	UnsupportedVersion(u32),
}

impl ConfigError {
	fn io(path: &Path, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}
}

/// Retry delays of the fetch scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
	pub initial_ms: u64,
	pub max_ms: u64,
	pub multiplier: u32,
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			initial_ms: 1_000,
			max_ms: 60_000,
			multiplier: 2,
		}
	}
}

impl BackoffConfig {
	/// Delay before retrying after `failures` consecutive failed fetches.
	#[must_use]
	pub fn delay(&self, failures: u32) -> Duration {
		let factor = u64::from(self.multiplier).saturating_pow(failures.saturating_sub(1));

		Duration::from_millis(self.initial_ms.saturating_mul(factor).min(self.max_ms))
	}
}

/// Main sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
	/// Config schema version
	pub version: u32,

	/// Base URL of the transform sequencer
	pub api_url: String,

	/// Transforms requested per page
	#[serde(default = "default_batch_size")]
	pub batch_size: u32,

	#[serde(default)]
	pub backoff: BackoffConfig,

	/// Idle re-poll interval when caught up
	#[serde(default = "default_poll_interval_secs")]
	pub poll_interval_secs: u64,

	#[serde(skip)]
	data_dir: PathBuf,
}

const fn default_batch_size() -> u32 {
	100
}

const fn default_poll_interval_secs() -> u64 {
	60
}

impl SyncConfig {
	pub const fn target_version() -> u32 {
		1
	}

	/// Create default configuration with specific data directory
	pub fn default_with_dir(data_dir: impl Into<PathBuf>) -> Self {
		Self {
			version: Self::target_version(),
			api_url: "http://localhost:8080".to_string(),
			batch_size: default_batch_size(),
			backoff: BackoffConfig::default(),
			poll_interval_secs: default_poll_interval_secs(),
			data_dir: data_dir.into(),
		}
	}

	/// Load configuration from a specific data directory, writing defaults if there is none
	pub fn load_from(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let data_dir = data_dir.as_ref();
		let config_path = data_dir.join(SYNC_CONFIG_NAME);

		match fs::read_to_string(&config_path) {
			Ok(json) => {
				info!(path = %config_path.display(), "Loading sync config;");
				let mut config: Self = serde_json::from_str(&json)?;

				if config.version > Self::target_version() {
					return Err(ConfigError::UnsupportedVersion(config.version));
				}

				config.data_dir = data_dir.to_path_buf();
				Ok(config)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				warn!(path = %config_path.display(), "No sync config found, creating default;");
				let config = Self::default_with_dir(data_dir);
				config.save()?;
				Ok(config)
			}
			Err(e) => Err(ConfigError::io(&config_path, e)),
		}
	}

	/// Save configuration to disk
	pub fn save(&self) -> Result<(), ConfigError> {
		fs::create_dir_all(&self.data_dir).map_err(|e| ConfigError::io(&self.data_dir, e))?;

		let config_path = self.config_path();
		fs::write(&config_path, serde_json::to_string_pretty(self)?)
			.map_err(|e| ConfigError::io(&config_path, e))?;

		info!(path = %config_path.display(), "Saved sync config;");
		Ok(())
	}

	#[must_use]
	pub fn config_path(&self) -> PathBuf {
		self.data_dir.join(SYNC_CONFIG_NAME)
	}

	/// Where the sync database lives
	#[must_use]
	pub fn database_path(&self) -> PathBuf {
		self.data_dir.join("sync.db")
	}

	#[must_use]
	pub const fn poll_interval(&self) -> Duration {
		Duration::from_secs(self.poll_interval_secs)
	}
}
