//! Daemon configuration
//!
//! Loaded from a TOML file (default `~/.config/packrat/assist.toml`); every
//! field has a default so an absent or partial file is fine. The remote
//! server section, when present, is bootstrapped into the store at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const APP_NAME: &str = "packrat";
pub const CONFIG_FILE: &str = "assist.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub server: ServerSection,
	pub database: DatabaseSection,
	pub watcher: WatcherSection,
	pub uploader: UploaderSection,
	pub sha256: Sha256Section,
	pub activity: ActivitySection,
	/// Optional bootstrap credentials for the default remote server.
	/// The password is never logged.
	pub remote_server: Option<RemoteServerSection>,
}

/// Control plane bind address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
	pub host: String,
	pub port: u16,
}

impl Default for ServerSection {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: 8765,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
	pub path: PathBuf,
}

impl Default for DatabaseSection {
	fn default() -> Self {
		Self {
			path: default_data_dir().join("assist.db"),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
	pub enabled: bool,
	pub debounce_secs: u64,
}

impl Default for WatcherSection {
	fn default() -> Self {
		Self {
			enabled: true,
			debounce_secs: 2,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderSection {
	/// Worker count; 0 means `min(num_cpus, 8)`.
	pub parallel: usize,
	pub retry_attempts: u32,
	pub retry_delay_secs: u64,
	pub retry_delay_max_secs: u64,
	pub upload_timeout_secs: u64,
	/// Ship content, not just metadata, when the server asks for it.
	pub upload_content: bool,
}

impl Default for UploaderSection {
	fn default() -> Self {
		Self {
			parallel: 0,
			retry_attempts: 5,
			retry_delay_secs: 1,
			retry_delay_max_secs: 300,
			upload_timeout_secs: 3600,
			upload_content: true,
		}
	}
}

impl UploaderSection {
	pub fn effective_parallel(&self) -> usize {
		if self.parallel > 0 {
			return self.parallel;
		}
		std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(2)
			.min(8)
	}

	pub fn retry_delay(&self) -> Duration {
		Duration::from_secs(self.retry_delay_secs)
	}

	pub fn retry_delay_max(&self) -> Duration {
		Duration::from_secs(self.retry_delay_max_secs)
	}

	pub fn upload_timeout(&self) -> Duration {
		Duration::from_secs(self.upload_timeout_secs)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sha256Section {
	pub chunk_size: usize,
	/// Optional pause between chunks to bound disk/CPU pressure.
	pub chunk_sleep_ms: u64,
}

impl Default for Sha256Section {
	fn default() -> Self {
		Self {
			chunk_size: 1024 * 1024,
			chunk_sleep_ms: 0,
		}
	}
}

impl Sha256Section {
	pub fn chunk_sleep(&self) -> Option<Duration> {
		(self.chunk_sleep_ms > 0).then(|| Duration::from_millis(self.chunk_sleep_ms))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivitySection {
	pub max_events: u64,
	pub max_age_days: u64,
}

impl Default for ActivitySection {
	fn default() -> Self {
		Self {
			max_events: 10_000,
			max_age_days: 7,
		}
	}
}

impl ActivitySection {
	pub fn max_age(&self) -> Duration {
		Duration::from_secs(self.max_age_days * 24 * 3600)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteServerSection {
	pub name: String,
	pub url: String,
	pub username: String,
	pub password: String,
}

impl Config {
	/// Load from `path`, or from the default location when `None`. A missing
	/// file yields the defaults.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let path = path
			.map(PathBuf::from)
			.unwrap_or_else(default_config_path);
		if !path.exists() {
			info!("No config at {:?}, using defaults", path);
			return Ok(Self::default());
		}

		let raw = std::fs::read_to_string(&path)
			.with_context(|| format!("reading config {}", path.display()))?;
		let mut config: Config =
			toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
		config.database.path = expand_tilde(&config.database.path);
		info!("Loaded config from {:?}", path);
		Ok(config)
	}

	pub fn data_dir(&self) -> PathBuf {
		self.database
			.path
			.parent()
			.map(PathBuf::from)
			.unwrap_or_else(default_data_dir)
	}

	pub fn pid_file(&self) -> PathBuf {
		self.data_dir().join("assist.pid")
	}

	pub fn log_file(&self) -> PathBuf {
		self.data_dir().join("assist.log")
	}

	pub fn ensure_directories(&self) -> Result<()> {
		std::fs::create_dir_all(self.data_dir())?;
		Ok(())
	}
}

pub fn default_data_dir() -> PathBuf {
	dirs::data_local_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join(APP_NAME)
}

pub fn default_config_path() -> PathBuf {
	dirs::config_dir()
		.unwrap_or_else(|| PathBuf::from("."))
		.join(APP_NAME)
		.join(CONFIG_FILE)
}

fn expand_tilde(path: &Path) -> PathBuf {
	if let Ok(stripped) = path.strip_prefix("~") {
		if let Some(home) = dirs::home_dir() {
			return home.join(stripped);
		}
	}
	path.to_path_buf()
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn defaults_are_sane() {
		let config = Config::default();
		assert_eq!(config.server.port, 8765);
		assert_eq!(config.sha256.chunk_size, 1024 * 1024);
		assert!(config.sha256.chunk_sleep().is_none());
		assert!(config.uploader.effective_parallel() >= 1);
		assert!(config.uploader.effective_parallel() <= 8);
		assert!(config.remote_server.is_none());
	}

	#[test]
	fn partial_file_fills_in_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("assist.toml");
		std::fs::write(
			&path,
			r#"
[server]
port = 9000

[uploader]
parallel = 3

[remote_server]
name = "lab"
url = "http://lab.example:8000"
username = "me"
password = "hunter2"
"#,
		)
		.unwrap();

		let config = Config::load(Some(&path)).unwrap();
		assert_eq!(config.server.port, 9000);
		assert_eq!(config.server.host, "127.0.0.1");
		assert_eq!(config.uploader.effective_parallel(), 3);
		assert_eq!(config.watcher.debounce_secs, 2);
		assert_eq!(config.remote_server.unwrap().name, "lab");
	}
}
