//! C5 — layered configuration with hot reload. Fields split per §4.5: the
//! live-reloadable set lives behind an `ArcSwap` so readers never take a
//! lock; fields fixed at startup are captured once into a plain `Arc` that
//! is never replaced.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::RecommendedWatcher;
use notify_debouncer_full::{Debouncer, FileIdMap, DebounceEventResult, new_debouncer};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	Read {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},
	#[error("failed to parse config file {path}: {source}")]
	Parse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
	#[error("failed to watch config directory: {0}")]
	Watch(#[from] notify::Error),
}

/// Fields read once at process startup and never replaced, per §4.5.
#[derive(Debug, Clone)]
pub struct StartupConfig {
	pub listen_addr: String,
	pub data_dir: PathBuf,
	pub pool_server_mode: bool,
	pub config_path: PathBuf,
}

/// Fields the file watcher may hot-swap in place, per §4.5's explicit list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
	#[serde(default)]
	pub api_keys: Vec<String>,
	#[serde(default)]
	pub debug: bool,
	#[serde(default = "default_use_cooldown_secs")]
	pub use_cooldown_secs: i64,
	#[serde(default = "default_max_fail")]
	pub max_fail: u32,
	#[serde(default = "default_daily_limit")]
	pub daily_limit: u64,
	#[serde(default)]
	pub browser_refresh_enabled: bool,
	#[serde(default)]
	pub external_refresh_mode: bool,
	#[serde(default)]
	pub registrar_url: Option<String>,
	#[serde(default)]
	pub mail_channel_order: Vec<String>,
	#[serde(default)]
	pub auto_delete_on_401: bool,
}

fn default_use_cooldown_secs() -> i64 {
	60
}
fn default_max_fail() -> u32 {
	5
}
fn default_daily_limit() -> u64 {
	1000
}

impl Default for LiveConfig {
	fn default() -> Self {
		LiveConfig {
			api_keys: Vec::new(),
			debug: false,
			use_cooldown_secs: default_use_cooldown_secs(),
			max_fail: default_max_fail(),
			daily_limit: default_daily_limit(),
			browser_refresh_enabled: false,
			external_refresh_mode: false,
			registrar_url: None,
			mail_channel_order: Vec::new(),
			auto_delete_on_401: false,
		}
	}
}

/// The on-disk/env-overridable shape; merges over [`LiveConfig::default`]
/// and is itself overridden field-by-field by environment variables.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
	#[serde(default)]
	listen_addr: Option<String>,
	#[serde(default)]
	data_dir: Option<String>,
	#[serde(default)]
	pool_server_mode: Option<bool>,
	#[serde(flatten)]
	live: PartialLive,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartialLive {
	#[serde(default)]
	api_keys: Option<Vec<String>>,
	#[serde(default)]
	debug: Option<bool>,
	#[serde(default)]
	use_cooldown_secs: Option<i64>,
	#[serde(default)]
	max_fail: Option<u32>,
	#[serde(default)]
	daily_limit: Option<u64>,
	#[serde(default)]
	browser_refresh_enabled: Option<bool>,
	#[serde(default)]
	external_refresh_mode: Option<bool>,
	#[serde(default)]
	registrar_url: Option<String>,
	#[serde(default)]
	mail_channel_order: Option<Vec<String>>,
	#[serde(default)]
	auto_delete_on_401: Option<bool>,
}

pub struct Config {
	pub startup: Arc<StartupConfig>,
	pub live: Arc<ArcSwap<LiveConfig>>,
}

impl Config {
	/// Load defaults → file → environment, in that order (§4.5, §6 env list).
	pub fn load(config_path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let config_path = config_path.as_ref().to_path_buf();
		let file_cfg = read_file_config(&config_path)?;

		let mut live = LiveConfig::default();
		apply_file(&mut live, &file_cfg);
		apply_env(&mut live);

		let listen_addr = std::env::var("LISTEN_ADDR")
			.ok()
			.or(file_cfg.listen_addr.clone())
			.unwrap_or_else(|| "0.0.0.0:8080".to_string());
		let data_dir = std::env::var("DATA_DIR")
			.ok()
			.or(file_cfg.data_dir.clone())
			.unwrap_or_else(|| "./data".to_string());
		let pool_server_mode = file_cfg.pool_server_mode.unwrap_or(false);

		Ok(Config {
			startup: Arc::new(StartupConfig {
				listen_addr,
				data_dir: PathBuf::from(data_dir),
				pool_server_mode,
				config_path,
			}),
			live: Arc::new(ArcSwap::new(Arc::new(live))),
		})
	}

	/// Spawn the debounced file watcher; hot-reloadable fields are swapped
	/// into `self.live` in place. Returns the debouncer so the caller can
	/// keep it alive for the process lifetime.
	pub fn watch(&self) -> Result<Debouncer<RecommendedWatcher, FileIdMap>, ConfigError> {
		let live = Arc::clone(&self.live);
		let path = self.startup.config_path.clone();
		let watch_path = path.clone();

		let mut debouncer = new_debouncer(
			Duration::from_millis(500),
			None,
			move |result: DebounceEventResult| match result {
				Ok(_events) => match read_file_config(&path) {
					Ok(file_cfg) => {
						let mut next = (**live.load()).clone();
						apply_file(&mut next, &file_cfg);
						apply_env(&mut next);
						live.store(Arc::new(next));
						info!("config hot-reloaded");
					},
					Err(e) => warn!(error = %e, "config reload failed, keeping previous live config"),
				},
				Err(errors) => {
					for e in errors {
						error!(error = %e, "config watcher error");
					}
				},
			},
		)?;
		debouncer
			.watcher()
			.watch(&watch_path, notify::RecursiveMode::NonRecursive)?;
		Ok(debouncer)
	}
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
	if !path.exists() {
		return Ok(FileConfig::default());
	}
	let bytes = fs_err::read(path).map_err(|source| ConfigError::Read {
		path: path.to_path_buf(),
		source: source.into(),
	})?;
	serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
		path: path.to_path_buf(),
		source,
	})
}

fn apply_file(live: &mut LiveConfig, file_cfg: &FileConfig) {
	let p = &file_cfg.live;
	if let Some(v) = &p.api_keys {
		live.api_keys = v.clone();
	}
	if let Some(v) = p.debug {
		live.debug = v;
	}
	if let Some(v) = p.use_cooldown_secs {
		live.use_cooldown_secs = v;
	}
	if let Some(v) = p.max_fail {
		live.max_fail = v;
	}
	if let Some(v) = p.daily_limit {
		live.daily_limit = v;
	}
	if let Some(v) = p.browser_refresh_enabled {
		live.browser_refresh_enabled = v;
	}
	if let Some(v) = p.external_refresh_mode {
		live.external_refresh_mode = v;
	}
	if let Some(v) = &p.registrar_url {
		live.registrar_url = Some(v.clone());
	}
	if let Some(v) = &p.mail_channel_order {
		live.mail_channel_order = v.clone();
	}
	if let Some(v) = p.auto_delete_on_401 {
		live.auto_delete_on_401 = v;
	}
}

/// `API_KEYS` (comma-separated) overrides the whole list; `API_KEY` appends
/// one more entry (§6).
fn apply_env(live: &mut LiveConfig) {
	if let Ok(keys) = std::env::var("API_KEYS") {
		live.api_keys = keys.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
	}
	if let Ok(key) = std::env::var("API_KEY") {
		live.api_keys.push(key);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_file_falls_back_to_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = Config::load(dir.path().join("missing.json")).unwrap();
		let live = cfg.live.load();
		assert_eq!(live.max_fail, default_max_fail());
	}

	#[test]
	fn file_overrides_defaults_and_env_overrides_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		fs_err::write(&path, r#"{"maxFail": 9, "apiKeys": ["from-file"]}"#).unwrap();

		// SAFETY: tests run single-threaded enough for this narrow env scope;
		// guarded by not asserting across other tests' env state.
		unsafe {
			std::env::set_var("API_KEYS", "from-env-1,from-env-2");
		}
		let cfg = Config::load(&path).unwrap();
		unsafe {
			std::env::remove_var("API_KEYS");
		}

		let live = cfg.live.load();
		assert_eq!(live.max_fail, 9);
		assert_eq!(live.api_keys, vec!["from-env-1", "from-env-2"]);
	}
}
