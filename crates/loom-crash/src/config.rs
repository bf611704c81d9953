// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reporter configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use zeroize::Zeroize;

use crate::error::{CrashSdkError, Result};
use crate::queue::QueueConfig;
use crate::upload::UploadConfig;

pub const DEFAULT_BASE_URL: &str = "https://loom.ghuntley.com";
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_FOOTPRINTS: usize = 100;

pub const ENV_API_KEY: &str = "LOOM_CRASH_API_KEY";
pub const ENV_BASE_URL: &str = "LOOM_CRASH_BASE_URL";
pub const ENV_STORAGE_DIR: &str = "LOOM_CRASH_STORAGE_DIR";

const REDACTED: &str = "[REDACTED]";

/// API key for the collection endpoint.
///
/// Zeroed on drop; `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq, Zeroize)]
#[zeroize(drop)]
pub struct ApiKey(String);

impl ApiKey {
	pub fn new(key: impl Into<String>) -> Result<Self> {
		let key = key.into();
		if key.is_empty() || key.chars().any(|c| c.is_whitespace() || c.is_control()) {
			return Err(CrashSdkError::InvalidApiKey);
		}
		Ok(Self(key))
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("ApiKey").field(&REDACTED).finish()
	}
}

impl fmt::Display for ApiKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(REDACTED)
	}
}

/// Which fault monitors are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Monitors {
	/// Fatal signals (unix only).
	pub signals: bool,
	pub panics: bool,
}

impl Default for Monitors {
	fn default() -> Self {
		Self {
			signals: cfg!(unix),
			panics: true,
		}
	}
}

impl Monitors {
	pub fn none() -> Self {
		Self {
			signals: false,
			panics: false,
		}
	}
}

/// Where addresses are turned into function/file/line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymbolicationMode {
	/// Resolve in-process using the binary's debug info.
	#[default]
	Local,
	/// Ship raw addresses and binary images; the server symbolicates.
	Deferred,
}

/// Full reporter configuration.
#[derive(Debug, Clone)]
pub struct CrashConfig {
	pub api_key: Option<ApiKey>,
	pub base_url: String,
	/// Defaults to `$XDG_DATA_HOME/loom-crash`.
	pub storage_dir: Option<PathBuf>,
	pub queue: QueueConfig,
	pub upload: UploadConfig,
	pub monitors: Monitors,
	pub symbolication: SymbolicationMode,
	pub handoff_timeout: Duration,
	/// Upload reports left by previous runs in the background on start.
	pub flush_on_start: bool,
	pub max_footprints: usize,
}

impl Default for CrashConfig {
	fn default() -> Self {
		Self {
			api_key: None,
			base_url: DEFAULT_BASE_URL.to_string(),
			storage_dir: None,
			queue: QueueConfig::default(),
			upload: UploadConfig::default(),
			monitors: Monitors::default(),
			symbolication: SymbolicationMode::default(),
			handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
			flush_on_start: true,
			max_footprints: DEFAULT_MAX_FOOTPRINTS,
		}
	}
}

impl CrashConfig {
	/// Defaults overridden by `LOOM_CRASH_API_KEY` (or `LOOM_CRASH_API_KEY_FILE`),
	/// `LOOM_CRASH_BASE_URL` and `LOOM_CRASH_STORAGE_DIR`.
	pub fn from_env() -> Result<Self> {
		let mut config = Self::from_env_without_key();
		if let Some(key) = load_secret_env(ENV_API_KEY)? {
			config.api_key = Some(ApiKey::new(key)?);
		}
		Ok(config)
	}

	/// Like [`CrashConfig::from_env`] for a caller that supplies the key
	/// itself; the key variables are not read.
	pub fn from_env_without_key() -> Self {
		let mut config = Self::default();
		if let Some(url) = non_empty_var(ENV_BASE_URL) {
			config.base_url = url;
		}
		if let Some(dir) = non_empty_var(ENV_STORAGE_DIR) {
			config.storage_dir = Some(PathBuf::from(dir));
		}
		config
	}

	/// Configured storage directory, or the per-user default.
	pub fn resolve_storage_dir(&self) -> Result<PathBuf> {
		match &self.storage_dir {
			Some(dir) => Ok(dir.clone()),
			None => default_storage_dir().ok_or(CrashSdkError::NoStorageDirectory),
		}
	}
}

pub fn default_storage_dir() -> Option<PathBuf> {
	dirs::data_local_dir().map(|dir| dir.join("loom-crash"))
}

fn non_empty_var(var: &str) -> Option<String> {
	env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// `VAR_FILE` takes precedence over `VAR`. One trailing newline is stripped
/// from file contents.
fn load_secret_env(var: &str) -> Result<Option<String>> {
	let file_var = format!("{var}_FILE");

	if let Ok(path) = env::var(&file_var) {
		if path.is_empty() {
			return Err(CrashSdkError::Environment {
				var: file_var,
				reason: "path is empty".to_string(),
			});
		}
		let mut contents = fs::read_to_string(&path).map_err(|e| CrashSdkError::Environment {
			var: file_var.clone(),
			reason: format!("{path}: {e}"),
		})?;
		if contents.ends_with('\n') {
			contents.pop();
			if contents.ends_with('\r') {
				contents.pop();
			}
		}
		return Ok(Some(contents));
	}

	Ok(non_empty_var(var))
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use std::sync::Mutex;

	// Environment variables are process-global.
	pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

	pub(crate) fn clear_env() {
		for var in [ENV_API_KEY, ENV_BASE_URL, ENV_STORAGE_DIR] {
			env::remove_var(var);
			env::remove_var(format!("{var}_FILE"));
		}
	}

	#[test]
	fn api_key_is_redacted() {
		let key = ApiKey::new("key123").unwrap();
		assert_eq!(format!("{key}"), REDACTED);
		assert!(!format!("{key:?}").contains("key123"));
		assert_eq!(key.expose(), "key123");
	}

	#[test]
	fn api_key_rejects_empty_and_whitespace() {
		assert!(matches!(ApiKey::new(""), Err(CrashSdkError::InvalidApiKey)));
		assert!(matches!(
			ApiKey::new("key 123"),
			Err(CrashSdkError::InvalidApiKey)
		));
		assert!(matches!(
			ApiKey::new("key123\n"),
			Err(CrashSdkError::InvalidApiKey)
		));
	}

	#[test]
	fn defaults() {
		let config = CrashConfig::default();
		assert_eq!(config.base_url, DEFAULT_BASE_URL);
		assert_eq!(config.handoff_timeout, Duration::from_secs(5));
		assert_eq!(config.max_footprints, 100);
		assert!(config.flush_on_start);
		assert!(config.monitors.panics);
		assert_eq!(config.symbolication, SymbolicationMode::Local);
	}

	#[test]
	fn from_env_reads_variables() {
		let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		clear_env();
		env::set_var(ENV_API_KEY, "key123");
		env::set_var(ENV_BASE_URL, "http://127.0.0.1:9000");
		env::set_var(ENV_STORAGE_DIR, "/tmp/loom-crash-test");

		let config = CrashConfig::from_env().unwrap();
		clear_env();

		assert_eq!(config.api_key.unwrap().expose(), "key123");
		assert_eq!(config.base_url, "http://127.0.0.1:9000");
		assert_eq!(
			config.storage_dir,
			Some(PathBuf::from("/tmp/loom-crash-test"))
		);
	}

	#[test]
	fn from_env_prefers_key_file() {
		let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		clear_env();
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("api_key");
		fs::write(&path, "from-file\n").unwrap();
		env::set_var(ENV_API_KEY, "from-env");
		env::set_var(format!("{ENV_API_KEY}_FILE"), &path);

		let config = CrashConfig::from_env().unwrap();
		clear_env();

		assert_eq!(config.api_key.unwrap().expose(), "from-file");
	}

	#[test]
	fn from_env_without_variables_uses_defaults() {
		let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		clear_env();

		let config = CrashConfig::from_env().unwrap();
		assert!(config.api_key.is_none());
		assert_eq!(config.base_url, DEFAULT_BASE_URL);
		assert!(config.storage_dir.is_none());
	}

	#[test]
	fn key_variables_are_skipped_without_key() {
		let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
		clear_env();
		env::set_var(ENV_API_KEY, "has space");
		env::set_var(ENV_BASE_URL, "http://127.0.0.1:9000");

		let strict = CrashConfig::from_env();
		let config = CrashConfig::from_env_without_key();
		clear_env();

		assert!(matches!(strict, Err(CrashSdkError::InvalidApiKey)));
		assert!(config.api_key.is_none());
		assert_eq!(config.base_url, "http://127.0.0.1:9000");
	}

	#[test]
	fn explicit_storage_dir_wins() {
		let config = CrashConfig {
			storage_dir: Some(PathBuf::from("/var/lib/app/crashes")),
			..Default::default()
		};
		assert_eq!(
			config.resolve_storage_dir().unwrap(),
			PathBuf::from("/var/lib/app/crashes")
		);
	}
}
