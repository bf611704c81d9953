// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Launch history persisted across runs in `app_state.json`.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use loom_crash_core::{AppContext, QueueError};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const APP_STATE_FILE: &str = "app_state.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppState {
	pub launches_since_last_crash: u64,
	pub sessions_since_last_crash: u64,
	/// Whether the run before this one ended in a captured crash.
	pub crashed_last_launch: bool,
	/// Set by the capture path; becomes `crashed_last_launch` on the next launch.
	#[serde(default)]
	pub crashed_this_launch: bool,
}

pub struct AppStateStore {
	path: PathBuf,
	state: Mutex<AppState>,
}

impl AppStateStore {
	/// Load the state left by previous runs. An unreadable file starts fresh.
	pub fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
		let path = path.into();
		let state = match fs::read(&path) {
			Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
				warn!(path = %path.display(), error = %e, "app state unreadable, starting fresh");
				AppState::default()
			}),
			Err(e) if e.kind() == ErrorKind::NotFound => AppState::default(),
			Err(e) => return Err(e.into()),
		};

		Ok(Self {
			path,
			state: Mutex::new(state),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Roll the previous run's crash flag forward and count this launch.
	pub fn record_launch(&self) -> Result<AppState, QueueError> {
		self.update(|state| {
			state.crashed_last_launch = state.crashed_this_launch;
			state.crashed_this_launch = false;
			if state.crashed_last_launch {
				state.launches_since_last_crash = 0;
				state.sessions_since_last_crash = 0;
			}
			state.launches_since_last_crash += 1;
			state.sessions_since_last_crash += 1;
		})
	}

	/// Count a new reporter session within the current launch.
	pub fn record_session(&self) -> Result<AppState, QueueError> {
		self.update(|state| state.sessions_since_last_crash += 1)
	}

	/// Called from the capture worker after a critical report was queued.
	pub fn record_crash(&self) -> Result<AppState, QueueError> {
		self.update(|state| state.crashed_this_launch = true)
	}

	pub fn current(&self) -> AppState {
		*self
			.state
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	/// Non-blocking read for the capture path.
	pub fn try_context(&self) -> Option<AppContext> {
		let state = *self.state.try_lock().ok()?;
		Some(AppContext {
			launches_since_last_crash: state.launches_since_last_crash,
			sessions_since_last_crash: state.sessions_since_last_crash,
			crashed_last_launch: state.crashed_last_launch,
			..Default::default()
		})
	}

	fn update(&self, f: impl FnOnce(&mut AppState)) -> Result<AppState, QueueError> {
		let mut state = self
			.state
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		f(&mut state);
		self.persist(&state)?;
		Ok(*state)
	}

	fn persist(&self, state: &AppState) -> Result<(), QueueError> {
		let bytes = serde_json::to_vec_pretty(state)?;
		let temp_path = self.path.with_extension("json.tmp");

		{
			let mut opts = OpenOptions::new();
			opts.write(true).create(true).truncate(true);
			#[cfg(unix)]
			opts.mode(0o600);
			let mut file = opts.open(&temp_path)?;
			file.write_all(&bytes)?;
			file.sync_all()?;
		}

		fs::rename(&temp_path, &self.path)?;
		Ok(())
	}
}
