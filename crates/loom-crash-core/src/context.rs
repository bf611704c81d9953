// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process context attached to each report (OS, device, application).

use serde::{Deserialize, Serialize};

/// Operating system at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OsContext {
	/// "linux", "macos", "windows"
	pub name: Option<String>,
	/// Kernel release, e.g. "6.8.0-45-generic".
	pub version: Option<String>,
	/// Full kernel version string.
	pub build: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceContext {
	pub hostname: Option<String>,
	pub arch: Option<String>,
	pub cpu_count: Option<u32>,
}

/// The host application and its launch history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppContext {
	pub process_name: Option<String>,
	pub process_id: Option<u32>,
	pub executable: Option<String>,
	/// Version of the SDK that captured the report.
	pub sdk_version: Option<String>,
	#[serde(default)]
	pub launches_since_last_crash: u64,
	#[serde(default)]
	pub sessions_since_last_crash: u64,
	#[serde(default)]
	pub crashed_last_launch: bool,
}
