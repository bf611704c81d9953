// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Crash report types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::context::{AppContext, DeviceContext, OsContext};
use crate::error::ParseError;
use crate::footprint::Footprint;
use crate::ReportId;

/// Severity of a report. Faults are always [`Severity::Crash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
	Info,
	Warning,
	Error,
	Crash,
}

impl fmt::Display for Severity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Info => write!(f, "info"),
			Self::Warning => write!(f, "warning"),
			Self::Error => write!(f, "error"),
			Self::Crash => write!(f, "crash"),
		}
	}
}

impl FromStr for Severity {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"info" => Ok(Self::Info),
			"warning" => Ok(Self::Warning),
			"error" => Ok(Self::Error),
			"crash" => Ok(Self::Crash),
			_ => Err(ParseError::new("severity", s)),
		}
	}
}

/// What was intercepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FaultKind {
	/// A fatal signal (illegal memory access, abort, ...).
	Signal {
		signal: i32,
		code: i32,
		/// e.g. "SIGSEGV"
		name: String,
		/// Faulting address from `siginfo_t`, if meaningful for the signal.
		#[serde(with = "hex_addr")]
		address: u64,
	},
	/// An unhandled language-level fault.
	Panic {
		message: String,
		/// `file:line:column`
		location: Option<String>,
	},
	/// An event logged explicitly by the host application.
	Reported { severity: Severity, message: String },
}

impl FaultKind {
	/// Critical reports are only evicted from the queue once no
	/// non-critical report is left.
	pub fn is_critical(&self) -> bool {
		!matches!(self, Self::Reported { .. })
	}

	pub fn severity(&self) -> Severity {
		match self {
			Self::Signal { .. } | Self::Panic { .. } => Severity::Crash,
			Self::Reported { severity, .. } => *severity,
		}
	}

	/// Short type name used for grouping, e.g. "SIGSEGV", "panic", "warning".
	pub fn type_name(&self) -> String {
		match self {
			Self::Signal { name, .. } => name.clone(),
			Self::Panic { .. } => "panic".to_string(),
			Self::Reported { severity, .. } => severity.to_string(),
		}
	}

	pub fn message(&self) -> String {
		match self {
			Self::Signal {
				name,
				code,
				address,
				..
			} => format!("{name} (code {code}) at {address:#x}"),
			Self::Panic { message, .. } => message.clone(),
			Self::Reported { message, .. } => message.clone(),
		}
	}
}

/// A single stack frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StackFrame {
	#[serde(with = "hex_addr")]
	pub instruction_addr: u64,
	#[serde(default, with = "hex_addr_opt", skip_serializing_if = "Option::is_none")]
	pub symbol_addr: Option<u64>,
	/// Demangled function name, if symbolicated.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub function: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub module: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filename: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lineno: Option<u32>,
	/// User code vs dependency / runtime.
	#[serde(default)]
	pub in_app: bool,
}

impl StackFrame {
	pub fn from_address(instruction_addr: u64) -> Self {
		Self {
			instruction_addr,
			..Default::default()
		}
	}

	pub fn is_symbolicated(&self) -> bool {
		self.function.is_some()
	}
}

/// One thread of the process at capture time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThreadSnapshot {
	pub index: u32,
	/// OS thread id.
	pub thread_id: u64,
	pub name: Option<String>,
	pub crashed: bool,
	/// The thread that ran the capture.
	pub current: bool,
	/// No stack was walked for this thread.
	pub backtrace_skipped: bool,
	pub frames: Vec<StackFrame>,
}

/// A loaded module, used for server-side symbolication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryImage {
	pub path: String,
	#[serde(with = "hex_addr")]
	pub start: u64,
	#[serde(with = "hex_addr")]
	pub end: u64,
	#[serde(with = "hex_addr")]
	pub offset: u64,
}

impl BinaryImage {
	pub fn contains(&self, address: u64) -> bool {
		address >= self.start && address < self.end
	}
}

/// A captured crash or logged event.
///
/// Reports are immutable: they are assembled through [`CrashReportDraft`]
/// and only read afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReport {
	id: ReportId,
	timestamp: DateTime<Utc>,
	fault: FaultKind,
	frames: Vec<StackFrame>,
	#[serde(default)]
	threads: Vec<ThreadSnapshot>,
	#[serde(default)]
	metadata: HashMap<String, String>,
	#[serde(default)]
	user_id: Option<String>,
	#[serde(default)]
	footprints: Vec<Footprint>,
	#[serde(default)]
	binary_images: Vec<BinaryImage>,
	#[serde(default)]
	os: OsContext,
	#[serde(default)]
	device: DeviceContext,
	#[serde(default)]
	app: AppContext,
	#[serde(default)]
	symbolicated: bool,
}

impl CrashReport {
	pub fn id(&self) -> ReportId {
		self.id
	}

	pub fn timestamp(&self) -> DateTime<Utc> {
		self.timestamp
	}

	pub fn fault(&self) -> &FaultKind {
		&self.fault
	}

	/// Frames of the crashed thread, innermost first.
	pub fn frames(&self) -> &[StackFrame] {
		&self.frames
	}

	pub fn threads(&self) -> &[ThreadSnapshot] {
		&self.threads
	}

	pub fn metadata(&self) -> &HashMap<String, String> {
		&self.metadata
	}

	pub fn user_id(&self) -> Option<&str> {
		self.user_id.as_deref()
	}

	pub fn footprints(&self) -> &[Footprint] {
		&self.footprints
	}

	pub fn binary_images(&self) -> &[BinaryImage] {
		&self.binary_images
	}

	pub fn os(&self) -> &OsContext {
		&self.os
	}

	pub fn device(&self) -> &DeviceContext {
		&self.device
	}

	pub fn app(&self) -> &AppContext {
		&self.app
	}

	/// Whether addresses were resolved in-process.
	pub fn is_symbolicated(&self) -> bool {
		self.symbolicated
	}

	pub fn is_critical(&self) -> bool {
		self.fault.is_critical()
	}
}

/// Mutable form of a [`CrashReport`] used while it is being assembled.
#[derive(Debug, Clone)]
pub struct CrashReportDraft {
	pub id: ReportId,
	pub timestamp: DateTime<Utc>,
	pub fault: FaultKind,
	pub frames: Vec<StackFrame>,
	pub threads: Vec<ThreadSnapshot>,
	pub metadata: HashMap<String, String>,
	pub user_id: Option<String>,
	pub footprints: Vec<Footprint>,
	pub binary_images: Vec<BinaryImage>,
	pub os: OsContext,
	pub device: DeviceContext,
	pub app: AppContext,
	pub symbolicated: bool,
}

impl CrashReportDraft {
	pub fn new(fault: FaultKind) -> Self {
		Self {
			id: ReportId::new(),
			timestamp: Utc::now(),
			fault,
			frames: Vec::new(),
			threads: Vec::new(),
			metadata: HashMap::new(),
			user_id: None,
			footprints: Vec::new(),
			binary_images: Vec::new(),
			os: OsContext::default(),
			device: DeviceContext::default(),
			app: AppContext::default(),
			symbolicated: false,
		}
	}

	pub fn finish(self) -> CrashReport {
		CrashReport {
			id: self.id,
			timestamp: self.timestamp,
			fault: self.fault,
			frames: self.frames,
			threads: self.threads,
			metadata: self.metadata,
			user_id: self.user_id,
			footprints: self.footprints,
			binary_images: self.binary_images,
			os: self.os,
			device: self.device,
			app: self.app,
			symbolicated: self.symbolicated,
		}
	}
}

/// Addresses travel as `0x`-prefixed hex strings so 64-bit values survive
/// JSON consumers that only have doubles.
mod hex_addr {
	use serde::{de::Error, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("{value:#x}"))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
		let s = String::deserialize(deserializer)?;
		parse(&s).map_err(D::Error::custom)
	}

	pub(super) fn parse(s: &str) -> Result<u64, String> {
		let digits = s
			.strip_prefix("0x")
			.or_else(|| s.strip_prefix("0X"))
			.unwrap_or(s);
		u64::from_str_radix(digits, 16).map_err(|e| format!("invalid address {s:?}: {e}"))
	}
}

mod hex_addr_opt {
	use serde::{de::Error, Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
		match value {
			Some(value) => serializer.serialize_str(&format!("{value:#x}")),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
		Option::<String>::deserialize(deserializer)?
			.map(|s| super::hex_addr::parse(&s).map_err(D::Error::custom))
			.transpose()
	}
}
