// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom crash capture SDK.
//!
//! This crate provides the types shared between the fault path, the durable
//! queue and the uploader of `loom-crash`:
//!
//! - [`CrashReport`]: the immutable record produced for every intercepted
//!   fault, built through [`CrashReportDraft`]
//! - [`QueueEntry`] and [`DeliveryState`]: a report plus its delivery state
//!   while it is owned by the durable queue
//! - [`ReportEnvelope`]: the upload wire format
//! - [`CaptureError`] and [`QueueError`]: the capture and storage halves of
//!   the error taxonomy
//! - [`compute_fingerprint`]: grouping key sent alongside each report

pub mod context;
pub mod entry;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod footprint;
pub mod report;

pub use context::{AppContext, DeviceContext, OsContext};
pub use entry::{DeliveryState, QueueEntry};
pub use envelope::{ReportEnvelope, SdkInfo, ENVELOPE_FORMAT_VERSION};
pub use error::{CaptureError, ParseError, QueueError};
pub use fingerprint::{compute_fingerprint, find_culprit, truncate};
pub use footprint::Footprint;
pub use report::{
	BinaryImage, CrashReport, CrashReportDraft, FaultKind, Severity, StackFrame, ThreadSnapshot,
};

use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier of a crash report.
///
/// Assigned once when the report is built and used to deduplicate uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ReportId(pub Uuid);

impl ReportId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for ReportId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ReportId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for ReportId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}
