// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Upload wire format.

use serde::Serialize;

use crate::fingerprint::{compute_fingerprint, find_culprit};
use crate::report::CrashReport;

pub const ENVELOPE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdkInfo {
	pub name: String,
	pub version: String,
}

impl SdkInfo {
	pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			version: version.into(),
		}
	}
}

/// Body of `POST /api/crash/reports`.
#[derive(Debug, Serialize)]
pub struct ReportEnvelope<'a> {
	pub format_version: u32,
	pub sdk: &'a SdkInfo,
	pub fingerprint: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub culprit: Option<String>,
	pub report: &'a CrashReport,
}

impl<'a> ReportEnvelope<'a> {
	pub fn new(sdk: &'a SdkInfo, report: &'a CrashReport) -> Self {
		Self {
			format_version: ENVELOPE_FORMAT_VERSION,
			sdk,
			fingerprint: compute_fingerprint(report),
			culprit: find_culprit(report),
			report,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::report::{CrashReportDraft, FaultKind};

	#[test]
	fn envelope_carries_report_and_fingerprint() {
		let sdk = SdkInfo::new("loom-crash", "0.1.0");
		let report = CrashReportDraft::new(FaultKind::Panic {
			message: "index out of bounds".into(),
			location: Some("src/main.rs:10:5".into()),
		})
		.finish();

		let json = serde_json::to_value(ReportEnvelope::new(&sdk, &report)).unwrap();
		assert_eq!(json["format_version"], ENVELOPE_FORMAT_VERSION);
		assert_eq!(json["sdk"]["name"], "loom-crash");
		assert_eq!(json["fingerprint"].as_str().unwrap().len(), 64);
		assert_eq!(json["report"]["id"], report.id().to_string());
		assert_eq!(json["report"]["fault"]["type"], "panic");
		assert!(json.get("culprit").is_none());
	}
}
