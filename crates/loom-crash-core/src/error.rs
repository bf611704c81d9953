// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Capture and storage errors.

use std::path::PathBuf;

use thiserror::Error;

/// Degradations of a single capture.
///
/// These lower the quality of a report. They never prevent the process from
/// terminating.
#[derive(Debug, Error)]
pub enum CaptureError {
	#[error("failed to install handler for {target}: {reason}")]
	HandlerInstall { target: String, reason: String },

	#[error("capture worker did not acknowledge within {timeout_ms}ms")]
	HandoffTimeout { timeout_ms: u64 },

	#[error("stack truncated at {captured} frames")]
	TruncatedStack { captured: usize },

	#[error("context unavailable: {0}")]
	ContextUnavailable(&'static str),

	#[error("thread enumeration failed: {0}")]
	ThreadEnumeration(String),

	#[error("symbolication failed: {0}")]
	Symbolication(String),

	#[error("failed to persist report: {0}")]
	Persist(#[from] QueueError),
}

/// Errors of the durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("storage full: entry of {needed} bytes exceeds budget of {budget} bytes")]
	StorageFull { needed: u64, budget: u64 },

	#[error("corrupt entry {path}: {reason}")]
	CorruptEntry { path: PathBuf, reason: String },

	#[error("unsupported record format version {found} (supported: {supported})")]
	UnsupportedVersion { found: u32, supported: u32 },

	#[error("queue entry not found: {0}")]
	NotFound(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}

impl QueueError {
	/// Recoverable errors are logged and skipped; the queue keeps working.
	pub fn is_recoverable(&self) -> bool {
		matches!(
			self,
			Self::StorageFull { .. } | Self::CorruptEntry { .. } | Self::UnsupportedVersion { .. }
		)
	}
}

/// A string did not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseError {
	pub kind: &'static str,
	pub value: String,
}

impl ParseError {
	pub fn new(kind: &'static str, value: &str) -> Self {
		Self {
			kind,
			value: value.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn storage_full_and_corrupt_are_recoverable() {
		assert!(QueueError::StorageFull {
			needed: 10,
			budget: 5
		}
		.is_recoverable());
		assert!(QueueError::CorruptEntry {
			path: PathBuf::from("1-x.json"),
			reason: "checksum mismatch".into()
		}
		.is_recoverable());
		assert!(!QueueError::Io(std::io::Error::other("disk gone")).is_recoverable());
	}

	#[test]
	fn persist_wraps_queue_error() {
		let err: CaptureError = QueueError::NotFound("abc".into()).into();
		assert_eq!(
			err.to_string(),
			"failed to persist report: queue entry not found: abc"
		);
	}
}
