// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the crash SDK.

use std::time::Duration;

use loom_common_http::RetryableError;
use loom_crash_core::{CaptureError, QueueError};
use thiserror::Error;

/// Result type alias for host-facing crash SDK operations.
pub type Result<T> = std::result::Result<T, CrashSdkError>;

/// Errors returned to the host application.
#[derive(Debug, Error)]
pub enum CrashSdkError {
	/// The reporter has been shut down.
	#[error("crash reporter has been shut down")]
	ClientShutdown,

	/// Missing, empty or malformed API key.
	#[error("invalid API key format")]
	InvalidApiKey,

	#[error("invalid base URL: {0}")]
	InvalidBaseUrl(String),

	/// No storage directory configured and none could be derived.
	#[error("no storage directory available for crash reports")]
	NoStorageDirectory,

	#[error("failed to read {var}: {reason}")]
	Environment { var: String, reason: String },

	#[error("failed to install fault handlers: {0}")]
	Install(#[from] CaptureError),

	#[error("queue error: {0}")]
	Queue(#[from] QueueError),

	#[error("upload error: {0}")]
	Upload(#[from] UploadError),

	#[error("HTTP client error: {0}")]
	Http(#[from] reqwest::Error),
}

/// Errors of a single delivery attempt or of a flush.
#[derive(Debug, Error)]
pub enum UploadError {
	/// Network failure, timeout, 408, 429 or 5xx. Worth retrying.
	#[error("transient upload failure: {message}")]
	Transient {
		status: Option<u16>,
		message: String,
		retry_after: Option<Duration>,
	},

	/// The collection endpoint refused the API key (401/403).
	#[error("API key rejected by collection endpoint (status {status})")]
	AuthRejected { status: u16 },

	/// Any other 4xx: the report will never be accepted as sent.
	#[error("report rejected (status {status}): {message}")]
	PermanentReject { status: u16, message: String },

	#[error("flush timed out after {0:?}")]
	Timeout(Duration),

	#[error("queue error: {0}")]
	Queue(#[from] QueueError),

	#[error("uploader has been shut down")]
	Shutdown,
}

impl UploadError {
	/// Whether the entry that produced this error can never be delivered.
	pub fn is_permanent(&self) -> bool {
		matches!(self, Self::AuthRejected { .. } | Self::PermanentReject { .. })
	}
}

impl RetryableError for UploadError {
	fn is_retryable(&self) -> bool {
		matches!(self, Self::Transient { .. } | Self::Timeout(_))
	}

	fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::Transient { retry_after, .. } => *retry_after,
			_ => None,
		}
	}
}

impl From<reqwest::Error> for UploadError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_builder() {
			return Self::PermanentReject {
				status: 0,
				message: err.to_string(),
			};
		}

		Self::Transient {
			status: err.status().map(|s| s.as_u16()),
			message: err.to_string(),
			retry_after: None,
		}
	}
}
