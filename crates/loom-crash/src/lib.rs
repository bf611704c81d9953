// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-process crash capture for Rust applications.
//!
//! Fatal signals and panics are intercepted, turned into a [`CrashReport`]
//! and written to a durable on-disk queue before the process dies. Queued
//! reports are uploaded on the next launch or on an explicit
//! [`CrashReporter::flush`].
//!
//! # Quick Start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // As early as possible. Keep the handle for the life of the process.
//!     let crash = loom_crash::start("your_api_key")?;
//!
//!     if crash.crashed_last_launch() {
//!         tracing::warn!("previous run crashed");
//!     }
//!
//!     crash.set_user_identifier(Some("user_123".to_string()));
//!     crash.set_attribute("server", Some("web-01".to_string()));
//!     crash.leave_footprint("startup complete");
//!
//!     // Recoverable errors
//!     if let Err(e) = risky_operation() {
//!         crash.log_error_object(&e)?;
//!     }
//!
//!     crash.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Components
//!
//! - **Interceptor**: signal handlers and a panic hook that write into a
//!   pre-allocated slot and hand it to a capture worker thread
//! - **Report builder**: symbolication, thread list, binary images and host
//!   context
//! - **Durable queue**: one checksummed file per report under
//!   `<storage_dir>/reports`
//! - **Uploader**: retries with backoff, deduplicates by report id
//!
//! # Configuration
//!
//! [`start`] reads `LOOM_CRASH_BASE_URL` and `LOOM_CRASH_STORAGE_DIR` on top
//! of the defaults. Use [`CrashReporter::builder`] for anything else.

mod app_state;
mod builder;
mod config;
mod context;
mod error;
mod interceptor;
mod queue;
mod reporter;
mod symbolicate;
mod system;
mod upload;

pub use app_state::{AppState, AppStateStore, APP_STATE_FILE};
pub use builder::{BuildOutcome, CapturedFault, ReportBuilder, MAX_FRAMES};
pub use config::{
	default_storage_dir, ApiKey, CrashConfig, Monitors, SymbolicationMode, DEFAULT_BASE_URL,
	DEFAULT_HANDOFF_TIMEOUT, DEFAULT_MAX_FOOTPRINTS, ENV_API_KEY, ENV_BASE_URL, ENV_STORAGE_DIR,
};
pub use context::{ContextSnapshot, SharedContext};
pub use error::{CrashSdkError, Result, UploadError};
pub use queue::{
	DurableQueue, QueueConfig, DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRIES, RECORD_FORMAT_VERSION,
};
pub use reporter::{CrashReporter, CrashReporterBuilder};
pub use symbolicate::{
	is_in_app_frame, DeferredSymbolicator, LocalSymbolicator, Symbolicator,
};
pub use system::{SDK_NAME, SDK_VERSION};
pub use upload::{
	classify_status, HttpTransport, ReportTransport, UploadConfig, UploadSummary, Uploader,
	DEFAULT_FLUSH_TIMEOUT, DEFAULT_MAX_DELIVERY_ATTEMPTS, DEFAULT_REQUEST_TIMEOUT, REPORTS_PATH,
};

pub use loom_common_http::RetryConfig;
pub use loom_crash_core::{
	CaptureError, CrashReport, DeliveryState, FaultKind, Footprint, QueueEntry, QueueError,
	ReportId, Severity, StackFrame,
};

/// Start crash reporting with default settings.
///
/// Base URL and storage directory come from the environment; `api_key`
/// takes the place of `LOOM_CRASH_API_KEY`. Repeated calls return the
/// running reporter.
pub fn start(api_key: impl Into<String>) -> Result<CrashReporter> {
	let mut config = CrashConfig::from_env_without_key();
	config.api_key = Some(ApiKey::new(api_key)?);
	CrashReporterBuilder::from_config(config).start()
}
