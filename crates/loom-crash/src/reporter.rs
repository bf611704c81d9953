// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The process-scoped reporter handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loom_common_http::RetryConfig;
use loom_crash_core::{CaptureError, FaultKind, Footprint, ReportId, Severity};
use tracing::{debug, error, info, warn};

use crate::app_state::{AppStateStore, APP_STATE_FILE};
use crate::builder::{CapturedFault, ReportBuilder};
use crate::config::{ApiKey, CrashConfig, Monitors, SymbolicationMode};
use crate::context::SharedContext;
use crate::error::{CrashSdkError, Result, UploadError};
use crate::interceptor::{CaptureSink, Interceptor};
use crate::queue::{DurableQueue, QueueConfig};
use crate::symbolicate;
use crate::upload::{HttpTransport, ReportTransport, UploadConfig, UploadSummary, Uploader};

/// The running reporter, if any. Holds it until shutdown so handlers stay
/// installed after the host drops its handles.
static ACTIVE: Mutex<Option<Arc<ReporterInner>>> = Mutex::new(None);

/// Builder for [`CrashReporter`].
pub struct CrashReporterBuilder {
	config: CrashConfig,
	transport: Option<Arc<dyn ReportTransport>>,
}

impl CrashReporterBuilder {
	pub fn new() -> Self {
		Self {
			config: CrashConfig::default(),
			transport: None,
		}
	}

	/// Start from a complete configuration, e.g. [`CrashConfig::from_env`].
	pub fn from_config(config: CrashConfig) -> Self {
		Self {
			config,
			transport: None,
		}
	}

	/// An invalid key is reported by [`CrashReporterBuilder::start`].
	pub fn api_key(mut self, key: impl Into<String>) -> Self {
		self.config.api_key = ApiKey::new(key).ok();
		self
	}

	/// Example: `https://loom.ghuntley.com`
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.config.base_url = url.into();
		self
	}

	pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config.storage_dir = Some(dir.into());
		self
	}

	pub fn queue(mut self, queue: QueueConfig) -> Self {
		self.config.queue = queue;
		self
	}

	pub fn upload(mut self, upload: UploadConfig) -> Self {
		self.config.upload = upload;
		self
	}

	pub fn retry(mut self, retry: RetryConfig) -> Self {
		self.config.upload.retry = retry;
		self
	}

	pub fn monitors(mut self, monitors: Monitors) -> Self {
		self.config.monitors = monitors;
		self
	}

	pub fn symbolication(mut self, mode: SymbolicationMode) -> Self {
		self.config.symbolication = mode;
		self
	}

	/// How long a faulting thread waits for its report to be persisted.
	pub fn handoff_timeout(mut self, timeout: Duration) -> Self {
		self.config.handoff_timeout = timeout;
		self
	}

	/// Upload reports from previous runs in the background on start
	/// (default: true).
	pub fn flush_on_start(mut self, enabled: bool) -> Self {
		self.config.flush_on_start = enabled;
		self
	}

	pub fn max_footprints(mut self, max: usize) -> Self {
		self.config.max_footprints = max;
		self
	}

	/// Replace the HTTP transport.
	pub fn transport(mut self, transport: Arc<dyn ReportTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Install fault handlers and open the queue.
	///
	/// If a reporter is already running in this process its handle is
	/// returned and this configuration is ignored.
	pub fn start(self) -> Result<CrashReporter> {
		let config = self.config;
		let api_key = config.api_key.clone().ok_or(CrashSdkError::InvalidApiKey)?;
		let base_url = normalize_base_url(&config.base_url)?;
		let storage_dir = config.resolve_storage_dir()?;

		let mut active = ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		if let Some(inner) = active.as_ref() {
			if !inner.closed.load(Ordering::SeqCst) {
				debug!("crash reporter already running");
				return Ok(CrashReporter {
					inner: Arc::clone(inner),
				});
			}
		}

		let queue = Arc::new(DurableQueue::open(&storage_dir, config.queue.clone())?);
		let app_state = Arc::new(AppStateStore::open(storage_dir.join(APP_STATE_FILE))?);
		let launch = app_state.record_launch()?;

		let context = Arc::new(SharedContext::new(config.max_footprints));
		let builder = Arc::new(ReportBuilder::new(
			symbolicate::for_mode(config.symbolication),
			Arc::clone(&context),
			Some(Arc::clone(&app_state)),
		));

		let transport = match self.transport {
			Some(transport) => transport,
			None => Arc::new(HttpTransport::new(
				&base_url,
				api_key,
				config.upload.request_timeout,
			)?),
		};
		let uploader = Arc::new(Uploader::new(
			Arc::clone(&queue),
			transport,
			config.upload.clone(),
		));

		let sink = Arc::new(QueueSink {
			builder: Arc::clone(&builder),
			queue: Arc::clone(&queue),
			app_state: Arc::clone(&app_state),
		});
		let interceptor = Interceptor::install(&config.monitors, config.handoff_timeout, sink)?;

		let inner = Arc::new(ReporterInner {
			storage_dir,
			queue,
			app_state,
			context,
			builder,
			uploader,
			interceptor: Mutex::new(Some(interceptor)),
			crashed_last_launch: launch.crashed_last_launch,
			closed: AtomicBool::new(false),
		});
		*active = Some(Arc::clone(&inner));
		drop(active);

		info!(
			storage_dir = %inner.storage_dir.display(),
			base_url = %base_url,
			crashed_last_launch = inner.crashed_last_launch,
			launches_since_last_crash = launch.launches_since_last_crash,
			"crash reporter started"
		);

		if config.flush_on_start {
			spawn_startup_flush(Arc::clone(&inner.uploader));
		}

		Ok(CrashReporter { inner })
	}
}

impl Default for CrashReporterBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn normalize_base_url(url: &str) -> Result<String> {
	let parsed =
		reqwest::Url::parse(url).map_err(|e| CrashSdkError::InvalidBaseUrl(format!("{url}: {e}")))?;
	if !matches!(parsed.scheme(), "http" | "https") {
		return Err(CrashSdkError::InvalidBaseUrl(format!(
			"{url}: unsupported scheme {}",
			parsed.scheme()
		)));
	}
	Ok(url.trim_end_matches('/').to_string())
}

fn spawn_startup_flush(uploader: Arc<Uploader>) {
	let timeout = uploader.config().flush_timeout;
	let task = async move {
		match uploader.flush_with_timeout(timeout).await {
			Ok(summary) => debug!(?summary, "startup flush finished"),
			Err(UploadError::Shutdown) => {}
			Err(e) => warn!(error = %e, "startup flush failed"),
		}
	};

	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		handle.spawn(task);
		return;
	}

	let spawned = std::thread::Builder::new()
		.name("loom-crash-upload".to_string())
		.spawn(move || {
			match tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
			{
				Ok(runtime) => runtime.block_on(task),
				Err(e) => warn!(error = %e, "failed to start upload runtime"),
			}
		});
	if let Err(e) = spawned {
		warn!(error = %e, "failed to spawn startup flush");
	}
}

/// Builds and queues reports on the capture worker.
struct QueueSink {
	builder: Arc<ReportBuilder>,
	queue: Arc<DurableQueue>,
	app_state: Arc<AppStateStore>,
}

impl CaptureSink for QueueSink {
	fn persist(&self, fault: CapturedFault) {
		let critical = fault.kind.is_critical();
		let report = self.builder.build(fault).report;
		let id = report.id();

		if let Err(e) = self.queue.enqueue(report) {
			error!(report_id = %id, error = %CaptureError::Persist(e), "crash report lost");
			return;
		}
		if critical {
			if let Err(e) = self.app_state.record_crash() {
				warn!(error = %e, "failed to record crash in app state");
			}
		}
	}
}

struct ReporterInner {
	storage_dir: PathBuf,
	queue: Arc<DurableQueue>,
	app_state: Arc<AppStateStore>,
	context: Arc<SharedContext>,
	builder: Arc<ReportBuilder>,
	uploader: Arc<Uploader>,
	interceptor: Mutex<Option<Interceptor>>,
	crashed_last_launch: bool,
	closed: AtomicBool,
}

/// Crash reporter for this process.
///
/// Faults are captured from start until [`CrashReporter::shutdown`], whether
/// or not the host keeps a handle. Cloning is cheap.
///
/// # Example
///
/// ```ignore
/// use loom_crash::CrashReporter;
///
/// let reporter = CrashReporter::builder()
///     .api_key("key123")
///     .base_url("https://loom.ghuntley.com")
///     .start()?;
///
/// reporter.set_user_identifier(Some("user-42".into()));
/// reporter.leave_footprint("opened settings");
///
/// if let Err(e) = sync_settings() {
///     reporter.log_error_object(&e)?;
/// }
///
/// reporter.flush().await?;
/// reporter.shutdown().await?;
/// ```
#[derive(Clone)]
pub struct CrashReporter {
	inner: Arc<ReporterInner>,
}

impl CrashReporter {
	pub fn builder() -> CrashReporterBuilder {
		CrashReporterBuilder::new()
	}

	/// Attach a user identifier to subsequent reports; `None` clears it.
	pub fn set_user_identifier(&self, user_id: Option<String>) {
		self.inner.context.set_user_identifier(user_id);
	}

	/// Set a metadata attribute; `None` deletes it.
	pub fn set_attribute(&self, key: impl Into<String>, value: Option<String>) {
		self.inner.context.set_attribute(key, value);
	}

	pub fn leave_footprint(&self, name: impl Into<String>) {
		self.inner.context.leave_footprint(Footprint::new(name));
	}

	pub fn leave_footprint_with_metadata(
		&self,
		name: impl Into<String>,
		metadata: HashMap<String, String>,
	) {
		self.inner
			.context
			.leave_footprint(Footprint::new(name).with_metadata(metadata));
	}

	/// Count a new user session (e.g. the app came back to the foreground).
	pub fn record_session(&self) -> Result<()> {
		self.check_closed()?;
		self.inner.app_state.record_session()?;
		Ok(())
	}

	pub fn log_error(&self, message: impl Into<String>) -> Result<ReportId> {
		self.log(Severity::Error, message.into(), HashMap::new())
	}

	pub fn log_warning(&self, message: impl Into<String>) -> Result<ReportId> {
		self.log(Severity::Warning, message.into(), HashMap::new())
	}

	pub fn log_info(&self, message: impl Into<String>) -> Result<ReportId> {
		self.log(Severity::Info, message.into(), HashMap::new())
	}

	/// Queue an error report for `error`; its source chain goes into the
	/// `error.chain` attribute.
	pub fn log_error_object(&self, error: &dyn std::error::Error) -> Result<ReportId> {
		let mut chain = Vec::new();
		let mut source = error.source();
		while let Some(cause) = source {
			chain.push(cause.to_string());
			source = cause.source();
		}

		let mut metadata = HashMap::new();
		if !chain.is_empty() {
			metadata.insert("error.chain".to_string(), chain.join(": "));
		}
		self.log(Severity::Error, error.to_string(), metadata)
	}

	/// Whether the previous run of this program ended in a captured crash.
	pub fn crashed_last_launch(&self) -> bool {
		self.inner.crashed_last_launch
	}

	/// Reports waiting in the queue.
	pub fn pending_reports(&self) -> Result<usize> {
		Ok(self.inner.queue.pending_count()?)
	}

	/// Upload queued reports now.
	pub async fn flush(&self) -> Result<UploadSummary> {
		self.check_closed()?;
		Ok(self.inner.uploader.flush().await?)
	}

	pub async fn flush_with_timeout(&self, timeout: Duration) -> Result<UploadSummary> {
		self.check_closed()?;
		Ok(self.inner.uploader.flush_with_timeout(timeout).await?)
	}

	/// Uninstall fault handlers and stop uploading. Queued reports stay on
	/// disk for the next run.
	pub async fn shutdown(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		let interceptor = self
			.inner
			.interceptor
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.take();
		if let Some(interceptor) = interceptor {
			interceptor.uninstall();
		}
		self.inner.uploader.shutdown().await;

		let mut active = ACTIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		if active.as_ref().is_some_and(|running| Arc::ptr_eq(running, &self.inner)) {
			*active = None;
		}

		info!("crash reporter shut down");
		Ok(())
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	pub fn storage_dir(&self) -> &Path {
		&self.inner.storage_dir
	}

	fn log(
		&self,
		severity: Severity,
		message: String,
		metadata: HashMap<String, String>,
	) -> Result<ReportId> {
		self.check_closed()?;

		let mut fault = CapturedFault::current_thread(FaultKind::Reported { severity, message });
		fault.metadata = metadata;
		let report = self.inner.builder.build(fault).report;
		let id = report.id();
		self.inner.queue.enqueue(report)?;

		debug!(report_id = %id, severity = %severity, "event logged");
		Ok(id)
	}

	fn check_closed(&self) -> Result<()> {
		if self.inner.closed.load(Ordering::SeqCst) {
			return Err(CrashSdkError::ClientShutdown);
		}
		Ok(())
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::interceptor::tests::PROCESS_WIDE;
	use loom_crash_core::CrashReport;
	use tempfile::TempDir;

	// Only one reporter can run per process.
	pub(crate) static REPORTER_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

	struct NullTransport;

	#[async_trait::async_trait]
	impl ReportTransport for NullTransport {
		async fn send(&self, _report: &CrashReport) -> std::result::Result<(), UploadError> {
			Ok(())
		}
	}

	fn builder(dir: &TempDir) -> CrashReporterBuilder {
		CrashReporter::builder()
			.api_key("key123")
			.base_url("https://crash.example.com/")
			.storage_dir(dir.path())
			.monitors(Monitors::none())
			.symbolication(SymbolicationMode::Deferred)
			.flush_on_start(false)
			.transport(Arc::new(NullTransport))
	}

	#[test]
	fn start_requires_valid_api_key() {
		let dir = TempDir::new().unwrap();
		let result = builder(&dir).api_key("has space").start();
		assert!(matches!(result, Err(CrashSdkError::InvalidApiKey)));

		let result = CrashReporter::builder().storage_dir(dir.path()).start();
		assert!(matches!(result, Err(CrashSdkError::InvalidApiKey)));
	}

	#[test]
	fn start_rejects_bad_base_url() {
		let dir = TempDir::new().unwrap();
		assert!(matches!(
			builder(&dir).base_url("not a url").start(),
			Err(CrashSdkError::InvalidBaseUrl(_))
		));
		assert!(matches!(
			builder(&dir).base_url("ftp://crash.example.com").start(),
			Err(CrashSdkError::InvalidBaseUrl(_))
		));
	}

	#[test]
	fn base_url_is_normalized() {
		assert_eq!(
			normalize_base_url("https://crash.example.com/").unwrap(),
			"https://crash.example.com"
		);
	}

	#[tokio::test]
	async fn second_start_returns_running_reporter() {
		let _guard = REPORTER_LOCK.lock().await;
		let dir = TempDir::new().unwrap();
		let other = TempDir::new().unwrap();

		let first = builder(&dir).start().unwrap();
		let second = builder(&other).start().unwrap();
		assert!(Arc::ptr_eq(&first.inner, &second.inner));
		assert_eq!(second.storage_dir(), dir.path());

		first.shutdown().await.unwrap();
		assert!(second.is_closed());

		let third = builder(&other).start().unwrap();
		assert!(!Arc::ptr_eq(&first.inner, &third.inner));
		third.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn logged_events_are_queued_and_flushed() {
		let _guard = REPORTER_LOCK.lock().await;
		let dir = TempDir::new().unwrap();
		let reporter = builder(&dir).start().unwrap();

		reporter.set_attribute("plan", Some("pro".into()));
		reporter.leave_footprint("opened cart");
		reporter.log_warning("cart is slow").unwrap();
		reporter.log_info("checkout started").unwrap();
		assert_eq!(reporter.pending_reports().unwrap(), 2);

		let summary = reporter.flush().await.unwrap();
		assert_eq!(summary.delivered, 2);
		assert_eq!(reporter.pending_reports().unwrap(), 0);

		reporter.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn error_object_chain_is_recorded() {
		let _guard = REPORTER_LOCK.lock().await;
		let dir = TempDir::new().unwrap();
		let reporter = builder(&dir).start().unwrap();

		let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume");
		let error = CrashSdkError::Queue(loom_crash_core::QueueError::Io(io));
		let id = reporter.log_error_object(&error).unwrap();

		let entries = reporter.inner.queue.drain().unwrap();
		let entry = entries.iter().find(|e| e.id() == id).unwrap();
		assert_eq!(
			entry.report.fault(),
			&FaultKind::Reported {
				severity: Severity::Error,
				message: error.to_string(),
			}
		);
		assert!(entry.report.metadata()["error.chain"].contains("read-only volume"));
		assert!(!entry.is_critical());

		reporter.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn reporter_keeps_capturing_after_handle_is_dropped() {
		let _guard = REPORTER_LOCK.lock().await;
		let _process = PROCESS_WIDE.lock().unwrap_or_else(|e| e.into_inner());
		let dir = TempDir::new().unwrap();
		let panics_only = || {
			builder(&dir).monitors(Monitors {
				signals: false,
				panics: true,
			})
		};

		panics_only().start().unwrap();

		let worker = std::thread::spawn(|| panic!("checkout failed"));
		assert!(worker.join().is_err());

		let reporter = panics_only().start().unwrap();
		assert_eq!(reporter.pending_reports().unwrap(), 1);
		reporter.shutdown().await.unwrap();
	}

	#[tokio::test]
	async fn shutdown_is_idempotent_and_blocks_host_api() {
		let _guard = REPORTER_LOCK.lock().await;
		let dir = TempDir::new().unwrap();
		let reporter = builder(&dir).start().unwrap();

		reporter.shutdown().await.unwrap();
		reporter.shutdown().await.unwrap();
		assert!(matches!(reporter.log_error("late"), Err(CrashSdkError::ClientShutdown)));
		assert!(matches!(reporter.flush().await, Err(CrashSdkError::ClientShutdown)));
	}

	#[tokio::test]
	async fn launches_are_counted_across_starts() {
		let _guard = REPORTER_LOCK.lock().await;
		let dir = TempDir::new().unwrap();

		let reporter = builder(&dir).start().unwrap();
		assert!(!reporter.crashed_last_launch());
		reporter.inner.app_state.record_crash().unwrap();
		reporter.shutdown().await.unwrap();

		let reporter = builder(&dir).start().unwrap();
		assert!(reporter.crashed_last_launch());
		assert_eq!(reporter.inner.app_state.current().launches_since_last_crash, 1);
		reporter.shutdown().await.unwrap();
	}
}
