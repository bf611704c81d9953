// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Delivering queued reports to the collection endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_common_http::RetryConfig;
use loom_crash_core::{
	truncate, CrashReport, DeliveryState, QueueEntry, QueueError, ReportEnvelope, SdkInfo,
};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ApiKey;
use crate::error::{CrashSdkError, UploadError};
use crate::queue::DurableQueue;
use crate::system::{SDK_NAME, SDK_VERSION};

pub const REPORTS_PATH: &str = "/api/crash/reports";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Flushes an entry may fail transiently before it is given up on.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Clone)]
pub struct UploadConfig {
	/// Backoff between attempts within one flush.
	pub retry: RetryConfig,
	pub request_timeout: Duration,
	pub max_delivery_attempts: u32,
	/// Bound used by [`Uploader::flush_with_timeout`] callers that do not
	/// pass their own, such as the startup flush.
	pub flush_timeout: Duration,
}

impl Default for UploadConfig {
	fn default() -> Self {
		Self {
			retry: RetryConfig::default(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
			flush_timeout: DEFAULT_FLUSH_TIMEOUT,
		}
	}
}

/// Sends one report.
#[async_trait]
pub trait ReportTransport: Send + Sync {
	async fn send(&self, report: &CrashReport) -> Result<(), UploadError>;
}

/// `POST {base_url}/api/crash/reports` with a JSON [`ReportEnvelope`].
pub struct HttpTransport {
	client: Client,
	endpoint: String,
	api_key: ApiKey,
	sdk: SdkInfo,
}

impl HttpTransport {
	pub fn new(
		base_url: &str,
		api_key: ApiKey,
		request_timeout: Duration,
	) -> Result<Self, CrashSdkError> {
		let client = loom_common_http::builder()
			.timeout(request_timeout)
			.build()?;

		Ok(Self {
			client,
			endpoint: format!("{}{REPORTS_PATH}", base_url.trim_end_matches('/')),
			api_key,
			sdk: SdkInfo::new(SDK_NAME, SDK_VERSION),
		})
	}

	pub fn endpoint(&self) -> &str {
		&self.endpoint
	}
}

#[async_trait]
impl ReportTransport for HttpTransport {
	async fn send(&self, report: &CrashReport) -> Result<(), UploadError> {
		let envelope = ReportEnvelope::new(&self.sdk, report);
		debug!(report_id = %report.id(), fingerprint = %envelope.fingerprint, "sending report");

		let response = self
			.client
			.post(&self.endpoint)
			.bearer_auth(self.api_key.expose())
			.header("Idempotency-Key", report.id().to_string())
			.json(&envelope)
			.send()
			.await?;

		let status = response.status();
		if status.is_success() || status == StatusCode::CONFLICT {
			return Ok(());
		}

		let retry_after = parse_retry_after(response.headers());
		let body = response.text().await.unwrap_or_default();
		Err(classify_status(status, truncate(&body, MAX_ERROR_BODY), retry_after))
	}
}

/// Maps a non-success response to an error. 409 is not an error: the
/// endpoint already has the report.
pub fn classify_status(
	status: StatusCode,
	message: String,
	retry_after: Option<Duration>,
) -> UploadError {
	let code = status.as_u16();
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => UploadError::AuthRejected { status: code },
		StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => UploadError::Transient {
			status: Some(code),
			message,
			retry_after,
		},
		s if s.is_client_error() => UploadError::PermanentReject {
			status: code,
			message,
		},
		_ => UploadError::Transient {
			status: Some(code),
			message,
			retry_after,
		},
	}
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	headers
		.get(RETRY_AFTER)
		.and_then(|v| v.to_str().ok())
		.and_then(|s| s.trim().parse::<u64>().ok())
		.map(Duration::from_secs)
}

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
	pub delivered: usize,
	/// Marked failed-permanent and removed.
	pub failed: usize,
	/// Still queued for a later flush.
	pub retained: usize,
	/// Already delivered earlier; removed without sending.
	pub duplicates: usize,
}

/// Drains the durable queue through a [`ReportTransport`].
pub struct Uploader {
	queue: Arc<DurableQueue>,
	transport: Arc<dyn ReportTransport>,
	config: UploadConfig,
	flush_lock: Mutex<()>,
	closed: AtomicBool,
}

impl Uploader {
	pub fn new(
		queue: Arc<DurableQueue>,
		transport: Arc<dyn ReportTransport>,
		config: UploadConfig,
	) -> Self {
		Self {
			queue,
			transport,
			config,
			flush_lock: Mutex::new(()),
			closed: AtomicBool::new(false),
		}
	}

	pub fn config(&self) -> &UploadConfig {
		&self.config
	}

	/// Try to deliver every queued entry once.
	///
	/// Concurrent calls run one after the other; the second finds the queue
	/// already drained.
	pub async fn flush(&self) -> Result<UploadSummary, UploadError> {
		self.check_closed()?;
		let _flushing = self.flush_lock.lock().await;

		let entries = self.with_queue(|queue| queue.drain()).await?;
		let mut summary = UploadSummary::default();
		debug!(entries = entries.len(), "flushing crash reports");

		for entry in entries {
			if self.closed.load(Ordering::SeqCst) {
				summary.retained += 1;
				continue;
			}
			match self.deliver(entry, &mut summary).await {
				Ok(()) => {}
				Err(UploadError::Queue(QueueError::NotFound(id))) => {
					// Evicted by a fault-path enqueue while we were sending.
					debug!(report_id = %id, "entry left the queue during flush");
				}
				Err(e) => return Err(e),
			}
		}

		if summary != UploadSummary::default() {
			info!(
				delivered = summary.delivered,
				failed = summary.failed,
				retained = summary.retained,
				duplicates = summary.duplicates,
				"flush complete"
			);
		}
		Ok(summary)
	}

	pub async fn flush_with_timeout(&self, timeout: Duration) -> Result<UploadSummary, UploadError> {
		tokio::time::timeout(timeout, self.flush())
			.await
			.map_err(|_| UploadError::Timeout(timeout))?
	}

	/// Stop accepting flushes and wait for a running one to stop.
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		let _ = self.flush_lock.lock().await;
		debug!("uploader shut down");
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	async fn deliver(
		&self,
		entry: QueueEntry,
		summary: &mut UploadSummary,
	) -> Result<(), UploadError> {
		let id = entry.id();

		if self.queue.is_delivered(&id) {
			self.complete(entry, DeliveryState::Delivered).await?;
			debug!(report_id = %id, "skipping already delivered report");
			summary.duplicates += 1;
			return Ok(());
		}

		let entry = self
			.with_queue(move |queue| {
				let mut entry = entry;
				queue.mark_in_flight(&mut entry)?;
				Ok(entry)
			})
			.await?;

		let transport = &self.transport;
		let report = &entry.report;
		let result = loom_common_http::retry(&self.config.retry, || transport.send(report)).await;

		match result {
			Ok(()) => {
				self.complete(entry, DeliveryState::Delivered).await?;
				info!(report_id = %id, "report delivered");
				summary.delivered += 1;
			}
			Err(e) if e.is_permanent() => {
				warn!(report_id = %id, error = %e, "report rejected");
				let mut entry = entry;
				entry.last_error = Some(e.to_string());
				self.complete(entry, DeliveryState::FailedPermanent).await?;
				summary.failed += 1;
			}
			Err(e) => {
				let message = e.to_string();
				let max_attempts = self.config.max_delivery_attempts;
				let entry = self
					.with_queue(move |queue| {
						let mut entry = entry;
						queue.record_failed_attempt(&mut entry, &message)?;
						Ok(entry)
					})
					.await?;

				if entry.attempts >= max_attempts {
					self.complete(entry, DeliveryState::FailedPermanent).await?;
					summary.failed += 1;
				} else {
					warn!(
						report_id = %id,
						attempts = entry.attempts,
						max_attempts,
						error = %e,
						"report delivery failed, will retry on next flush"
					);
					summary.retained += 1;
				}
			}
		}
		Ok(())
	}

	async fn complete(&self, entry: QueueEntry, state: DeliveryState) -> Result<(), UploadError> {
		self.with_queue(move |queue| {
			let mut entry = entry;
			queue.complete(&mut entry, state)
		})
		.await
	}

	/// Queue file I/O runs off the async workers.
	async fn with_queue<T, F>(&self, f: F) -> Result<T, UploadError>
	where
		F: FnOnce(&DurableQueue) -> crate::queue::Result<T> + Send + 'static,
		T: Send + 'static,
	{
		let queue = Arc::clone(&self.queue);
		match tokio::task::spawn_blocking(move || f(&queue)).await {
			Ok(result) => Ok(result?),
			Err(e) => Err(UploadError::Queue(QueueError::Io(std::io::Error::other(
				e.to_string(),
			)))),
		}
	}

	fn check_closed(&self) -> Result<(), UploadError> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(UploadError::Shutdown);
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::queue::QueueConfig;
	use loom_crash_core::{CrashReportDraft, FaultKind};
	use std::collections::VecDeque;
	use std::sync::atomic::AtomicUsize;
	use tempfile::TempDir;

	/// Replays scripted results, then succeeds.
	struct MockTransport {
		calls: AtomicUsize,
		script: std::sync::Mutex<VecDeque<Result<(), UploadError>>>,
		always: Option<fn() -> UploadError>,
	}

	impl MockTransport {
		fn succeeding() -> Self {
			Self::scripted(Vec::new())
		}

		fn scripted(script: Vec<Result<(), UploadError>>) -> Self {
			Self {
				calls: AtomicUsize::new(0),
				script: std::sync::Mutex::new(script.into()),
				always: None,
			}
		}

		fn failing(error: fn() -> UploadError) -> Self {
			Self {
				always: Some(error),
				..Self::succeeding()
			}
		}

		fn calls(&self) -> usize {
			self.calls.load(Ordering::SeqCst)
		}
	}

	#[async_trait]
	impl ReportTransport for MockTransport {
		async fn send(&self, _report: &CrashReport) -> Result<(), UploadError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if let Some(error) = self.always {
				return Err(error());
			}
			self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
		}
	}

	fn unavailable() -> UploadError {
		UploadError::Transient {
			status: Some(503),
			message: "unavailable".into(),
			retry_after: None,
		}
	}

	fn segv() -> CrashReport {
		CrashReportDraft::new(FaultKind::Signal {
			signal: 11,
			code: 1,
			name: "SIGSEGV".into(),
			address: 0,
		})
		.finish()
	}

	fn fast_retry(max_attempts: u32) -> UploadConfig {
		UploadConfig {
			retry: RetryConfig {
				max_attempts,
				base_delay: Duration::from_millis(1),
				max_delay: Duration::from_millis(5),
				backoff_factor: 2.0,
				jitter: false,
			},
			..UploadConfig::default()
		}
	}

	fn setup(transport: Arc<MockTransport>, config: UploadConfig) -> (TempDir, Arc<DurableQueue>, Uploader) {
		let dir = TempDir::new().unwrap();
		let queue = Arc::new(DurableQueue::open(dir.path(), QueueConfig::default()).unwrap());
		let uploader = Uploader::new(Arc::clone(&queue), transport, config);
		(dir, queue, uploader)
	}

	#[tokio::test]
	async fn flush_delivers_and_removes() {
		let transport = Arc::new(MockTransport::succeeding());
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(3));
		queue.enqueue(segv()).unwrap();
		queue.enqueue(segv()).unwrap();

		let summary = uploader.flush().await.unwrap();
		assert_eq!(summary.delivered, 2);
		assert_eq!(summary.failed, 0);
		assert_eq!(queue.pending_count().unwrap(), 0);
		assert_eq!(transport.calls(), 2);
	}

	#[tokio::test]
	async fn repeated_flush_uploads_once() {
		let transport = Arc::new(MockTransport::succeeding());
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(3));
		queue.enqueue(segv()).unwrap();

		let (first, second) = tokio::join!(uploader.flush(), uploader.flush());
		let delivered = first.unwrap().delivered + second.unwrap().delivered;
		assert_eq!(delivered, 1);
		assert_eq!(transport.calls(), 1);
	}

	#[tokio::test]
	async fn ledger_prevents_second_upload() {
		let transport = Arc::new(MockTransport::succeeding());
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(3));
		queue.enqueue(segv()).unwrap();

		// Keep a copy of the record as if removal had not happened.
		let record = std::fs::read_dir(queue.reports_dir())
			.unwrap()
			.map(|e| e.unwrap().path())
			.next()
			.unwrap();
		let bytes = std::fs::read(&record).unwrap();

		assert_eq!(uploader.flush().await.unwrap().delivered, 1);
		std::fs::write(&record, bytes).unwrap();

		let summary = uploader.flush().await.unwrap();
		assert_eq!(summary.duplicates, 1);
		assert_eq!(summary.delivered, 0);
		assert_eq!(transport.calls(), 1);
		assert_eq!(queue.pending_count().unwrap(), 0);
	}

	#[tokio::test]
	async fn auth_rejection_is_not_retried() {
		let transport = Arc::new(MockTransport::failing(|| UploadError::AuthRejected {
			status: 401,
		}));
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(4));
		queue.enqueue(segv()).unwrap();

		let summary = uploader.flush().await.unwrap();
		assert_eq!(transport.calls(), 1);
		assert_eq!(summary.failed, 1);
		assert_eq!(queue.pending_count().unwrap(), 0);
	}

	#[tokio::test]
	async fn permanent_reject_drops_entry() {
		let transport = Arc::new(MockTransport::failing(|| UploadError::PermanentReject {
			status: 422,
			message: "schema".into(),
		}));
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(4));
		queue.enqueue(segv()).unwrap();

		let summary = uploader.flush().await.unwrap();
		assert_eq!(summary.failed, 1);
		assert_eq!(transport.calls(), 1);
		assert_eq!(queue.pending_count().unwrap(), 0);
	}

	#[tokio::test]
	async fn transient_failure_retries_then_keeps_entry() {
		let transport = Arc::new(MockTransport::failing(unavailable));
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(3));
		queue.enqueue(segv()).unwrap();

		let summary = uploader.flush().await.unwrap();
		assert_eq!(transport.calls(), 3);
		assert_eq!(summary.retained, 1);

		let entries = queue.drain().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].attempts, 1);
		assert_eq!(entries[0].state, DeliveryState::Pending);
		assert!(entries[0].last_error.as_deref().unwrap().contains("unavailable"));
	}

	#[tokio::test]
	async fn transient_failure_then_success_delivers() {
		let transport = Arc::new(MockTransport::scripted(vec![Err(unavailable()), Err(unavailable())]));
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), fast_retry(3));
		queue.enqueue(segv()).unwrap();

		let summary = uploader.flush().await.unwrap();
		assert_eq!(summary.delivered, 1);
		assert_eq!(transport.calls(), 3);
	}

	#[tokio::test]
	async fn entry_gives_up_after_max_delivery_attempts() {
		let transport = Arc::new(MockTransport::failing(unavailable));
		let mut config = fast_retry(1);
		config.max_delivery_attempts = 2;
		let (_dir, queue, uploader) = setup(Arc::clone(&transport), config);
		queue.enqueue(segv()).unwrap();

		assert_eq!(uploader.flush().await.unwrap().retained, 1);
		let summary = uploader.flush().await.unwrap();
		assert_eq!(summary.failed, 1);
		assert_eq!(queue.pending_count().unwrap(), 0);
		assert_eq!(transport.calls(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn flush_with_timeout_bounds_slow_flush() {
		let transport = Arc::new(MockTransport::failing(unavailable));
		let config = UploadConfig {
			retry: RetryConfig {
				max_attempts: 10,
				base_delay: Duration::from_secs(10),
				max_delay: Duration::from_secs(60),
				backoff_factor: 2.0,
				jitter: false,
			},
			..UploadConfig::default()
		};
		let (_dir, queue, uploader) = setup(transport, config);
		queue.enqueue(segv()).unwrap();

		let result = uploader.flush_with_timeout(Duration::from_secs(1)).await;
		assert!(matches!(result, Err(UploadError::Timeout(_))));
	}

	#[tokio::test]
	async fn shutdown_rejects_flush() {
		let transport = Arc::new(MockTransport::succeeding());
		let (_dir, queue, uploader) = setup(transport, fast_retry(1));
		queue.enqueue(segv()).unwrap();

		uploader.shutdown().await;
		assert!(uploader.is_closed());
		assert!(matches!(uploader.flush().await, Err(UploadError::Shutdown)));
		assert_eq!(queue.pending_count().unwrap(), 1);
	}

	#[test]
	fn status_classification() {
		let classify = |code: u16| {
			classify_status(StatusCode::from_u16(code).unwrap(), String::new(), None)
		};
		assert!(matches!(classify(401), UploadError::AuthRejected { status: 401 }));
		assert!(matches!(classify(403), UploadError::AuthRejected { status: 403 }));
		assert!(matches!(classify(400), UploadError::PermanentReject { status: 400, .. }));
		assert!(matches!(classify(413), UploadError::PermanentReject { status: 413, .. }));
		assert!(matches!(classify(408), UploadError::Transient { status: Some(408), .. }));
		assert!(matches!(classify(429), UploadError::Transient { status: Some(429), .. }));
		assert!(matches!(classify(503), UploadError::Transient { status: Some(503), .. }));
	}

	#[test]
	fn retry_after_seconds_are_parsed() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, "7".parse().unwrap());
		assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

		headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
		assert_eq!(parse_retry_after(&headers), None);
	}

	#[test]
	fn endpoint_joins_base_url() {
		let transport = HttpTransport::new(
			"https://crash.example.com/",
			ApiKey::new("key123").unwrap(),
			Duration::from_secs(5),
		)
		.unwrap();
		assert_eq!(transport.endpoint(), "https://crash.example.com/api/crash/reports");
	}
}
