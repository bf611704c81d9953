// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end through the public reporter API.

use std::time::Duration;

use loom_crash::{CrashReporter, FaultKind, Monitors, SymbolicationMode};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// One reporter per process.
static REPORTER_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn accepting_server(expected: u64) -> MockServer {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/api/crash/reports"))
		.respond_with(ResponseTemplate::new(202))
		.expect(expected)
		.mount(&server)
		.await;
	server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn caught_panic_is_reported() {
	let _guard = REPORTER_LOCK.lock().await;
	let dir = TempDir::new().unwrap();
	let server = accepting_server(1).await;

	let reporter = CrashReporter::builder()
		.api_key("key123")
		.base_url(server.uri())
		.storage_dir(dir.path())
		.monitors(Monitors {
			signals: false,
			panics: true,
		})
		.symbolication(SymbolicationMode::Deferred)
		.flush_on_start(false)
		.start()
		.unwrap();
	reporter.set_user_identifier(Some("user_123".into()));
	reporter.leave_footprint("checkout");

	let worker = std::thread::Builder::new()
		.name("checkout-worker".into())
		.spawn(|| panic!("cart total overflowed"))
		.unwrap();
	assert!(worker.join().is_err());
	assert_eq!(reporter.pending_reports().unwrap(), 1);

	let summary = reporter.flush().await.unwrap();
	assert_eq!(summary.delivered, 1);
	assert_eq!(reporter.pending_reports().unwrap(), 0);

	let requests = server.received_requests().await.unwrap();
	let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert_eq!(body["report"]["fault"]["type"], "panic");
	assert_eq!(body["report"]["fault"]["message"], "cart total overflowed");
	assert_eq!(body["report"]["user_id"], "user_123");

	reporter.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_reports_are_uploaded_on_next_start() {
	let _guard = REPORTER_LOCK.lock().await;
	let dir = TempDir::new().unwrap();
	let server = accepting_server(1).await;

	let builder = || {
		CrashReporter::builder()
			.api_key("key123")
			.base_url(server.uri())
			.storage_dir(dir.path())
			.monitors(Monitors::none())
			.symbolication(SymbolicationMode::Deferred)
	};

	let first = builder().flush_on_start(false).start().unwrap();
	first.log_error("settings sync failed").unwrap();
	first.shutdown().await.unwrap();

	let second = builder().flush_on_start(true).start().unwrap();
	tokio::time::timeout(Duration::from_secs(10), async {
		while second.pending_reports().unwrap() > 0 {
			tokio::time::sleep(Duration::from_millis(20)).await;
		}
	})
	.await
	.unwrap();

	let requests = server.received_requests().await.unwrap();
	let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
	assert!(matches!(
		serde_json::from_value::<FaultKind>(body["report"]["fault"].clone()).unwrap(),
		FaultKind::Reported { message, .. } if message == "settings sync failed"
	));

	second.shutdown().await.unwrap();
}
