// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Assembling a [`CrashReport`] from captured state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use loom_crash_core::{
	CaptureError, CrashReport, CrashReportDraft, FaultKind, StackFrame, ThreadSnapshot,
};
use tracing::{debug, warn};

use crate::app_state::AppStateStore;
use crate::context::SharedContext;
use crate::symbolicate::{self, Symbolicator};
use crate::system;

/// Most frames kept for one thread.
pub const MAX_FRAMES: usize = 128;

/// Owned copy of what an interceptor captured.
#[derive(Debug, Clone)]
pub struct CapturedFault {
	pub kind: FaultKind,
	/// OS thread id of the faulting thread.
	pub thread_id: u64,
	pub timestamp: DateTime<Utc>,
	/// Instruction addresses, innermost first.
	pub addresses: Vec<u64>,
	/// The stack walk stopped at [`MAX_FRAMES`].
	pub truncated: bool,
	/// Merged into the report metadata, over host attributes.
	pub metadata: HashMap<String, String>,
}

impl CapturedFault {
	/// Capture the calling thread, for events logged by the host.
	pub fn current_thread(kind: FaultKind) -> Self {
		let (addresses, truncated) = symbolicate::current_addresses(MAX_FRAMES);
		Self {
			kind,
			thread_id: system::current_thread_id(),
			timestamp: Utc::now(),
			addresses,
			truncated,
			metadata: HashMap::new(),
		}
	}
}

/// A report plus everything that went wrong while building it.
#[derive(Debug)]
pub struct BuildOutcome {
	pub report: CrashReport,
	pub errors: Vec<CaptureError>,
}

pub struct ReportBuilder {
	symbolicator: Arc<dyn Symbolicator>,
	context: Arc<SharedContext>,
	app_state: Option<Arc<AppStateStore>>,
}

impl ReportBuilder {
	pub fn new(
		symbolicator: Arc<dyn Symbolicator>,
		context: Arc<SharedContext>,
		app_state: Option<Arc<AppStateStore>>,
	) -> Self {
		Self {
			symbolicator,
			context,
			app_state,
		}
	}

	/// Build a report. Never fails: every degradation is returned in
	/// [`BuildOutcome::errors`] and the report carries what could be gathered.
	pub fn build(&self, fault: CapturedFault) -> BuildOutcome {
		let mut errors = Vec::new();
		let mut draft = CrashReportDraft::new(fault.kind);
		draft.timestamp = fault.timestamp;

		if fault.truncated {
			errors.push(CaptureError::TruncatedStack {
				captured: fault.addresses.len(),
			});
		}

		draft.frames = match self.symbolicator.symbolicate(&fault.addresses) {
			Ok(frames) => {
				draft.symbolicated = self.symbolicator.is_local();
				frames
			}
			Err(e) => {
				errors.push(e);
				fault
					.addresses
					.iter()
					.map(|&address| StackFrame::from_address(address))
					.collect()
			}
		};

		draft.threads = self.thread_snapshots(fault.thread_id, &draft.frames, &mut errors);
		draft.binary_images = system::binary_images();
		draft.os = system::os_context();
		draft.device = system::device_context();
		draft.app = system::app_context();

		if let Some(app_state) = &self.app_state {
			match app_state.try_context() {
				Some(launches) => {
					draft.app.launches_since_last_crash = launches.launches_since_last_crash;
					draft.app.sessions_since_last_crash = launches.sessions_since_last_crash;
					draft.app.crashed_last_launch = launches.crashed_last_launch;
				}
				None => errors.push(CaptureError::ContextUnavailable("app state")),
			}
		}

		match self.context.try_snapshot() {
			Ok(snapshot) => {
				draft.metadata = snapshot.attributes;
				draft.user_id = snapshot.user_id;
				draft.footprints = snapshot.footprints;
			}
			Err(e) => errors.push(e),
		}
		draft.metadata.extend(fault.metadata);

		let report = draft.finish();
		for error in &errors {
			warn!(report_id = %report.id(), error = %error, "report degraded");
		}
		debug!(
			report_id = %report.id(),
			frames = report.frames().len(),
			threads = report.threads().len(),
			"report built"
		);

		BuildOutcome { report, errors }
	}

	fn thread_snapshots(
		&self,
		crashed_thread: u64,
		frames: &[StackFrame],
		errors: &mut Vec<CaptureError>,
	) -> Vec<ThreadSnapshot> {
		let current = system::current_thread_id();
		let crashed_snapshot = |index: u32, name: Option<String>| ThreadSnapshot {
			index,
			thread_id: crashed_thread,
			name,
			crashed: true,
			current: crashed_thread == current,
			backtrace_skipped: false,
			frames: frames.to_vec(),
		};

		let threads = match system::enumerate_threads() {
			Ok(threads) => threads,
			Err(e) => {
				errors.push(e);
				return vec![crashed_snapshot(0, None)];
			}
		};

		let mut snapshots: Vec<ThreadSnapshot> = threads
			.into_iter()
			.enumerate()
			.map(|(index, thread)| {
				if thread.thread_id == crashed_thread {
					crashed_snapshot(index as u32, thread.name)
				} else {
					// Other threads keep running; walking their stacks needs
					// cooperation this capture path does not have.
					ThreadSnapshot {
						index: index as u32,
						thread_id: thread.thread_id,
						name: thread.name,
						crashed: false,
						current: thread.thread_id == current,
						backtrace_skipped: true,
						frames: Vec::new(),
					}
				}
			})
			.collect();

		if !snapshots.iter().any(|t| t.crashed) {
			snapshots.push(crashed_snapshot(snapshots.len() as u32, None));
		}
		snapshots
	}
}
