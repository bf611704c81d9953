// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-wide fault interception.
//!
//! Each [`FaultBackend`] installs one kind of handler (fatal signals, the
//! panic hook). Handlers write into the static [`raw::SLOT`] and hand it to
//! the capture worker, which turns it into a [`CapturedFault`] through the
//! backend that produced it and passes that to a [`CaptureSink`].

mod handoff;
mod panic;
mod raw;
#[cfg(unix)]
mod signal;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use loom_crash_core::CaptureError;
use tracing::{debug, info, warn};

use crate::builder::CapturedFault;
use crate::config::Monitors;

use self::handoff::{Dispatch, Handoff};
use self::raw::{CaptureKind, RawCapture, SLOT};

/// A source of faults.
pub(crate) trait FaultBackend: Send + Sync {
	fn name(&self) -> &'static str;

	/// The slot contents this backend writes.
	fn kind(&self) -> CaptureKind;

	fn install_handler(&self) -> Result<(), CaptureError>;

	/// Put back whatever was installed before [`FaultBackend::install_handler`].
	fn uninstall_handler(&self);

	/// Decode a slot this backend filled. Runs on the capture worker.
	fn capture_state(&self, raw: &RawCapture) -> CapturedFault;
}

/// Receives every captured fault on the capture worker. Must finish within
/// the handoff timeout.
pub(crate) trait CaptureSink: Send + Sync {
	fn persist(&self, fault: CapturedFault);
}

/// Installed handlers plus the capture worker. Dropping it uninstalls.
pub(crate) struct Interceptor {
	backends: Vec<Arc<dyn FaultBackend>>,
	handoff: Option<Handoff>,
}

impl Interceptor {
	pub(crate) fn install(
		monitors: &Monitors,
		handoff_timeout: Duration,
		sink: Arc<dyn CaptureSink>,
	) -> Result<Self, CaptureError> {
		let backends = backends_for(monitors, handoff_timeout);
		if backends.is_empty() {
			info!("no fault monitors enabled");
			return Ok(Self {
				backends,
				handoff: None,
			});
		}

		let handoff = Handoff::spawn(dispatcher(backends.clone(), sink), handoff_timeout)?;

		for (installed, backend) in backends.iter().enumerate() {
			if let Err(e) = backend.install_handler() {
				warn!(backend = backend.name(), error = %e, "failed to install fault handler");
				for earlier in backends[..installed].iter().rev() {
					earlier.uninstall_handler();
				}
				drop(handoff);
				return Err(e);
			}
			debug!(backend = backend.name(), "fault handler installed");
		}

		info!(
			backends = ?backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
			timeout_ms = handoff_timeout.as_millis() as u64,
			"fault interception active"
		);
		Ok(Self {
			backends,
			handoff: Some(handoff),
		})
	}

	pub(crate) fn uninstall(mut self) {
		self.uninstall_all();
	}

	fn uninstall_all(&mut self) {
		for backend in self.backends.drain(..).rev() {
			backend.uninstall_handler();
			debug!(backend = backend.name(), "fault handler uninstalled");
		}
		// Stops and joins the worker.
		self.handoff.take();
	}
}

impl Drop for Interceptor {
	fn drop(&mut self) {
		self.uninstall_all();
	}
}

fn backends_for(monitors: &Monitors, handoff_timeout: Duration) -> Vec<Arc<dyn FaultBackend>> {
	let mut backends: Vec<Arc<dyn FaultBackend>> = Vec::new();

	#[cfg(unix)]
	if monitors.signals {
		backends.push(Arc::new(signal::SignalBackend));
	}
	#[cfg(not(unix))]
	if monitors.signals {
		warn!("signal monitoring is not supported on this platform");
	}

	if monitors.panics {
		backends.push(Arc::new(panic::PanicBackend::new(handoff_timeout)));
	}
	backends
}

fn dispatcher(backends: Vec<Arc<dyn FaultBackend>>, sink: Arc<dyn CaptureSink>) -> Dispatch {
	Arc::new(move |kind| {
		if let Some(backend) = backends.iter().find(|b| b.kind() == kind) {
			// SAFETY: the requesting thread holds the slot and is blocked
			// waiting for this dispatch to be acknowledged.
			let raw = unsafe { SLOT.get() };
			sink.persist(backend.capture_state(raw));
		}
		// A panicking thread may stop waiting before the report is built, so
		// the slot is freed here rather than by the requester.
		if kind == CaptureKind::Panic {
			SLOT.release();
		}
	})
}

fn captured_fault(kind: loom_crash_core::FaultKind, raw: &RawCapture) -> CapturedFault {
	let timestamp = DateTime::<Utc>::from_timestamp(
		raw.timestamp_ns.div_euclid(1_000_000_000),
		raw.timestamp_ns.rem_euclid(1_000_000_000) as u32,
	)
	.unwrap_or_else(Utc::now);

	CapturedFault {
		kind,
		thread_id: raw.thread_id,
		timestamp,
		addresses: raw.frames().to_vec(),
		truncated: raw.is_truncated(),
		metadata: HashMap::new(),
	}
}
