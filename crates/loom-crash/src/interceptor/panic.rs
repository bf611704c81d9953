// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Panic hook integration.

use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use loom_crash_core::{CaptureError, FaultKind};
use tracing::{debug, warn};

use super::handoff::{self, RequestOutcome};
use super::raw::{self, CaptureKind, RawCapture, SLOT};
use super::{captured_fault, FaultBackend};
use crate::builder::CapturedFault;
use crate::system;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

/// Concurrent panics take turns so each gets the slot.
static PANIC_LOCK: Mutex<()> = Mutex::new(());

/// Wraps the existing panic hook: the panic is captured first, then the
/// previous hook runs as before.
pub(crate) struct PanicBackend {
	previous: Arc<Mutex<Option<PanicHook>>>,
	enabled: Arc<AtomicBool>,
	handoff_timeout: Duration,
}

impl PanicBackend {
	pub(crate) fn new(handoff_timeout: Duration) -> Self {
		Self {
			previous: Arc::new(Mutex::new(None)),
			enabled: Arc::new(AtomicBool::new(false)),
			handoff_timeout,
		}
	}
}

impl FaultBackend for PanicBackend {
	fn name(&self) -> &'static str {
		"panic"
	}

	fn kind(&self) -> CaptureKind {
		CaptureKind::Panic
	}

	fn install_handler(&self) -> Result<(), CaptureError> {
		if std::thread::panicking() {
			return Err(CaptureError::HandlerInstall {
				target: "panic hook".to_string(),
				reason: "cannot replace the hook while panicking".to_string(),
			});
		}

		*lock(&self.previous) = Some(std::panic::take_hook());
		self.enabled.store(true, Ordering::Release);

		let previous = Arc::clone(&self.previous);
		let enabled = Arc::clone(&self.enabled);
		let timeout = self.handoff_timeout;
		std::panic::set_hook(Box::new(move |info| {
			// The worker's own panics are caught there and must not wait on it.
			if enabled.load(Ordering::Acquire) && !handoff::is_capture_worker() {
				capture_panic(info, timeout);
			}
			if let Some(hook) = lock(&previous).as_ref() {
				hook(info);
			}
		}));
		Ok(())
	}

	fn uninstall_handler(&self) {
		self.enabled.store(false, Ordering::Release);
		if std::thread::panicking() {
			return;
		}
		if let Some(previous) = lock(&self.previous).take() {
			std::panic::set_hook(previous);
		}
	}

	fn capture_state(&self, raw: &RawCapture) -> CapturedFault {
		captured_fault(
			FaultKind::Panic {
				message: raw.message().to_string(),
				location: raw.location().map(str::to_string),
			},
			raw,
		)
	}
}

fn capture_panic(info: &PanicHookInfo<'_>, timeout: Duration) {
	let _turn = lock(&PANIC_LOCK);
	let thread_id = system::current_thread_id();
	if !SLOT.try_acquire(thread_id) {
		debug!("capture slot unavailable, panic not captured");
		return;
	}

	let now = raw::now_ns();
	// SAFETY: acquired above; the worker only reads it once requested below.
	let capture = unsafe { SLOT.get_mut() };
	capture.reset();
	capture.thread_id = thread_id;
	capture.timestamp_ns = now;
	capture.set_message(&panic_message(info));
	if let Some(location) = info.location() {
		capture.set_location(&format!(
			"{}:{}:{}",
			location.file(),
			location.line(),
			location.column()
		));
	}
	backtrace::trace(|frame| capture.push_frame(frame.ip() as usize as u64));

	match handoff::request(CaptureKind::Panic) {
		RequestOutcome::Acknowledged => raw::note_panic(thread_id),
		RequestOutcome::TimedOut => {
			raw::note_panic(thread_id);
			let error = CaptureError::HandoffTimeout {
				timeout_ms: timeout.as_millis() as u64,
			};
			warn!(error = %error, "panic report not confirmed before continuing");
		}
		RequestOutcome::Unavailable => {
			SLOT.release();
			debug!("capture worker not running, panic not captured");
		}
	}
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
	if let Some(s) = info.payload().downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = info.payload().downcast_ref::<String>() {
		s.clone()
	} else {
		"Box<dyn Any>".to_string()
	}
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
