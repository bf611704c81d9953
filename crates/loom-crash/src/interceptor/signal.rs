// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fatal signal handlers.
//!
//! The handler only calls async-signal-safe functions: it fills the static
//! slot, hands it to the capture worker, restores the previous handlers and
//! re-raises so the process dies the way it would have without us.

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::c_int;
use loom_crash_core::{CaptureError, FaultKind};

use super::handoff;
use super::raw::{self, CaptureKind, RawCapture, SLOT};
use super::{captured_fault, FaultBackend};
use crate::builder::CapturedFault;
use crate::system;

pub(crate) const FATAL_SIGNALS: [c_int; 7] = [
	libc::SIGSEGV,
	libc::SIGBUS,
	libc::SIGILL,
	libc::SIGFPE,
	libc::SIGABRT,
	libc::SIGTRAP,
	libc::SIGSYS,
];

const ALT_STACK_SIZE: usize = 64 * 1024;

struct PreviousActions {
	saved: AtomicBool,
	actions: UnsafeCell<MaybeUninit<[libc::sigaction; FATAL_SIGNALS.len()]>>,
}

// SAFETY: `actions` is written by install before `saved` is set and only read
// after observing `saved`.
unsafe impl Sync for PreviousActions {}

static PREVIOUS: PreviousActions = PreviousActions {
	saved: AtomicBool::new(false),
	actions: UnsafeCell::new(MaybeUninit::uninit()),
};

static ALT_STACK_INSTALLED: AtomicBool = AtomicBool::new(false);

pub(crate) struct SignalBackend;

impl FaultBackend for SignalBackend {
	fn name(&self) -> &'static str {
		"signal"
	}

	fn kind(&self) -> CaptureKind {
		CaptureKind::Signal
	}

	fn install_handler(&self) -> Result<(), CaptureError> {
		if PREVIOUS.saved.load(Ordering::Acquire) {
			return Err(install_error("signal handlers", "already installed"));
		}
		ensure_alt_stack()?;
		// The first walk initializes unwinder state; do it here, not in the handler.
		backtrace::trace(|_| false);

		// SAFETY: handlers are not installed yet, so nothing reads `actions`.
		let previous = unsafe { (*PREVIOUS.actions.get()).write(mem::zeroed()) };

		for (index, &signal) in FATAL_SIGNALS.iter().enumerate() {
			// SAFETY: a zeroed sigaction is valid; every field we rely on is set below.
			let mut action: libc::sigaction = unsafe { mem::zeroed() };
			action.sa_sigaction = handle_fault as usize;
			action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
			// SAFETY: sa_mask is a valid sigset_t; the pointers outlive the calls.
			let rc = unsafe {
				libc::sigemptyset(&mut action.sa_mask);
				libc::sigaction(signal, &action, &mut previous[index])
			};
			if rc != 0 {
				let reason = std::io::Error::last_os_error().to_string();
				for (earlier, &installed) in FATAL_SIGNALS[..index].iter().enumerate() {
					// SAFETY: restoring actions saved by the calls above.
					unsafe { libc::sigaction(installed, &previous[earlier], ptr::null_mut()) };
				}
				return Err(install_error(signal_name(signal), &reason));
			}
		}

		PREVIOUS.saved.store(true, Ordering::Release);
		Ok(())
	}

	fn uninstall_handler(&self) {
		restore_previous();
	}

	fn capture_state(&self, raw: &RawCapture) -> CapturedFault {
		captured_fault(
			FaultKind::Signal {
				signal: raw.signal,
				code: raw.code,
				name: signal_name(raw.signal).to_string(),
				address: raw.address,
			},
			raw,
		)
	}
}

fn pause() {
	// SAFETY: poll with no descriptors only sleeps; it is async-signal-safe.
	unsafe { libc::poll(std::ptr::null_mut(), 0, 1) };
}

extern "C" fn handle_fault(signal: c_int, info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
	let thread_id = system::current_thread_id();
	let now = raw::now_ns();

	// The panic hook already reported this one.
	let aborting_panic = signal == libc::SIGABRT && raw::is_abort_after_panic(thread_id);
	// Another thread's capture gets the handoff timeout to finish. A slot held
	// by this thread or needed by the worker means this fault happened while
	// capturing another one.
	if !aborting_panic
		&& SLOT.acquire_waiting(
			thread_id,
			handoff::worker_thread_id(),
			handoff::timeout_ns(),
			pause,
		) {
		// SAFETY: acquired above; nothing else touches the slot until the
		// worker is asked to read it.
		let capture = unsafe { SLOT.get_mut() };
		capture.reset();
		capture.signal = signal;
		capture.thread_id = thread_id;
		capture.timestamp_ns = now;
		if !info.is_null() {
			// SAFETY: the kernel passes a valid siginfo_t with SA_SIGINFO.
			unsafe {
				capture.code = (*info).si_code;
				capture.address = fault_address(info);
			}
		}
		// SAFETY: no other stack walk can hold the unwinder lock on behalf of
		// this handler; the walk itself does not allocate.
		unsafe {
			backtrace::trace_unsynchronized(|frame| capture.push_frame(frame.ip() as usize as u64));
		}

		let _ = handoff::request(CaptureKind::Signal);
		SLOT.terminate();
	}

	restore_previous();
	// SAFETY: raise is async-signal-safe. The signal is blocked while this
	// handler runs and is delivered to the restored handler on return.
	unsafe { libc::raise(signal) };
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> u64 {
	(*info).si_addr() as usize as u64
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const libc::siginfo_t) -> u64 {
	(*info).si_addr as usize as u64
}

/// Async-signal-safe.
fn restore_previous() {
	if !PREVIOUS.saved.swap(false, Ordering::AcqRel) {
		return;
	}
	// SAFETY: `saved` was set, so `actions` was initialized by install.
	let previous = unsafe { (*PREVIOUS.actions.get()).assume_init_ref() };
	for (index, &signal) in FATAL_SIGNALS.iter().enumerate() {
		// SAFETY: restoring an action returned by sigaction.
		unsafe { libc::sigaction(signal, &previous[index], ptr::null_mut()) };
	}
}

/// Stack overflows run the handler on a stack of its own. Only the
/// installing thread gets one; threads that set up their own keep theirs.
fn ensure_alt_stack() -> Result<(), CaptureError> {
	if ALT_STACK_INSTALLED.load(Ordering::Acquire) {
		return Ok(());
	}

	// SAFETY: querying the current alternate stack into a zeroed stack_t.
	let mut current: libc::stack_t = unsafe { mem::zeroed() };
	if unsafe { libc::sigaltstack(ptr::null(), &mut current) } != 0 {
		return Err(install_error(
			"sigaltstack",
			&std::io::Error::last_os_error().to_string(),
		));
	}
	if current.ss_flags & libc::SS_DISABLE == 0 {
		return Ok(());
	}

	// Lives for the rest of the process: a thread may be executing on it.
	let stack: &'static mut [u8] = Box::leak(vec![0u8; ALT_STACK_SIZE].into_boxed_slice());
	// SAFETY: zeroed stack_t, then every field set.
	let mut alt: libc::stack_t = unsafe { mem::zeroed() };
	alt.ss_sp = stack.as_mut_ptr() as *mut libc::c_void;
	alt.ss_size = ALT_STACK_SIZE;
	alt.ss_flags = 0;
	if unsafe { libc::sigaltstack(&alt, ptr::null_mut()) } != 0 {
		return Err(install_error(
			"sigaltstack",
			&std::io::Error::last_os_error().to_string(),
		));
	}

	ALT_STACK_INSTALLED.store(true, Ordering::Release);
	Ok(())
}

pub(crate) fn signal_name(signal: c_int) -> &'static str {
	match signal {
		libc::SIGSEGV => "SIGSEGV",
		libc::SIGBUS => "SIGBUS",
		libc::SIGILL => "SIGILL",
		libc::SIGFPE => "SIGFPE",
		libc::SIGABRT => "SIGABRT",
		libc::SIGTRAP => "SIGTRAP",
		libc::SIGSYS => "SIGSYS",
		_ => "UNKNOWN",
	}
}

fn install_error(target: &str, reason: &str) -> CaptureError {
	CaptureError::HandlerInstall {
		target: target.to_string(),
		reason: reason.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::interceptor::tests::PROCESS_WIDE;

	fn current_action(signal: c_int) -> libc::sigaction {
		// SAFETY: querying into a zeroed sigaction.
		unsafe {
			let mut action: libc::sigaction = mem::zeroed();
			libc::sigaction(signal, ptr::null(), &mut action);
			action
		}
	}

	#[test]
	fn install_and_uninstall_restore_previous_actions() {
		let _guard = PROCESS_WIDE.lock().unwrap_or_else(|e| e.into_inner());
		let before: Vec<usize> = FATAL_SIGNALS
			.iter()
			.map(|&s| current_action(s).sa_sigaction)
			.collect();

		SignalBackend.install_handler().unwrap();
		for &signal in &FATAL_SIGNALS {
			let action = current_action(signal);
			assert_eq!(action.sa_sigaction, handle_fault as usize);
			assert_ne!(action.sa_flags & libc::SA_ONSTACK, 0);
		}
		assert!(matches!(
			SignalBackend.install_handler(),
			Err(CaptureError::HandlerInstall { .. })
		));

		SignalBackend.uninstall_handler();
		let after: Vec<usize> = FATAL_SIGNALS
			.iter()
			.map(|&s| current_action(s).sa_sigaction)
			.collect();
		assert_eq!(before, after);

		// Uninstalling twice is harmless.
		SignalBackend.uninstall_handler();
	}

	#[test]
	fn install_sets_up_alternate_stack() {
		let _guard = PROCESS_WIDE.lock().unwrap_or_else(|e| e.into_inner());
		ensure_alt_stack().unwrap();

		// SAFETY: querying into a zeroed stack_t.
		let mut current: libc::stack_t = unsafe { mem::zeroed() };
		assert_eq!(unsafe { libc::sigaltstack(ptr::null(), &mut current) }, 0);
		if ALT_STACK_INSTALLED.load(Ordering::Acquire) {
			assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
		}
	}

	#[test]
	fn signal_names() {
		assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
		assert_eq!(signal_name(libc::SIGABRT), "SIGABRT");
		assert_eq!(signal_name(libc::SIGUSR1), "UNKNOWN");
	}

	#[test]
	fn slot_decodes_to_signal_fault() {
		let slot = raw::RawSlot::new();
		assert!(slot.try_acquire(1));
		// SAFETY: acquired above, single reference.
		let capture = unsafe { slot.get_mut() };
		capture.reset();
		capture.signal = libc::SIGSEGV;
		capture.code = 1;
		capture.address = 0x10;
		capture.thread_id = 99;
		capture.timestamp_ns = raw::now_ns();
		capture.push_frame(0x5000);
		capture.push_frame(0x6000);

		let fault = SignalBackend.capture_state(capture);
		assert_eq!(
			fault.kind,
			FaultKind::Signal {
				signal: libc::SIGSEGV,
				code: 1,
				name: "SIGSEGV".to_string(),
				address: 0x10,
			}
		);
		assert!(fault.kind.is_critical());
		assert_eq!(fault.addresses, vec![0x5000, 0x6000]);
		assert_eq!(fault.thread_id, 99);
	}
}
