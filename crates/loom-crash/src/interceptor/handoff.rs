// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Handoff from a faulting thread to the capture worker.
//!
//! On unix the faulting thread writes one byte naming the capture kind into a
//! request pipe and polls an acknowledgement pipe, both created before any
//! fault can happen. The worker thread builds and persists the report from
//! the raw slot and acknowledges. Only `read`, `write` and `poll` run on the
//! faulting side.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use loom_crash_core::CaptureError;
use tracing::error;

use super::raw::CaptureKind;

/// Runs on the worker for every handed-off capture.
pub(crate) type Dispatch = Arc<dyn Fn(CaptureKind) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOutcome {
	Acknowledged,
	/// The worker got the request but did not answer in time.
	TimedOut,
	/// No worker is running; the request never left this thread.
	Unavailable,
}

thread_local! {
	static IN_CAPTURE_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is the capture worker itself.
pub(crate) fn is_capture_worker() -> bool {
	IN_CAPTURE_WORKER.with(Cell::get)
}

fn run_dispatch(dispatch: &Dispatch, kind: CaptureKind) {
	if catch_unwind(AssertUnwindSafe(|| dispatch(kind))).is_err() {
		error!(?kind, "capture worker panicked while building report");
	}
}

#[cfg(unix)]
pub(crate) use self::pipe::{request, timeout_ns, worker_thread_id, Handoff};

#[cfg(not(unix))]
pub(crate) use self::inline::{request, Handoff};

#[cfg(unix)]
mod pipe {
	use std::io;
	use std::os::unix::io::RawFd;
	use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
	use std::thread::JoinHandle;

	use super::*;

	const SHUTDOWN: u8 = 0;
	const ACK: u8 = 1;

	/// Write end of the request pipe.
	static REQUEST_FD: AtomicI32 = AtomicI32::new(-1);
	/// Read end of the acknowledgement pipe (non-blocking).
	static ACK_FD: AtomicI32 = AtomicI32::new(-1);
	static TIMEOUT_MS: AtomicI32 = AtomicI32::new(5_000);
	/// OS thread id of the running worker, 0 when none.
	static WORKER_TID: AtomicU64 = AtomicU64::new(0);

	pub(crate) struct Handoff {
		worker: Option<JoinHandle<()>>,
		request_write: RawFd,
		ack_read: RawFd,
	}

	impl Handoff {
		pub(crate) fn spawn(dispatch: Dispatch, timeout: Duration) -> Result<Self, CaptureError> {
			if REQUEST_FD.load(Ordering::Acquire) >= 0 {
				return Err(install_error("handoff already active"));
			}

			let (request_read, request_write) = make_pipe()?;
			let (ack_read, ack_write) = match make_pipe() {
				Ok(fds) => fds,
				Err(e) => {
					close_fds(&[request_read, request_write]);
					return Err(e);
				}
			};
			if let Err(e) = set_nonblocking(ack_read) {
				close_fds(&[request_read, request_write, ack_read, ack_write]);
				return Err(e);
			}

			let worker = std::thread::Builder::new()
				.name("loom-crash-capture".to_string())
				.spawn(move || serve(request_read, ack_write, dispatch))
				.map_err(|e| {
					close_fds(&[request_read, request_write, ack_read, ack_write]);
					install_error(&e.to_string())
				})?;

			let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
			TIMEOUT_MS.store(timeout_ms, Ordering::Release);
			ACK_FD.store(ack_read, Ordering::Release);
			REQUEST_FD.store(request_write, Ordering::Release);

			Ok(Self {
				worker: Some(worker),
				request_write,
				ack_read,
			})
		}
	}

	impl Drop for Handoff {
		fn drop(&mut self) {
			REQUEST_FD.store(-1, Ordering::Release);
			ACK_FD.store(-1, Ordering::Release);

			let byte = SHUTDOWN;
			// SAFETY: request_write is open until closed below.
			unsafe { libc::write(self.request_write, &byte as *const u8 as *const libc::c_void, 1) };
			if let Some(worker) = self.worker.take() {
				let _ = worker.join();
			}
			WORKER_TID.store(0, Ordering::Release);
			close_fds(&[self.request_write, self.ack_read]);
		}
	}

	pub(crate) fn worker_thread_id() -> u64 {
		WORKER_TID.load(Ordering::Acquire)
	}

	/// How long a faulting thread waits on the worker.
	pub(crate) fn timeout_ns() -> i64 {
		i64::from(TIMEOUT_MS.load(Ordering::Acquire)) * 1_000_000
	}

	/// Hand the current slot to the worker and wait for it.
	///
	/// Async-signal-safe.
	pub(crate) fn request(kind: CaptureKind) -> RequestOutcome {
		let request_fd = REQUEST_FD.load(Ordering::Acquire);
		let ack_fd = ACK_FD.load(Ordering::Acquire);
		if request_fd < 0 || ack_fd < 0 {
			return RequestOutcome::Unavailable;
		}

		// Drop acknowledgements of earlier requests that timed out.
		let mut byte = 0u8;
		// SAFETY: ack_fd is a non-blocking pipe read end; byte is a valid buffer.
		while unsafe { libc::read(ack_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) } == 1 {}

		let kind_byte = kind as u8;
		loop {
			// SAFETY: request_fd is an open pipe write end.
			let written =
				unsafe { libc::write(request_fd, &kind_byte as *const u8 as *const libc::c_void, 1) };
			if written == 1 {
				break;
			}
			if written < 0 && interrupted() {
				continue;
			}
			return RequestOutcome::Unavailable;
		}

		let timeout_ms = TIMEOUT_MS.load(Ordering::Acquire);
		let mut pollfd = libc::pollfd {
			fd: ack_fd,
			events: libc::POLLIN,
			revents: 0,
		};
		loop {
			// SAFETY: pollfd is valid for one element.
			let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
			if ready > 0 {
				// SAFETY: as above.
				unsafe { libc::read(ack_fd, &mut byte as *mut u8 as *mut libc::c_void, 1) };
				return RequestOutcome::Acknowledged;
			}
			if ready < 0 && interrupted() {
				continue;
			}
			return RequestOutcome::TimedOut;
		}
	}

	fn serve(request_read: RawFd, ack_write: RawFd, dispatch: Dispatch) {
		IN_CAPTURE_WORKER.with(|flag| flag.set(true));
		WORKER_TID.store(crate::system::current_thread_id(), Ordering::Release);

		loop {
			let mut byte = 0u8;
			// SAFETY: request_read is owned by this thread; byte is a valid buffer.
			let n = unsafe { libc::read(request_read, &mut byte as *mut u8 as *mut libc::c_void, 1) };
			if n < 0 && interrupted() {
				continue;
			}
			if n != 1 {
				break;
			}
			let Some(kind) = CaptureKind::from_byte(byte) else {
				break;
			};

			run_dispatch(&dispatch, kind);

			let ack = ACK;
			// SAFETY: ack_write is owned by this thread.
			unsafe { libc::write(ack_write, &ack as *const u8 as *const libc::c_void, 1) };
		}

		close_fds(&[request_read, ack_write]);
	}

	fn interrupted() -> bool {
		io::Error::last_os_error().kind() == io::ErrorKind::Interrupted
	}

	fn make_pipe() -> Result<(RawFd, RawFd), CaptureError> {
		let mut fds = [-1 as RawFd; 2];
		// SAFETY: fds has room for the two descriptors pipe writes.
		if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
			return Err(install_error(&io::Error::last_os_error().to_string()));
		}
		for fd in fds {
			// SAFETY: fd was just returned by pipe.
			unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
		}
		Ok((fds[0], fds[1]))
	}

	fn set_nonblocking(fd: RawFd) -> Result<(), CaptureError> {
		// SAFETY: fd is an open descriptor.
		let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
		if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
			return Err(install_error(&io::Error::last_os_error().to_string()));
		}
		Ok(())
	}

	fn close_fds(fds: &[RawFd]) {
		for &fd in fds {
			// SAFETY: each fd is owned by the caller and closed once.
			unsafe { libc::close(fd) };
		}
	}

	fn install_error(reason: &str) -> CaptureError {
		CaptureError::HandlerInstall {
			target: "capture worker".to_string(),
			reason: reason.to_string(),
		}
	}
}

#[cfg(not(unix))]
mod inline {
	use std::sync::Mutex;

	use super::*;

	static DISPATCH: Mutex<Option<Dispatch>> = Mutex::new(None);

	/// Without signals every capture starts on a healthy thread, so the
	/// report is built right there.
	pub(crate) struct Handoff;

	impl Handoff {
		pub(crate) fn spawn(dispatch: Dispatch, _timeout: Duration) -> Result<Self, CaptureError> {
			let mut slot = DISPATCH.lock().unwrap_or_else(|p| p.into_inner());
			if slot.is_some() {
				return Err(CaptureError::HandlerInstall {
					target: "capture worker".to_string(),
					reason: "handoff already active".to_string(),
				});
			}
			*slot = Some(dispatch);
			Ok(Self)
		}
	}

	impl Drop for Handoff {
		fn drop(&mut self) {
			*DISPATCH.lock().unwrap_or_else(|p| p.into_inner()) = None;
		}
	}

	pub(crate) fn request(kind: CaptureKind) -> RequestOutcome {
		let dispatch = DISPATCH.lock().unwrap_or_else(|p| p.into_inner()).clone();
		let Some(dispatch) = dispatch else {
			return RequestOutcome::Unavailable;
		};

		IN_CAPTURE_WORKER.with(|flag| flag.set(true));
		run_dispatch(&dispatch, kind);
		IN_CAPTURE_WORKER.with(|flag| flag.set(false));
		RequestOutcome::Acknowledged
	}
}
