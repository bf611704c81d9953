// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The statically allocated slot fault handlers write into.
//!
//! Nothing here allocates or locks: it is used from signal handlers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::builder::MAX_FRAMES;

pub(crate) const MAX_MESSAGE: usize = 2048;
pub(crate) const MAX_LOCATION: usize = 512;

const IDLE: u8 = 0;
const BUSY: u8 = 1;
/// A fatal fault was handed off; the process is going down.
const TERMINAL: u8 = 2;

/// Thread whose panic was last captured.
static LAST_PANIC_TID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CaptureKind {
	Signal = 1,
	Panic = 2,
}

impl CaptureKind {
	pub(crate) fn from_byte(byte: u8) -> Option<Self> {
		match byte {
			1 => Some(Self::Signal),
			2 => Some(Self::Panic),
			_ => None,
		}
	}
}

pub(crate) struct RawCapture {
	pub signal: i32,
	pub code: i32,
	pub address: u64,
	pub thread_id: u64,
	/// Wall clock, nanoseconds since the unix epoch.
	pub timestamp_ns: i64,
	frames: [u64; MAX_FRAMES],
	frame_count: usize,
	truncated: bool,
	message: [u8; MAX_MESSAGE],
	message_len: usize,
	location: [u8; MAX_LOCATION],
	location_len: usize,
}

impl RawCapture {
	const fn new() -> Self {
		Self {
			signal: 0,
			code: 0,
			address: 0,
			thread_id: 0,
			timestamp_ns: 0,
			frames: [0; MAX_FRAMES],
			frame_count: 0,
			truncated: false,
			message: [0; MAX_MESSAGE],
			message_len: 0,
			location: [0; MAX_LOCATION],
			location_len: 0,
		}
	}

	pub(crate) fn reset(&mut self) {
		self.signal = 0;
		self.code = 0;
		self.address = 0;
		self.thread_id = 0;
		self.timestamp_ns = 0;
		self.frame_count = 0;
		self.truncated = false;
		self.message_len = 0;
		self.location_len = 0;
	}

	/// Returns false once the frame buffer is full.
	pub(crate) fn push_frame(&mut self, address: u64) -> bool {
		if self.frame_count == MAX_FRAMES {
			self.truncated = true;
			return false;
		}
		self.frames[self.frame_count] = address;
		self.frame_count += 1;
		true
	}

	pub(crate) fn frames(&self) -> &[u64] {
		&self.frames[..self.frame_count]
	}

	pub(crate) fn is_truncated(&self) -> bool {
		self.truncated
	}

	pub(crate) fn set_message(&mut self, message: &str) {
		self.message_len = copy_truncated(&mut self.message, message);
	}

	pub(crate) fn message(&self) -> &str {
		std::str::from_utf8(&self.message[..self.message_len]).unwrap_or_default()
	}

	pub(crate) fn set_location(&mut self, location: &str) {
		self.location_len = copy_truncated(&mut self.location, location);
	}

	pub(crate) fn location(&self) -> Option<&str> {
		match self.location_len {
			0 => None,
			len => std::str::from_utf8(&self.location[..len]).ok(),
		}
	}
}

/// Copy as much of `src` as fits without splitting a character.
fn copy_truncated(dst: &mut [u8], src: &str) -> usize {
	let mut len = src.len().min(dst.len());
	while !src.is_char_boundary(len) {
		len -= 1;
	}
	dst[..len].copy_from_slice(&src.as_bytes()[..len]);
	len
}

/// One capture at a time: IDLE -> BUSY -> IDLE (panic) or TERMINAL (signal).
pub(crate) struct RawSlot {
	state: AtomicU8,
	/// OS thread id of the thread that acquired the slot.
	holder: AtomicU64,
	data: UnsafeCell<RawCapture>,
}

// SAFETY: `data` is only touched by the thread that moved `state` from IDLE to
// BUSY, and by the capture worker while that thread waits for it.
unsafe impl Sync for RawSlot {}

pub(crate) static SLOT: RawSlot = RawSlot::new();

impl RawSlot {
	pub(crate) const fn new() -> Self {
		Self {
			state: AtomicU8::new(IDLE),
			holder: AtomicU64::new(0),
			data: UnsafeCell::new(RawCapture::new()),
		}
	}

	pub(crate) fn try_acquire(&self, thread_id: u64) -> bool {
		let acquired = self
			.state
			.compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
			.is_ok();
		if acquired {
			self.holder.store(thread_id, Ordering::Release);
		}
		acquired
	}

	/// Acquire for `thread_id`, waiting up to `timeout_ns` while another
	/// thread's capture holds the slot. `pause` runs between attempts.
	///
	/// Gives up at once when the slot is terminal, when `thread_id` already
	/// holds it (a fault inside its own capture), or when `thread_id` is the
	/// capture `worker` that the holder is waiting for.
	///
	/// Async-signal-safe as long as `pause` is.
	pub(crate) fn acquire_waiting(
		&self,
		thread_id: u64,
		worker: u64,
		timeout_ns: i64,
		mut pause: impl FnMut(),
	) -> bool {
		let deadline = now_ns().saturating_add(timeout_ns);
		loop {
			if self.try_acquire(thread_id) {
				return true;
			}
			match self.state.load(Ordering::Acquire) {
				TERMINAL => return false,
				BUSY if self.holder.load(Ordering::Acquire) == thread_id || thread_id == worker => {
					return false
				}
				_ => {}
			}
			if now_ns() >= deadline {
				return false;
			}
			pause();
		}
	}

	/// # Safety
	/// The caller must hold the slot (a successful [`RawSlot::try_acquire`]
	/// not yet followed by a release), and no other reference may be live.
	#[allow(clippy::mut_from_ref)]
	pub(crate) unsafe fn get_mut(&self) -> &mut RawCapture {
		&mut *self.data.get()
	}

	/// # Safety
	/// The slot must be held by a thread that is blocked waiting for the
	/// caller, so nothing writes to it concurrently.
	pub(crate) unsafe fn get(&self) -> &RawCapture {
		&*self.data.get()
	}

	pub(crate) fn release(&self) {
		let _ = self
			.state
			.compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire);
	}

	pub(crate) fn terminate(&self) {
		self.state.store(TERMINAL, Ordering::Release);
	}

	#[cfg(test)]
	pub(crate) fn is_terminal(&self) -> bool {
		self.state.load(Ordering::Acquire) == TERMINAL
	}
}

/// Wall clock in nanoseconds. Async-signal-safe on unix.
pub(crate) fn now_ns() -> i64 {
	#[cfg(unix)]
	{
		// SAFETY: timespec is plain old data and a valid out pointer.
		let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
		unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
		ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
	}
	#[cfg(not(unix))]
	{
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_nanos() as i64)
			.unwrap_or(0)
	}
}

/// Called once a panic on `thread_id` was handed to the worker.
pub(crate) fn note_panic(thread_id: u64) {
	LAST_PANIC_TID.store(thread_id, Ordering::Release);
}

/// Whether a SIGABRT on `thread_id` comes from the panic runtime aborting a
/// panic that was already captured (`panic = "abort"`, or an abort while
/// unwinding). A panic that was caught is over, so a later abort on the same
/// thread is a fault of its own.
///
/// `thread::panicking` reads an atomic and a const thread local, which is
/// safe in a signal handler.
pub(crate) fn is_abort_after_panic(thread_id: u64) -> bool {
	LAST_PANIC_TID.load(Ordering::Acquire) == thread_id && std::thread::panicking()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::interceptor::tests::PROCESS_WIDE;
	use std::panic::AssertUnwindSafe;
	use std::sync::atomic::AtomicBool;
	use std::sync::{mpsc, Arc};
	use std::time::{Duration, Instant};

	#[test]
	fn slot_is_exclusive_until_released() {
		let slot = RawSlot::new();
		assert!(slot.try_acquire(1));
		assert!(!slot.try_acquire(2));
		slot.release();
		assert!(slot.try_acquire(2));
	}

	#[test]
	fn terminal_slot_never_reopens() {
		let slot = RawSlot::new();
		assert!(slot.try_acquire(1));
		slot.terminate();
		slot.release();
		assert!(slot.is_terminal());
		assert!(!slot.try_acquire(1));
		assert!(!slot.acquire_waiting(2, 0, 1_000_000_000, || panic!("must not wait")));
	}

	#[test]
	fn waits_for_capture_on_another_thread() {
		let slot: &'static RawSlot = Box::leak(Box::new(RawSlot::new()));
		let (held_tx, held_rx) = mpsc::channel();

		let holder = std::thread::spawn(move || {
			assert!(slot.try_acquire(100));
			held_tx.send(()).unwrap();
			std::thread::sleep(Duration::from_millis(50));
			slot.release();
		});
		held_rx.recv().unwrap();

		let started = Instant::now();
		let acquired = slot.acquire_waiting(200, 0, 5_000_000_000, || {
			std::thread::sleep(Duration::from_millis(1))
		});
		assert!(acquired);
		assert!(started.elapsed() >= Duration::from_millis(30));
		holder.join().unwrap();
	}

	#[test]
	fn wait_gives_up_after_timeout() {
		let slot = RawSlot::new();
		assert!(slot.try_acquire(100));

		let started = Instant::now();
		let acquired = slot.acquire_waiting(200, 0, 20_000_000, || {
			std::thread::sleep(Duration::from_millis(1))
		});
		assert!(!acquired);
		assert!(started.elapsed() >= Duration::from_millis(20));
	}

	#[test]
	fn no_wait_on_own_capture_or_from_worker() {
		let slot = RawSlot::new();
		assert!(slot.try_acquire(100));

		let mut pauses = 0;
		assert!(!slot.acquire_waiting(100, 0, 1_000_000_000, || pauses += 1));
		assert!(!slot.acquire_waiting(300, 300, 1_000_000_000, || pauses += 1));
		assert_eq!(pauses, 0);
	}

	#[test]
	fn frames_stop_at_capacity() {
		let slot = RawSlot::new();
		assert!(slot.try_acquire(1));
		// SAFETY: acquired above, single reference.
		let raw = unsafe { slot.get_mut() };
		raw.reset();

		for address in 0..MAX_FRAMES as u64 {
			assert!(raw.push_frame(address));
		}
		assert!(!raw.push_frame(999));
		assert!(raw.is_truncated());
		assert_eq!(raw.frames().len(), MAX_FRAMES);
		assert_eq!(raw.frames()[MAX_FRAMES - 1], MAX_FRAMES as u64 - 1);
	}

	#[test]
	fn message_is_truncated_on_char_boundary() {
		let slot = RawSlot::new();
		assert!(slot.try_acquire(1));
		// SAFETY: acquired above, single reference.
		let raw = unsafe { slot.get_mut() };

		let long = "é".repeat(MAX_MESSAGE);
		raw.set_message(&long);
		assert_eq!(raw.message().len(), MAX_MESSAGE);
		assert!(raw.message().chars().all(|c| c == 'é'));

		raw.set_location("src/main.rs:4:9");
		assert_eq!(raw.location(), Some("src/main.rs:4:9"));
		raw.reset();
		assert_eq!(raw.location(), None);
		assert_eq!(raw.message(), "");
	}

	struct CheckWhileUnwinding(u64, Arc<AtomicBool>);

	impl Drop for CheckWhileUnwinding {
		fn drop(&mut self) {
			self.1.store(is_abort_after_panic(self.0), Ordering::SeqCst);
		}
	}

	#[test]
	fn abort_counts_as_panic_only_while_unwinding() {
		// The panic below must not reach an installed hook.
		let _process = PROCESS_WIDE.lock().unwrap_or_else(|p| p.into_inner());
		let thread_id = crate::system::current_thread_id();
		note_panic(thread_id);

		let seen = Arc::new(AtomicBool::new(false));
		let guard = CheckWhileUnwinding(thread_id, Arc::clone(&seen));
		let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
			let _guard = guard;
			panic!("unwinding");
		}));
		assert!(result.is_err());
		assert!(seen.load(Ordering::SeqCst));

		// Recovered: a later abort is not the panic's.
		assert!(!is_abort_after_panic(thread_id));
	}

	#[test]
	fn abort_on_other_thread_is_not_the_panic() {
		let _process = PROCESS_WIDE.lock().unwrap_or_else(|p| p.into_inner());
		note_panic(4242);
		assert!(!is_abort_after_panic(4243));
	}

	#[test]
	fn capture_kind_bytes() {
		assert_eq!(CaptureKind::from_byte(CaptureKind::Signal as u8), Some(CaptureKind::Signal));
		assert_eq!(CaptureKind::from_byte(CaptureKind::Panic as u8), Some(CaptureKind::Panic));
		assert_eq!(CaptureKind::from_byte(0), None);
	}
}
