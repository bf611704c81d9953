// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process and host information gathered at capture time.

use loom_crash_core::{AppContext, BinaryImage, CaptureError, DeviceContext, OsContext};

pub const SDK_NAME: &str = "loom-crash-rust";
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// OS thread id of the calling thread. Async-signal-safe.
pub fn current_thread_id() -> u64 {
	#[cfg(any(target_os = "linux", target_os = "android"))]
	{
		// SAFETY: gettid has no preconditions.
		unsafe { libc::syscall(libc::SYS_gettid) as u64 }
	}
	#[cfg(target_os = "macos")]
	{
		let mut tid: u64 = 0;
		// SAFETY: a null thread means the calling thread; tid is a valid out pointer.
		unsafe { libc::pthread_threadid_np(0, &mut tid) };
		tid
	}
	#[cfg(all(unix, not(any(target_os = "linux", target_os = "android", target_os = "macos"))))]
	{
		// SAFETY: pthread_self has no preconditions.
		unsafe { libc::pthread_self() as u64 }
	}
	#[cfg(not(unix))]
	{
		use std::hash::{Hash, Hasher};
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		std::thread::current().id().hash(&mut hasher);
		hasher.finish()
	}
}

/// A thread of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
	pub thread_id: u64,
	pub name: Option<String>,
}

/// Threads of the current process, sorted by id.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn enumerate_threads() -> Result<Vec<ThreadInfo>, CaptureError> {
	let tasks = std::fs::read_dir("/proc/self/task")
		.map_err(|e| CaptureError::ThreadEnumeration(e.to_string()))?;

	let mut threads = Vec::new();
	for task in tasks {
		let task = task.map_err(|e| CaptureError::ThreadEnumeration(e.to_string()))?;
		let Some(thread_id) = task.file_name().to_str().and_then(|n| n.parse().ok()) else {
			continue;
		};
		let name = std::fs::read_to_string(task.path().join("comm"))
			.ok()
			.map(|comm| comm.trim_end().to_string())
			.filter(|comm| !comm.is_empty());
		threads.push(ThreadInfo { thread_id, name });
	}
	threads.sort_by_key(|t| t.thread_id);
	Ok(threads)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn enumerate_threads() -> Result<Vec<ThreadInfo>, CaptureError> {
	Err(CaptureError::ThreadEnumeration(format!(
		"not supported on {}",
		std::env::consts::OS
	)))
}

/// Executable mappings of the current process.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn binary_images() -> Vec<BinaryImage> {
	match std::fs::read_to_string("/proc/self/maps") {
		Ok(maps) => parse_maps(&maps),
		Err(e) => {
			tracing::debug!(error = %e, "cannot read /proc/self/maps");
			Vec::new()
		}
	}
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn binary_images() -> Vec<BinaryImage> {
	Vec::new()
}

/// Parse `/proc/<pid>/maps`, keeping file-backed executable mappings.
pub fn parse_maps(maps: &str) -> Vec<BinaryImage> {
	maps.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<BinaryImage> {
	// 7f3c1a200000-7f3c1a3c5000 r-xp 00028000 fd:01 1835123    /usr/lib/libc.so.6
	let mut fields = line.split_whitespace();
	let range = fields.next()?;
	let perms = fields.next()?;
	let offset = fields.next()?;
	let _dev = fields.next()?;
	let _inode = fields.next()?;
	let path = fields.collect::<Vec<_>>().join(" ");

	if !perms.contains('x') || !path.starts_with('/') {
		return None;
	}

	let (start, end) = range.split_once('-')?;
	Some(BinaryImage {
		path,
		start: u64::from_str_radix(start, 16).ok()?,
		end: u64::from_str_radix(end, 16).ok()?,
		offset: u64::from_str_radix(offset, 16).ok()?,
	})
}

pub fn os_context() -> OsContext {
	let mut context = OsContext {
		name: Some(std::env::consts::OS.to_string()),
		..Default::default()
	};
	#[cfg(unix)]
	if let Some(uts) = uname() {
		context.version = Some(uts.release);
		context.build = Some(uts.version);
	}
	context
}

pub fn device_context() -> DeviceContext {
	#[cfg(unix)]
	let hostname = uname().map(|uts| uts.nodename);
	#[cfg(not(unix))]
	let hostname = None;

	DeviceContext {
		hostname,
		arch: Some(std::env::consts::ARCH.to_string()),
		cpu_count: std::thread::available_parallelism()
			.ok()
			.map(|n| n.get() as u32),
	}
}

/// Process identity; launch counters are filled in from the app state.
pub fn app_context() -> AppContext {
	let executable = std::env::current_exe().ok();
	AppContext {
		process_name: executable
			.as_ref()
			.and_then(|p| p.file_name())
			.map(|n| n.to_string_lossy().into_owned()),
		process_id: Some(std::process::id()),
		executable: executable.map(|p| p.display().to_string()),
		sdk_version: Some(SDK_VERSION.to_string()),
		..Default::default()
	}
}

#[cfg(unix)]
struct Uname {
	nodename: String,
	release: String,
	version: String,
}

#[cfg(unix)]
fn uname() -> Option<Uname> {
	// SAFETY: utsname is plain old data and uname fills it on success.
	let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
	if unsafe { libc::uname(&mut uts) } != 0 {
		return None;
	}

	fn field(raw: &[libc::c_char]) -> String {
		let bytes: Vec<u8> = raw
			.iter()
			.take_while(|&&c| c != 0)
			.map(|&c| c as u8)
			.collect();
		String::from_utf8_lossy(&bytes).into_owned()
	}

	Some(Uname {
		nodename: field(&uts.nodename),
		release: field(&uts.release),
		version: field(&uts.version),
	})
}
