// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Turning raw instruction addresses into stack frames.

use std::ffi::c_void;
use std::sync::Arc;

use loom_crash_core::{CaptureError, StackFrame};
use rustc_demangle::demangle;

use crate::config::SymbolicationMode;

pub trait Symbolicator: Send + Sync {
	/// Frames for `addresses`, innermost first.
	fn symbolicate(&self, addresses: &[u64]) -> Result<Vec<StackFrame>, CaptureError>;

	/// Whether names were resolved in-process.
	fn is_local(&self) -> bool;
}

pub fn for_mode(mode: SymbolicationMode) -> Arc<dyn Symbolicator> {
	match mode {
		SymbolicationMode::Local => Arc::new(LocalSymbolicator),
		SymbolicationMode::Deferred => Arc::new(DeferredSymbolicator),
	}
}

/// Resolves symbols from the running binary's debug info.
pub struct LocalSymbolicator;

impl Symbolicator for LocalSymbolicator {
	fn symbolicate(&self, addresses: &[u64]) -> Result<Vec<StackFrame>, CaptureError> {
		let mut frames = Vec::with_capacity(addresses.len());
		let mut resolved = 0usize;

		for (index, &address) in addresses.iter().enumerate() {
			// Return addresses point past the call instruction.
			let lookup = if index == 0 {
				address
			} else {
				address.saturating_sub(1)
			};

			let mut symbols = Vec::new();
			backtrace::resolve(lookup as usize as *mut c_void, |symbol| {
				let function = symbol
					.name()
					.and_then(|name| name.as_str().map(|raw| format!("{:#}", demangle(raw))));
				symbols.push(StackFrame {
					instruction_addr: address,
					symbol_addr: symbol.addr().map(|a| a as usize as u64),
					module: function.as_deref().and_then(module_of),
					in_app: function.as_deref().map(is_in_app_frame).unwrap_or(false),
					function,
					filename: symbol.filename().map(|p| p.display().to_string()),
					lineno: symbol.lineno(),
				});
			});

			if symbols.iter().any(StackFrame::is_symbolicated) {
				resolved += 1;
			}
			if symbols.is_empty() {
				frames.push(StackFrame::from_address(address));
			} else {
				// Inlined callees come first, like a debugger shows them.
				frames.extend(symbols);
			}
		}

		if resolved == 0 && !addresses.is_empty() {
			return Err(CaptureError::Symbolication(format!(
				"no symbols resolved for {} frames",
				addresses.len()
			)));
		}
		Ok(frames)
	}

	fn is_local(&self) -> bool {
		true
	}
}

/// Leaves addresses as they are; the server symbolicates using the binary
/// image list.
pub struct DeferredSymbolicator;

impl Symbolicator for DeferredSymbolicator {
	fn symbolicate(&self, addresses: &[u64]) -> Result<Vec<StackFrame>, CaptureError> {
		Ok(addresses
			.iter()
			.map(|&address| StackFrame::from_address(address))
			.collect())
	}

	fn is_local(&self) -> bool {
		false
	}
}

/// "app::handlers::process" -> "app::handlers"
fn module_of(function: &str) -> Option<String> {
	function
		.rfind("::")
		.map(|idx| function[..idx].to_string())
		.filter(|module| !module.is_empty())
}

/// Determine if a frame is from user application code vs standard library
/// and SDK internals.
pub fn is_in_app_frame(function: &str) -> bool {
	const SYSTEM_PREFIXES: &[&str] = &[
		"std::",
		"core::",
		"alloc::",
		"<std::",
		"<core::",
		"<alloc::",
		"tokio::",
		"<tokio::",
		"futures::",
		"<futures::",
		"async_trait::",
		"tracing::",
		"<tracing::",
		"backtrace::",
		"<backtrace::",
		"loom_crash::",
		"<loom_crash::",
		"panic_unwind::",
		"<panic_unwind::",
		"rust_begin_unwind",
		"rust_panic",
		"__rust_",
		"_rust_",
		"__libc_",
		"__restore_rt",
		"_start",
		"__pthread",
		"start_thread",
	];

	const SYSTEM_CONTAINS: &[&str] = &[
		"::panic::",
		"::panicking::",
		"::thread::",
		"::rt::",
		"::runtime::",
		"::sys_common::",
	];

	!SYSTEM_PREFIXES.iter().any(|prefix| function.starts_with(prefix))
		&& !SYSTEM_CONTAINS.iter().any(|needle| function.contains(needle))
}

/// Instruction addresses of the calling thread's stack, innermost first.
pub fn current_addresses(max_frames: usize) -> (Vec<u64>, bool) {
	let mut addresses = Vec::with_capacity(max_frames);
	let mut truncated = false;
	backtrace::trace(|frame| {
		if addresses.len() == max_frames {
			truncated = true;
			return false;
		}
		addresses.push(frame.ip() as usize as u64);
		true
	});
	(addresses, truncated)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn in_app_excludes_std_and_runtime() {
		assert!(!is_in_app_frame("std::panic::panic_any"));
		assert!(!is_in_app_frame("core::panicking::panic"));
		assert!(!is_in_app_frame("alloc::vec::Vec::push"));
		assert!(!is_in_app_frame("tokio::runtime::Runtime::block_on"));
		assert!(!is_in_app_frame("loom_crash::interceptor::signal::handle_fault"));
		assert!(!is_in_app_frame("__restore_rt"));
	}

	#[test]
	fn in_app_includes_user_code() {
		assert!(is_in_app_frame("my_app::main"));
		assert!(is_in_app_frame("checkout::cart::Cart::total"));
		assert!(is_in_app_frame("loom_crash_demo::trigger"));
	}

	#[test]
	fn module_is_function_path_parent() {
		assert_eq!(
			module_of("my_app::handlers::process"),
			Some("my_app::handlers".to_string())
		);
		assert_eq!(module_of("main"), None);
	}

	#[test]
	fn deferred_keeps_raw_addresses() {
		let frames = DeferredSymbolicator.symbolicate(&[0x1000, 0x2000]).unwrap();
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[1].instruction_addr, 0x2000);
		assert!(frames.iter().all(|f| !f.is_symbolicated()));
		assert!(!DeferredSymbolicator.is_local());
	}

	#[test]
	fn current_addresses_respects_limit() {
		let (addresses, truncated) = current_addresses(2);
		assert_eq!(addresses.len(), 2);
		assert!(truncated);
	}

	#[test]
	fn local_symbolication_of_own_stack_keeps_every_address() {
		let (addresses, _) = current_addresses(64);
		// Debug info may be missing in some build profiles; only check that
		// every captured address is represented.
		if let Ok(frames) = LocalSymbolicator.symbolicate(&addresses) {
			for address in &addresses {
				assert!(frames.iter().any(|f| f.instruction_addr == *address));
			}
		}
	}
}
