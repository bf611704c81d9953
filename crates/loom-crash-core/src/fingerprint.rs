// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fingerprinting for grouping similar reports server-side.

use sha2::{Digest, Sha256};

use crate::report::{CrashReport, StackFrame};

const FINGERPRINT_FRAMES: usize = 5;

/// Compute a fingerprint for a report.
///
/// SHA256 over:
/// 1. fault type name (e.g. "SIGSEGV", "panic")
/// 2. top 5 in-app frames, or the top 5 frames if none is in-app
///
/// Unsymbolicated frames contribute their module and module-relative
/// offset so the fingerprint is stable across address space layouts.
pub fn compute_fingerprint(report: &CrashReport) -> String {
	let mut hasher = Sha256::new();

	hasher.update(report.fault().type_name().as_bytes());
	hasher.update(b"|");

	let in_app: Vec<&StackFrame> = report
		.frames()
		.iter()
		.filter(|f| f.in_app)
		.take(FINGERPRINT_FRAMES)
		.collect();

	let frames: Vec<&StackFrame> = if in_app.is_empty() {
		report.frames().iter().take(FINGERPRINT_FRAMES).collect()
	} else {
		in_app
	};

	for frame in frames {
		hasher.update(frame_key(report, frame).as_bytes());
		hasher.update(b"|");
	}

	hex::encode(hasher.finalize())
}

fn frame_key(report: &CrashReport, frame: &StackFrame) -> String {
	if let Some(function) = &frame.function {
		return match &frame.module {
			Some(module) => format!("{function}@{module}"),
			None => function.clone(),
		};
	}

	match report
		.binary_images()
		.iter()
		.find(|image| image.contains(frame.instruction_addr))
	{
		Some(image) => format!(
			"{}+{:#x}",
			image.path,
			frame.instruction_addr - image.start + image.offset
		),
		None => format!("{:#x}", frame.instruction_addr),
	}
}

/// The top in-app function, if any frame was symbolicated.
pub fn find_culprit(report: &CrashReport) -> Option<String> {
	report
		.frames()
		.iter()
		.find(|f| f.in_app)
		.and_then(|f| f.function.clone())
}

/// Truncate a string to at most `max_len` bytes, ending with "..." when cut.
///
/// Never splits a UTF-8 character.
pub fn truncate(s: &str, max_len: usize) -> String {
	if s.len() <= max_len {
		return s.to_string();
	}

	let mut end = max_len.saturating_sub(3);
	while !s.is_char_boundary(end) {
		end -= 1;
	}
	format!("{}...", &s[..end])
}
