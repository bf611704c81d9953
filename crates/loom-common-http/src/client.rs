// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! HTTP client construction with a consistent SDK User-Agent header.

use reqwest::{Client, ClientBuilder};

/// SDK version reported in the User-Agent.
const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Creates a new HTTP client builder with the standard crash SDK User-Agent.
///
/// Callers add their own timeout before building:
///
/// ```ignore
/// let client = loom_common_http::builder()
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// ```
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Creates a new HTTP client builder with a custom User-Agent header.
pub fn builder_with_user_agent(user_agent: impl Into<String>) -> ClientBuilder {
	Client::builder().user_agent(user_agent.into())
}

/// Platform string in `{os}-{arch}` format, e.g. "linux-x86_64".
pub fn platform() -> String {
	format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Returns the standard User-Agent string.
///
/// Format: `loom-crash/{version} ({platform})`
pub fn user_agent() -> String {
	format!("loom-crash/{} ({})", SDK_VERSION, platform())
}
