// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for the Loom crash SDK.
//!
//! This crate provides:
//! - A pre-configured HTTP client builder with the SDK User-Agent header
//! - Retry logic with exponential backoff for transient failures

mod client;
mod retry;

pub use client::{builder, builder_with_user_agent, platform, user_agent};
pub use retry::{retry, RetryConfig, RetryableError};
