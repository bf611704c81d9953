// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Retry logic with exponential backoff.

use std::future::Future;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
	/// Total attempts, including the first one.
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 4,
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// A config that never retries.
	pub fn no_retry() -> Self {
		Self {
			max_attempts: 1,
			..Self::default()
		}
	}

	/// Delay before retry number `attempt` (0-based), without jitter.
	pub fn backoff_delay(&self, attempt: u32) -> Duration {
		let exponential = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
		Duration::from_secs_f64(exponential.min(self.max_delay.as_secs_f64()))
	}

	fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
		let mut delay = self.backoff_delay(attempt);
		if let Some(hint) = hint {
			delay = delay.max(hint).min(self.max_delay);
		}

		if self.jitter {
			delay.mul_f64(0.5 + fastrand::f64())
		} else {
			delay
		}
	}
}

/// Classification of errors for the retry loop.
pub trait RetryableError {
	fn is_retryable(&self) -> bool;

	/// Server-provided minimum wait (e.g. `Retry-After`).
	fn retry_after(&self) -> Option<Duration> {
		None
	}
}

const RETRYABLE_STATUSES: [StatusCode; 6] = [
	StatusCode::TOO_MANY_REQUESTS,
	StatusCode::REQUEST_TIMEOUT,
	StatusCode::INTERNAL_SERVER_ERROR,
	StatusCode::BAD_GATEWAY,
	StatusCode::SERVICE_UNAVAILABLE,
	StatusCode::GATEWAY_TIMEOUT,
];

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() {
			return true;
		}

		self
			.status()
			.map(|status| RETRYABLE_STATUSES.contains(&status))
			.unwrap_or(false)
	}
}

/// Run `f` until it succeeds, fails with a non-retryable error, or
/// `cfg.max_attempts` attempts have been made.
pub async fn retry<F, Fut, T, E>(cfg: &RetryConfig, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Display,
{
	let max_attempts = cfg.max_attempts.max(1);
	let mut attempt = 0;

	loop {
		match f().await {
			Ok(result) => return Ok(result),
			Err(err) => {
				attempt += 1;

				if !err.is_retryable() {
					warn!(error = %err, attempt, "non-retryable error encountered");
					return Err(err);
				}

				if attempt >= max_attempts {
					warn!(
						error = %err,
						attempt,
						max_attempts,
						"max retry attempts exhausted"
					);
					return Err(err);
				}

				let delay = cfg.delay_for(attempt - 1, err.retry_after());
				warn!(
					error = %err,
					attempt,
					max_attempts,
					delay_ms = delay.as_millis() as u64,
					"retrying after error"
				);

				tokio::time::sleep(delay).await;
			}
		}
	}
}
