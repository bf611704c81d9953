// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Queue entries: a report plus its delivery bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;
use crate::report::CrashReport;
use crate::ReportId;

/// Delivery state of a queued report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
	Pending,
	InFlight,
	Delivered,
	FailedPermanent,
}

impl DeliveryState {
	/// Terminal entries leave the queue.
	pub fn is_terminal(&self) -> bool {
		matches!(self, Self::Delivered | Self::FailedPermanent)
	}
}

impl fmt::Display for DeliveryState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pending => write!(f, "pending"),
			Self::InFlight => write!(f, "in_flight"),
			Self::Delivered => write!(f, "delivered"),
			Self::FailedPermanent => write!(f, "failed_permanent"),
		}
	}
}

impl FromStr for DeliveryState {
	type Err = ParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(Self::Pending),
			"in_flight" => Ok(Self::InFlight),
			"delivered" => Ok(Self::Delivered),
			"failed_permanent" => Ok(Self::FailedPermanent),
			_ => Err(ParseError::new("delivery state", s)),
		}
	}
}

/// A report owned by the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
	/// Monotonic enqueue order, also the file name prefix.
	pub sequence: u64,
	pub report: CrashReport,
	pub state: DeliveryState,
	pub attempts: u32,
	pub enqueued_at: DateTime<Utc>,
	#[serde(default)]
	pub last_attempt_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub last_error: Option<String>,
}

impl QueueEntry {
	pub fn new(sequence: u64, report: CrashReport) -> Self {
		Self {
			sequence,
			report,
			state: DeliveryState::Pending,
			attempts: 0,
			enqueued_at: Utc::now(),
			last_attempt_at: None,
			last_error: None,
		}
	}

	pub fn id(&self) -> ReportId {
		self.report.id()
	}

	pub fn is_critical(&self) -> bool {
		self.report.is_critical()
	}
}
