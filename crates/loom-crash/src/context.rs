// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Host-supplied context attached to every report.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock, TryLockError};

use loom_crash_core::{CaptureError, Footprint};

/// Attributes, user identifier and footprints set by the host application.
///
/// Writers take ordinary locks. The capture path only ever tries to lock, so
/// a fault raised while a lock is held yields a report without context
/// instead of a deadlock.
pub struct SharedContext {
	attributes: RwLock<HashMap<String, String>>,
	user_id: RwLock<Option<String>>,
	footprints: Mutex<VecDeque<Footprint>>,
	max_footprints: usize,
}

/// Copy of the context taken at capture time.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
	pub attributes: HashMap<String, String>,
	pub user_id: Option<String>,
	pub footprints: Vec<Footprint>,
}

impl SharedContext {
	pub fn new(max_footprints: usize) -> Self {
		Self {
			attributes: RwLock::new(HashMap::new()),
			user_id: RwLock::new(None),
			footprints: Mutex::new(VecDeque::new()),
			max_footprints,
		}
	}

	/// Set or, with `None`, remove an attribute.
	pub fn set_attribute(&self, key: impl Into<String>, value: Option<String>) {
		let mut attributes = self
			.attributes
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		let key = key.into();
		match value {
			Some(value) => {
				attributes.insert(key, value);
			}
			None => {
				attributes.remove(&key);
			}
		}
	}

	pub fn set_user_identifier(&self, user_id: Option<String>) {
		*self
			.user_id
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner()) = user_id;
	}

	/// Append a footprint, dropping the oldest once the ring is full.
	pub fn leave_footprint(&self, footprint: Footprint) {
		if self.max_footprints == 0 {
			return;
		}
		let mut footprints = self
			.footprints
			.lock()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		while footprints.len() >= self.max_footprints {
			footprints.pop_front();
		}
		footprints.push_back(footprint);
	}

	/// Non-blocking snapshot for the capture path.
	pub fn try_snapshot(&self) -> Result<ContextSnapshot, CaptureError> {
		let attributes = match self.attributes.try_read() {
			Ok(guard) => guard.clone(),
			Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
			Err(TryLockError::WouldBlock) => {
				return Err(CaptureError::ContextUnavailable("attributes"))
			}
		};
		let user_id = match self.user_id.try_read() {
			Ok(guard) => guard.clone(),
			Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().clone(),
			Err(TryLockError::WouldBlock) => {
				return Err(CaptureError::ContextUnavailable("user identifier"))
			}
		};
		let footprints = match self.footprints.try_lock() {
			Ok(guard) => guard.iter().cloned().collect(),
			Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().iter().cloned().collect(),
			Err(TryLockError::WouldBlock) => {
				return Err(CaptureError::ContextUnavailable("footprints"))
			}
		};

		Ok(ContextSnapshot {
			attributes,
			user_id,
			footprints,
		})
	}

	#[cfg(test)]
	pub(crate) fn with_attributes_locked_for_test(&self, f: impl FnOnce()) {
		let _guard = self.attributes.write().unwrap();
		f();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unbounded_limit_does_not_preallocate() {
		let context = SharedContext::new(usize::MAX);
		context.leave_footprint(Footprint::new("opened settings"));
		assert_eq!(context.try_snapshot().unwrap().footprints.len(), 1);
	}

	#[test]
	fn set_and_delete_attribute() {
		let context = SharedContext::new(10);
		context.set_attribute("plan", Some("pro".into()));
		context.set_attribute("region", Some("eu".into()));
		context.set_attribute("region", None);

		let snapshot = context.try_snapshot().unwrap();
		assert_eq!(snapshot.attributes.len(), 1);
		assert_eq!(snapshot.attributes.get("plan").map(String::as_str), Some("pro"));
	}

	#[test]
	fn user_identifier_can_be_cleared() {
		let context = SharedContext::new(10);
		context.set_user_identifier(Some("user-42".into()));
		assert_eq!(
			context.try_snapshot().unwrap().user_id.as_deref(),
			Some("user-42")
		);

		context.set_user_identifier(None);
		assert!(context.try_snapshot().unwrap().user_id.is_none());
	}

	#[test]
	fn footprints_keep_most_recent() {
		let context = SharedContext::new(5);
		for i in 0..10 {
			context.leave_footprint(Footprint::new(format!("step_{i}")));
		}

		let footprints = context.try_snapshot().unwrap().footprints;
		assert_eq!(footprints.len(), 5);
		assert_eq!(footprints[0].name, "step_5");
		assert_eq!(footprints[4].name, "step_9");
	}

	#[test]
	fn zero_capacity_keeps_no_footprints() {
		let context = SharedContext::new(0);
		context.leave_footprint(Footprint::new("ignored"));
		assert!(context.try_snapshot().unwrap().footprints.is_empty());
	}

	#[test]
	fn held_lock_degrades_instead_of_blocking() {
		let context = SharedContext::new(5);
		context.with_attributes_locked_for_test(|| {
			assert!(matches!(
				context.try_snapshot(),
				Err(CaptureError::ContextUnavailable("attributes"))
			));
		});
	}
}
