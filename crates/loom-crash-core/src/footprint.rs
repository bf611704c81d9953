// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Footprints: timestamped events left by the host application before a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
	pub name: String,
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, String>,
}

impl Footprint {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			timestamp: Utc::now(),
			metadata: HashMap::new(),
		}
	}

	pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
		self.metadata = metadata;
		self
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_metadata_is_omitted() {
		let json = serde_json::to_value(Footprint::new("opened settings")).unwrap();
		assert_eq!(json["name"], "opened settings");
		assert!(json.get("metadata").is_none());
	}

	#[test]
	fn metadata_survives_serialization() {
		let mut metadata = HashMap::new();
		metadata.insert("screen".to_string(), "billing".to_string());
		let footprint = Footprint::new("navigate").with_metadata(metadata);

		let json = serde_json::to_string(&footprint).unwrap();
		let parsed: Footprint = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed, footprint);
	}
}
